#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;

use outreach_worker::credentials::{Credential, CredentialResolver, Secret};
use outreach_worker::db::{self, now_epoch, SqliteStore, Store};
use outreach_worker::error::{ProviderError, ScanError};
use outreach_worker::imap::MailboxProvider;
use outreach_worker::models::{EmailAccount, MessagePage, RawMessage, ScanPosition};
use outreach_worker::services::{
    BounceScanner, HealthMonitor, InboxReconciler, RateLimiter, ScannerSettings,
};

pub async fn store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().await.expect("in-memory store"))
}

/// WAL database file behind a multi-connection pool, as in production.
/// Keep the `TempDir` alive for as long as the store is used.
pub async fn file_store(max_connections: u32) -> (TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("worker.db").display());
    let pool = db::connect(&url, max_connections).await.expect("file pool");
    db::run_migrations(&pool).await.expect("migrations");
    (dir, Arc::new(SqliteStore::new(pool)))
}

pub async fn seed_org(store: &SqliteStore, id: &str) {
    sqlx::query("INSERT INTO organizations (id, name, created_at) VALUES (?, ?, ?)")
        .bind(id)
        .bind(format!("Org {id}"))
        .bind(now_epoch())
        .execute(store.pool())
        .await
        .expect("seed org");
}

pub async fn seed_account(store: &SqliteStore, id: &str, org: &str, quota: i64, sent: i64) {
    sqlx::query(
        r#"INSERT INTO email_accounts (
             id, organization_id, email, provider, imap_host, imap_port, credential_ref,
             enabled, daily_sent, daily_quota, last_reset_at, created_at, updated_at
           ) VALUES (?, ?, ?, 'custom', 'imap.test', 993, 'env:TEST_PASSWORD', 1, ?, ?, 0, ?, ?)"#,
    )
    .bind(id)
    .bind(org)
    .bind(format!("{id}@sender.example"))
    .bind(sent)
    .bind(quota)
    .bind(now_epoch())
    .bind(now_epoch())
    .execute(store.pool())
    .await
    .expect("seed account");
}

pub async fn seed_lead(store: &SqliteStore, id: &str, org: &str, email: &str) {
    sqlx::query("INSERT INTO leads (id, organization_id, email, status) VALUES (?, ?, ?, 'active')")
        .bind(id)
        .bind(org)
        .bind(email)
        .execute(store.pool())
        .await
        .expect("seed lead");
}

pub async fn seed_sent(
    store: &SqliteStore,
    id: &str,
    org: &str,
    account: &str,
    lead: Option<&str>,
    recipient: &str,
    message_id: &str,
    sent_at: i64,
) {
    sqlx::query(
        r#"INSERT INTO scheduled_sends (
             id, organization_id, account_id, lead_id, recipient, message_id_header,
             subject, status, sent_at
           ) VALUES (?, ?, ?, ?, ?, ?, 'Quick question', 'sent', ?)"#,
    )
    .bind(id)
    .bind(org)
    .bind(account)
    .bind(lead)
    .bind(recipient)
    .bind(message_id)
    .bind(sent_at)
    .execute(store.pool())
    .await
    .expect("seed scheduled send");
}

pub async fn account_counter(store: &SqliteStore, id: &str) -> i64 {
    sqlx::query_scalar("SELECT daily_sent FROM email_accounts WHERE id = ?")
        .bind(id)
        .fetch_one(store.pool())
        .await
        .expect("counter")
}

pub async fn count(store: &SqliteStore, sql: &str) -> i64 {
    sqlx::query_scalar(sql)
        .fetch_one(store.pool())
        .await
        .expect("count query")
}

/// Every account authenticates with a fixed password unless its reference is empty.
pub struct StaticCredentials;

impl CredentialResolver for StaticCredentials {
    fn resolve(&self, account: &EmailAccount) -> Result<Credential, ScanError> {
        if account.credential_ref.is_empty() {
            return Err(ScanError::FatalConfiguration {
                account_id: account.id.clone(),
                reason: "no credential reference".into(),
            });
        }
        Ok(Credential {
            username: account.email.clone(),
            secret: Secret::Password("secret".into()),
        })
    }
}

#[derive(Default)]
struct FakeMailbox {
    uid_validity: u32,
    messages: Vec<RawMessage>,
}

/// Scripted mailbox provider keyed by account id.
#[derive(Default)]
pub struct FakeProvider {
    mailboxes: Mutex<HashMap<String, FakeMailbox>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, ScanPosition)>>,
    on_list: Mutex<Option<Box<dyn Fn(&str) + Send>>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliver(&self, account_id: &str, uid: u32, raw: String) {
        let mut boxes = self.mailboxes.lock().unwrap();
        let mailbox = boxes.entry(account_id.to_string()).or_insert_with(|| FakeMailbox {
            uid_validity: 1,
            messages: Vec::new(),
        });
        mailbox.messages.push(RawMessage {
            uid,
            internal_date: Some(Utc::now()),
            raw: raw.into_bytes(),
        });
        mailbox.messages.sort_by_key(|m| m.uid);
    }

    pub fn set_uid_validity(&self, account_id: &str, uid_validity: u32) {
        let mut boxes = self.mailboxes.lock().unwrap();
        boxes.entry(account_id.to_string()).or_default().uid_validity = uid_validity;
    }

    pub fn fail(&self, account_id: &str) {
        self.failing.lock().unwrap().insert(account_id.to_string());
    }

    pub fn on_list(&self, hook: impl Fn(&str) + Send + 'static) {
        *self.on_list.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<(String, ScanPosition)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailboxProvider for FakeProvider {
    async fn list_messages(
        &self,
        account: &EmailAccount,
        _credential: &Credential,
        position: ScanPosition,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError> {
        self.calls
            .lock()
            .unwrap()
            .push((account.id.clone(), position));
        if let Some(hook) = self.on_list.lock().unwrap().as_ref() {
            hook(&account.id);
        }
        if self.failing.lock().unwrap().contains(&account.id) {
            return Err(ProviderError::Connect("connection refused".into()));
        }
        let boxes = self.mailboxes.lock().unwrap();
        let Some(mailbox) = boxes.get(&account.id) else {
            return Ok(MessagePage {
                uid_validity: 1,
                messages: Vec::new(),
            });
        };
        let messages = mailbox
            .messages
            .iter()
            .filter(|m| match position {
                ScanPosition::AfterUid(last) => m.uid > last,
                ScanPosition::Since(since) => m.internal_date.map_or(true, |d: DateTime<Utc>| d >= since),
            })
            .take(page_size)
            .cloned()
            .collect();
        Ok(MessagePage {
            uid_validity: mailbox.uid_validity.max(1),
            messages,
        })
    }
}

pub struct Harness {
    pub store: Arc<SqliteStore>,
    pub provider: Arc<FakeProvider>,
    pub health: Arc<HealthMonitor>,
    pub reconciler: Arc<InboxReconciler>,
    pub scanner: BounceScanner,
}

pub async fn harness() -> Harness {
    harness_with(ScannerSettings {
        account_pacing: Duration::ZERO,
        ..ScannerSettings::default()
    })
    .await
}

pub async fn harness_with(settings: ScannerSettings) -> Harness {
    let store = store().await;
    let provider = FakeProvider::new();
    let dyn_store: Arc<dyn Store> = store.clone();
    let health = Arc::new(HealthMonitor::new(dyn_store.clone()));
    let reconciler = Arc::new(InboxReconciler::new(dyn_store.clone()));
    let limiter = Arc::new(RateLimiter::new(dyn_store.clone(), 0));
    let scanner = BounceScanner::new(
        dyn_store,
        provider.clone(),
        Arc::new(StaticCredentials),
        reconciler.clone(),
        limiter,
        health.clone(),
        settings,
    );
    Harness {
        store,
        provider,
        health,
        reconciler,
        scanner,
    }
}

pub fn hard_bounce(bounce_id: &str, original_id: &str, recipient: &str) -> String {
    format!(
        "From: Mail Delivery System <MAILER-DAEMON@mx.example.net>\r\n\
To: sender@ours.example\r\n\
Subject: Undelivered Mail Returned to Sender\r\n\
Message-ID: <{bounce_id}>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/report; report-type=delivery-status; boundary=\"B\"\r\n\
\r\n\
--B\r\n\
Content-Type: text/plain\r\n\
\r\n\
Delivery to the following recipient failed permanently.\r\n\
\r\n\
--B\r\n\
Content-Type: message/delivery-status\r\n\
\r\n\
Final-Recipient: rfc822; {recipient}\r\n\
Action: failed\r\n\
Status: 5.1.1\r\n\
Diagnostic-Code: smtp; 550 5.1.1 user unknown\r\n\
\r\n\
--B\r\n\
Content-Type: text/rfc822-headers\r\n\
\r\n\
Message-ID: <{original_id}>\r\n\
To: {recipient}\r\n\
Subject: Quick question\r\n\
\r\n\
--B--\r\n"
    )
}

pub fn soft_bounce(bounce_id: &str, recipient: &str) -> String {
    format!(
        "From: postmaster@mx.example.net\r\n\
To: sender@ours.example\r\n\
Subject: Delivery Status Notification (Delay)\r\n\
Message-ID: <{bounce_id}>\r\n\
X-Failed-Recipients: {recipient}\r\n\
\r\n\
Delivery to {recipient} is delayed: 452 4.2.2 mailbox full, will try again later.\r\n"
    )
}

pub fn reply(message_id: &str, from: &str, in_reply_to: &str) -> String {
    format!(
        "From: {from}\r\n\
To: sender@ours.example\r\n\
Subject: Re: Quick question\r\n\
Message-ID: <{message_id}>\r\n\
In-Reply-To: <{in_reply_to}>\r\n\
References: <{in_reply_to}>\r\n\
Date: Tue, 05 Mar 2024 10:00:00 +0000\r\n\
\r\n\
Thanks, let's talk next week.\r\n"
    )
}

pub fn ambiguous(message_id: &str) -> String {
    format!(
        "From: MAILER-DAEMON@mx.example.net\r\n\
Subject: Notification\r\n\
Message-ID: <{message_id}>\r\n\
\r\n\
Your message was processed.\r\n"
    )
}
