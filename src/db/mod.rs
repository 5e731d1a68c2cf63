use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::StoreResult;
use crate::models::{
    AccountHealth, BounceRecord, Conversation, ConversationMessage, ConversationType, Direction,
    EmailAccount, Lead, LeadCorrelation, Organization, ScanCursor, ScheduledSend,
    SystemHealthRecord,
};

pub mod queries;

pub use queries::SqliteStore;

const MIGRATIONS: &[(&str, &str)] = &[("0001_init", include_str!("../../migrations/0001_init.sql"))];

/// Every persistent effect the jobs need. Implementations must make each
/// mutating call atomic on its own; nothing here is read-modify-write in memory.
#[async_trait]
pub trait Store: Send + Sync {
    async fn organizations(&self, limit: i64, offset: i64) -> StoreResult<Vec<Organization>>;
    async fn accounts_for_org(&self, organization_id: &str) -> StoreResult<Vec<EmailAccount>>;
    async fn account(&self, account_id: &str) -> StoreResult<Option<EmailAccount>>;

    async fn scan_cursor(&self, account_id: &str) -> StoreResult<Option<ScanCursor>>;
    async fn set_scan_cursor(&self, cursor: &ScanCursor) -> StoreResult<()>;

    /// Returns false when the (account_id, message_id) key already existed.
    async fn upsert_bounce_record(&self, record: &BounceRecord) -> StoreResult<bool>;
    async fn bounce_records(&self, account_id: &str) -> StoreResult<Vec<BounceRecord>>;
    async fn resolve_lead(
        &self,
        organization_id: &str,
        correlation: &LeadCorrelation,
    ) -> StoreResult<Option<Lead>>;
    async fn lead(&self, lead_id: &str) -> StoreResult<Option<Lead>>;
    /// Returns true only for the call that performed the transition.
    async fn set_lead_bounced(&self, lead_id: &str, at: i64) -> StoreResult<bool>;
    async fn set_lead_replied(&self, lead_id: &str, at: i64) -> StoreResult<bool>;

    async fn find_conversation_message(
        &self,
        organization_id: &str,
        message_id_header: &str,
    ) -> StoreResult<Option<ConversationMessage>>;
    async fn conversation(&self, conversation_id: &str) -> StoreResult<Option<Conversation>>;
    async fn conversation_messages(
        &self,
        conversation_id: &str,
    ) -> StoreResult<Vec<ConversationMessage>>;
    async fn begin_reconcile(&self) -> StoreResult<Box<dyn ReconcileTx>>;
    /// Sent rows ordered by (sent_at, id), strictly after `after`.
    async fn sent_history(
        &self,
        organization_id: Option<&str>,
        after: Option<(i64, String)>,
        limit: i64,
    ) -> StoreResult<Vec<ScheduledSend>>;

    /// Conditional increment; false when the account is at quota.
    async fn increment_daily_sent(&self, account_id: &str) -> StoreResult<bool>;
    async fn decrement_daily_sent(&self, account_id: &str) -> StoreResult<bool>;
    async fn accounts_due_for_reset(&self, boundary: i64) -> StoreResult<Vec<String>>;
    async fn reset_daily_counter(&self, account_id: &str, boundary: i64, now: i64)
        -> StoreResult<bool>;
    async fn record_account_result(
        &self,
        account_id: &str,
        ok: bool,
        now: i64,
    ) -> StoreResult<AccountHealth>;

    async fn upsert_health_record(&self, record: &SystemHealthRecord) -> StoreResult<()>;
    async fn health_records(&self) -> StoreResult<Vec<SystemHealthRecord>>;
    /// True when this call moved the service to `stale`.
    async fn mark_service_stale(&self, service: &str, older_than: i64) -> StoreResult<bool>;

    async fn maintain(&self, vacuum: bool) -> StoreResult<()>;
}

/// One atomic reconciliation unit. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait ReconcileTx: Send {
    async fn find_message(
        &mut self,
        organization_id: &str,
        message_id_header: &str,
    ) -> StoreResult<Option<ConversationMessage>>;
    async fn conversation(&mut self, conversation_id: &str) -> StoreResult<Option<Conversation>>;
    /// Thread mapping first, then the (organization, participant) row; creates on miss.
    async fn find_or_create_conversation(
        &mut self,
        organization_id: &str,
        thread_id: Option<&str>,
        participant_key: &str,
        initial_type: ConversationType,
        at: i64,
    ) -> StoreResult<Conversation>;
    /// Returns false when the dedup key is already taken.
    async fn insert_message(&mut self, message: &ConversationMessage) -> StoreResult<bool>;
    async fn advance_activity(
        &mut self,
        conversation_id: &str,
        at: i64,
        direction: Direction,
    ) -> StoreResult<Conversation>;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
    async fn rollback(self: Box<Self>);
}

pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool> {
    let url = normalize_sqlite_url(database_url);
    if let Some(path) = db_file_path(&url) {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10))
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for (name, sql) in MIGRATIONS {
        sqlx::raw_sql(sql).execute(pool).await?;
        tracing::debug!(migration = %name, "migration applied");
    }
    Ok(())
}

pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Accepts sqlite:foo.db, sqlite://foo.db, file:foo.db or a bare path.
pub fn normalize_sqlite_url(input: &str) -> String {
    if input.starts_with("sqlite://") || input.starts_with("sqlite::memory:") {
        return input.to_string();
    }
    if let Some(rest) = input.strip_prefix("sqlite:") {
        return format!("sqlite://{}", rest.trim_start_matches('/'));
    }
    if let Some(rest) = input.strip_prefix("file:") {
        return format!("sqlite://{}", rest);
    }
    format!("sqlite://{}", input)
}

fn db_file_path(url: &str) -> Option<std::path::PathBuf> {
    let rest = url.strip_prefix("sqlite://")?;
    let rest = rest.split('?').next().unwrap_or(rest);
    if rest.is_empty() || rest == ":memory:" {
        return None;
    }
    Some(std::path::PathBuf::from(rest))
}
