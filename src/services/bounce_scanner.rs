use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::bounce_classifier::{self, BounceEvidence, Classification, InboundMessage};
use super::health_monitor::HealthMonitor;
use super::inbox_reconciler::{received_thread_hint, InboxReconciler};
use super::rate_limiter::RateLimiter;
use super::scheduler::{Job, JobContext};
use crate::credentials::CredentialResolver;
use crate::db::{now_epoch, Store};
use crate::error::ScanError;
use crate::imap::MailboxProvider;
use crate::models::{
    BounceRecord, BounceType, Direction, EmailAccount, EmailEnvelope, LeadCorrelation, LeadStatus,
    Organization, RawMessage, ScanCursor, ScanPosition, ServiceStatus,
};

pub const SERVICE_NAME: &str = "bounce-scanner";

#[derive(Debug, Clone)]
pub struct ScannerSettings {
    pub org_page_size: i64,
    pub max_org_pages_per_run: u32,
    pub message_page_size: usize,
    pub max_pages_per_account: u32,
    pub account_pacing: Duration,
    pub lookback: chrono::Duration,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            org_page_size: 25,
            max_org_pages_per_run: 4,
            message_page_size: 50,
            max_pages_per_account: 10,
            account_pacing: Duration::from_secs(2),
            lookback: chrono::Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub organizations_processed: u64,
    pub organizations_failed: u64,
    pub accounts_scanned: u64,
    pub accounts_skipped: u64,
    pub accounts_failed: u64,
    pub messages_examined: u64,
    pub bounces_found: u64,
    pub hard_bounces: u64,
    pub soft_bounces: u64,
    pub duplicate_bounces: u64,
    pub leads_bounced: u64,
    pub unmatched_bounces: u64,
    pub replies_ingested: u64,
    pub ambiguous: u64,
    pub quota_exhausted_accounts: u64,
    /// Failing organizations, plus listing failures outside any organization
    pub errors: u64,
    pub duration_ms: u64,
    pub interrupted: bool,
}

impl ScanStats {
    pub fn heartbeat_status(&self) -> ServiceStatus {
        if self.interrupted {
            ServiceStatus::Interrupted
        } else if self.errors > 0 {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Ok
        }
    }
}

/// Polls every account's mailbox for delivery failures and replies.
///
/// Organizations and their accounts are walked in one ordered pass with a
/// pause between accounts. A failure is contained to the account it
/// happened in; the cursor only moves once a page is fully persisted, so a
/// crash at any point replays the page and the unique keys absorb repeats.
pub struct BounceScanner {
    store: Arc<dyn Store>,
    provider: Arc<dyn MailboxProvider>,
    credentials: Arc<dyn CredentialResolver>,
    reconciler: Arc<InboxReconciler>,
    limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
    settings: ScannerSettings,
    /// Where the next run starts in the organization listing
    org_offset: AtomicI64,
}

enum AccountOutcome {
    Completed,
    Interrupted,
}

impl BounceScanner {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn MailboxProvider>,
        credentials: Arc<dyn CredentialResolver>,
        reconciler: Arc<InboxReconciler>,
        limiter: Arc<RateLimiter>,
        health: Arc<HealthMonitor>,
        settings: ScannerSettings,
    ) -> Self {
        Self {
            store,
            provider,
            credentials,
            reconciler,
            limiter,
            health,
            settings,
            org_offset: AtomicI64::new(0),
        }
    }

    pub async fn run_scan(&self, ctx: &JobContext) -> ScanStats {
        let started = Instant::now();
        let mut stats = ScanStats::default();
        let page_size = self.settings.org_page_size.max(1);
        let start = self.org_offset.load(Ordering::Acquire);
        let mut offset = start;
        let mut wrapped = false;
        let mut paced = false;

        for _ in 0..self.settings.max_org_pages_per_run {
            if wrapped && offset >= start {
                break;
            }
            if ctx.is_stopping() {
                stats.interrupted = true;
                break;
            }
            let orgs = match self.store.organizations(page_size, offset).await {
                Ok(orgs) => orgs,
                Err(e) => {
                    warn!(offset, error = %e, "listing organizations failed");
                    stats.errors += 1;
                    break;
                }
            };
            let count = orgs.len() as i64;
            if count > 0 {
                let mut stopped = false;
                for org in &orgs {
                    if !self.scan_organization(ctx, org, &mut stats, &mut paced).await {
                        stopped = true;
                        break;
                    }
                }
                if stopped {
                    stats.interrupted = true;
                    break;
                }
                offset += count;
            }
            if count < page_size {
                // End of the listing: wrap once so later organizations are not starved.
                offset = 0;
                if wrapped || start == 0 {
                    break;
                }
                wrapped = true;
            }
        }
        self.org_offset.store(offset, Ordering::Release);

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            orgs = stats.organizations_processed,
            accounts = stats.accounts_scanned,
            messages = stats.messages_examined,
            bounces = stats.bounces_found,
            replies = stats.replies_ingested,
            errors = stats.errors,
            interrupted = stats.interrupted,
            duration_ms = stats.duration_ms,
            "bounce scan finished"
        );
        let metadata = serde_json::to_value(&stats).unwrap_or_default();
        self.health
            .record_heartbeat(SERVICE_NAME, stats.heartbeat_status(), metadata)
            .await;
        stats
    }

    /// Returns false when shutdown interrupted the organization.
    async fn scan_organization(
        &self,
        ctx: &JobContext,
        org: &Organization,
        stats: &mut ScanStats,
        paced: &mut bool,
    ) -> bool {
        let accounts = match self.store.accounts_for_org(&org.id).await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(org_id = %org.id, error = %e, "listing accounts failed");
                stats.errors += 1;
                stats.organizations_failed += 1;
                return true;
            }
        };

        let mut org_failed = false;
        let mut completed = true;
        for account in &accounts {
            if ctx.is_stopping() {
                completed = false;
                break;
            }
            if !account.enabled {
                stats.accounts_skipped += 1;
                continue;
            }
            if *paced && !ctx.pause(self.settings.account_pacing).await {
                completed = false;
                break;
            }
            *paced = true;

            if self.limiter.quota_status(account).exhausted {
                stats.quota_exhausted_accounts += 1;
            }

            match self.scan_account(ctx, org, account, stats).await {
                Ok(outcome) => {
                    stats.accounts_scanned += 1;
                    self.health.record_account_result(&account.id, true).await;
                    if matches!(outcome, AccountOutcome::Interrupted) {
                        completed = false;
                        break;
                    }
                }
                Err(e) => {
                    stats.accounts_failed += 1;
                    org_failed = true;
                    if matches!(e, ScanError::FatalConfiguration { .. }) {
                        stats.accounts_skipped += 1;
                    }
                    warn!(
                        org_id = %org.id,
                        account_id = %account.id,
                        kind = e.kind(),
                        error = %e,
                        "account scan failed"
                    );
                    self.health.record_account_result(&account.id, false).await;
                }
            }
        }

        if completed {
            stats.organizations_processed += 1;
        }
        if org_failed {
            stats.organizations_failed += 1;
            stats.errors += 1;
        }
        completed
    }

    async fn scan_account(
        &self,
        ctx: &JobContext,
        org: &Organization,
        account: &EmailAccount,
        stats: &mut ScanStats,
    ) -> Result<AccountOutcome, ScanError> {
        if account.imap_endpoint().is_none() {
            return Err(ScanError::FatalConfiguration {
                account_id: account.id.clone(),
                reason: "no IMAP host configured".into(),
            });
        }
        let credential = self.credentials.resolve(account)?;
        let cursor = self.store.scan_cursor(&account.id).await?;
        let lookback = ScanPosition::Since(Utc::now() - self.settings.lookback);

        let mut known_validity = cursor.as_ref().map(|c| c.uid_validity);
        let mut position = cursor
            .as_ref()
            .map(|c| ScanPosition::AfterUid(c.last_uid))
            .unwrap_or(lookback);
        let page_size = self.settings.message_page_size.max(1);

        for page_no in 0..self.settings.max_pages_per_account.max(1) {
            if page_no > 0 && ctx.is_stopping() {
                return Ok(AccountOutcome::Interrupted);
            }
            let mut page = self
                .provider
                .list_messages(account, &credential, position, page_size)
                .await?;
            if let Some(expected) = known_validity {
                if expected != page.uid_validity {
                    warn!(
                        account_id = %account.id,
                        old = expected,
                        new = page.uid_validity,
                        "UIDVALIDITY changed, rescanning lookback window"
                    );
                    known_validity = None;
                    position = lookback;
                    page = self
                        .provider
                        .list_messages(account, &credential, position, page_size)
                        .await?;
                }
            }

            let Some(last_uid) = page.messages.last().map(|m| m.uid) else {
                break;
            };
            for message in &page.messages {
                self.process_message(org, account, page.uid_validity, message, stats)
                    .await?;
            }

            self.store
                .set_scan_cursor(&ScanCursor {
                    account_id: account.id.clone(),
                    last_uid,
                    uid_validity: page.uid_validity,
                    updated_at: now_epoch(),
                })
                .await?;
            debug!(account_id = %account.id, last_uid, count = page.messages.len(), "page persisted");
            known_validity = Some(page.uid_validity);
            position = ScanPosition::AfterUid(last_uid);

            if page.messages.len() < page_size {
                break;
            }
        }

        if ctx.is_stopping() {
            return Ok(AccountOutcome::Interrupted);
        }
        Ok(AccountOutcome::Completed)
    }

    async fn process_message(
        &self,
        org: &Organization,
        account: &EmailAccount,
        uid_validity: u32,
        raw: &RawMessage,
        stats: &mut ScanStats,
    ) -> Result<(), ScanError> {
        stats.messages_examined += 1;
        let Some(classified) = bounce_classifier::classify(&raw.raw) else {
            debug!(account_id = %account.id, uid = raw.uid, "unparseable message skipped");
            return Ok(());
        };
        let message_key = classified
            .message
            .message_id
            .clone()
            .unwrap_or_else(|| format!("uid:{uid_validity}:{}", raw.uid));

        match classified.classification {
            Classification::Bounce(evidence) => {
                self.record_bounce(org, account, &message_key, evidence, stats)
                    .await
            }
            Classification::Ambiguous { reason } => {
                stats.ambiguous += 1;
                info!(
                    org_id = %org.id,
                    account_id = %account.id,
                    message_id = %message_key,
                    reason = %reason,
                    "bounce-like message needs manual review"
                );
                Ok(())
            }
            Classification::NotABounce => {
                self.record_reply(org, account, raw, &classified.message, stats)
                    .await
            }
        }
    }

    async fn record_bounce(
        &self,
        org: &Organization,
        account: &EmailAccount,
        message_key: &str,
        evidence: BounceEvidence,
        stats: &mut ScanStats,
    ) -> Result<(), ScanError> {
        stats.bounces_found += 1;
        match evidence.bounce_type {
            BounceType::Hard => stats.hard_bounces += 1,
            BounceType::Soft => stats.soft_bounces += 1,
        }

        let correlation = LeadCorrelation {
            referenced_message_ids: evidence.original_message_ids,
            address: evidence.failed_recipient.clone(),
        };
        let lead = if correlation.is_empty() {
            None
        } else {
            self.store.resolve_lead(&org.id, &correlation).await?
        };

        let detected_at = now_epoch();
        let record = BounceRecord {
            account_id: account.id.clone(),
            message_id: message_key.to_string(),
            organization_id: org.id.clone(),
            lead_id: lead.as_ref().map(|l| l.id.clone()),
            bounce_type: evidence.bounce_type,
            reason: evidence.reason,
            failed_recipient: evidence.failed_recipient,
            detected_at,
        };
        let inserted = match self.store.upsert_bounce_record(&record).await {
            Ok(inserted) => inserted,
            Err(e) if e.is_conflict() => false,
            Err(e) => return Err(e.into()),
        };
        if !inserted {
            stats.duplicate_bounces += 1;
        }

        // Runs for duplicates too, so a crash between the two writes heals on replay.
        match lead {
            Some(lead) => {
                if self.store.set_lead_bounced(&lead.id, detected_at).await? {
                    stats.leads_bounced += 1;
                    info!(
                        org_id = %org.id,
                        lead_id = %lead.id,
                        bounce_type = record.bounce_type.as_str(),
                        "lead marked bounced"
                    );
                }
            }
            None => {
                stats.unmatched_bounces += 1;
                debug!(org_id = %org.id, message_id = %message_key, "bounce matched no lead");
            }
        }
        Ok(())
    }

    async fn record_reply(
        &self,
        org: &Organization,
        account: &EmailAccount,
        raw: &RawMessage,
        message: &InboundMessage,
        stats: &mut ScanStats,
    ) -> Result<(), ScanError> {
        let (Some(message_id), Some(from)) = (&message.message_id, &message.from) else {
            return Ok(());
        };
        if from.eq_ignore_ascii_case(&account.email) {
            return Ok(());
        }

        let mut referenced = Vec::new();
        if let Some(parent) = &message.in_reply_to {
            referenced.push(parent.clone());
        }
        referenced.extend(message.references.iter().rev().cloned());
        let correlation = LeadCorrelation {
            referenced_message_ids: referenced,
            address: Some(from.clone()),
        };
        let Some(lead) = self.store.resolve_lead(&org.id, &correlation).await? else {
            return Ok(());
        };

        let sent_at = message
            .date
            .or_else(|| raw.internal_date.map(|d| d.timestamp()))
            .unwrap_or_else(now_epoch);
        let envelope = EmailEnvelope {
            organization_id: org.id.clone(),
            account_id: account.id.clone(),
            message_id_header: message_id.clone(),
            thread_id: received_thread_hint(&message.references, message.in_reply_to.as_deref()),
            counterpart: from.clone(),
            subject: message.subject.clone(),
            sent_at,
            scheduled_send_id: None,
        };
        let outcome = match self.reconciler.ingest_email(&envelope, Direction::Received).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_conflict() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if outcome.created_message {
            stats.replies_ingested += 1;
        }

        if message.auto_reply || lead.status == LeadStatus::Bounced {
            return Ok(());
        }
        if self.store.set_lead_replied(&lead.id, sent_at).await? {
            info!(org_id = %org.id, lead_id = %lead.id, conversation_id = %outcome.conversation.id, "lead replied");
        }
        Ok(())
    }
}

#[async_trait]
impl Job for BounceScanner {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        self.run_scan(ctx).await;
        Ok(())
    }
}
