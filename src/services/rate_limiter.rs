use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::Store;
use crate::error::StoreResult;
use crate::models::EmailAccount;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub reset: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub sent: i64,
    pub quota: i64,
    pub remaining: i64,
    pub exhausted: bool,
}

/// Per-account daily send gate. Every mutation is a single conditional
/// statement in the store, so concurrent senders and the reset job cannot
/// lose updates.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    rollover_hour_utc: u32,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, rollover_hour_utc: u32) -> Self {
        Self {
            store,
            rollover_hour_utc: rollover_hour_utc.min(23),
        }
    }

    /// Reserves one send. Returns false, with nothing written, when the account is at quota.
    pub async fn check_and_reserve(&self, account_id: &str) -> StoreResult<bool> {
        let allowed = self.store.increment_daily_sent(account_id).await?;
        if !allowed {
            debug!(account_id = %account_id, "daily quota exhausted");
        }
        Ok(allowed)
    }

    /// Gives back a reservation whose send never happened.
    pub async fn release(&self, account_id: &str) -> StoreResult<bool> {
        self.store.decrement_daily_sent(account_id).await
    }

    /// Most recent rollover instant at or before `now`.
    pub fn rollover_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let hour = NaiveTime::from_hms_opt(self.rollover_hour_utc, 0, 0).unwrap_or(NaiveTime::MIN);
        let today = Utc.from_utc_datetime(&now.date_naive().and_time(hour));
        if today <= now {
            today
        } else {
            today - ChronoDuration::days(1)
        }
    }

    /// Zeroes every account whose counter predates the current rollover boundary.
    /// Safe to call repeatedly; accounts already reset this period are left alone.
    pub async fn reset_daily_counters(&self) -> ResetReport {
        self.reset_daily_counters_at(Utc::now()).await
    }

    pub async fn reset_daily_counters_at(&self, now: DateTime<Utc>) -> ResetReport {
        let boundary = self.rollover_boundary(now).timestamp();
        let stamp = now.timestamp();
        let mut report = ResetReport::default();

        let due = match self.store.accounts_due_for_reset(boundary).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "listing accounts due for reset failed");
                report.errors += 1;
                return report;
            }
        };

        for account_id in due {
            match self.store.reset_daily_counter(&account_id, boundary, stamp).await {
                Ok(true) => report.reset += 1,
                Ok(false) => debug!(account_id = %account_id, "already reset by a concurrent run"),
                Err(e) => {
                    warn!(account_id = %account_id, error = %e, "daily counter reset failed");
                    report.errors += 1;
                }
            }
        }
        info!(reset = report.reset, errors = report.errors, boundary, "daily counters reset");
        report
    }

    pub fn quota_status(&self, account: &EmailAccount) -> QuotaStatus {
        quota_status(account)
    }
}

pub fn quota_status(account: &EmailAccount) -> QuotaStatus {
    let remaining = (account.daily_quota - account.daily_sent).max(0);
    QuotaStatus {
        sent: account.daily_sent,
        quota: account.daily_quota,
        remaining,
        exhausted: remaining == 0,
    }
}
