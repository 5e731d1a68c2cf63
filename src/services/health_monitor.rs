use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use super::scheduler::{Job, JobContext, JobScheduler, JobState};
use crate::db::{now_epoch, Store};
use crate::error::StoreResult;
use crate::models::{AccountHealth, ServiceStatus, SystemHealthRecord};

pub const SERVICE_NAME: &str = "health-monitor";

/// Last-known status of every recurring process. Writes are best-effort:
/// a failed heartbeat is logged and never fails the job that sent it.
pub struct HealthMonitor {
    store: Arc<dyn Store>,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn record_heartbeat(
        &self,
        service: &str,
        status: ServiceStatus,
        metadata: serde_json::Value,
    ) {
        let record = SystemHealthRecord {
            service: service.to_string(),
            status,
            last_heartbeat: now_epoch(),
            metadata,
        };
        match self.store.upsert_health_record(&record).await {
            Ok(()) => debug!(service = %service, status = status.as_str(), "heartbeat recorded"),
            Err(e) => warn!(service = %service, error = %e, "heartbeat write failed"),
        }
    }

    /// Success resets the failure streak; each failure extends it.
    pub async fn record_account_result(&self, account_id: &str, ok: bool) -> Option<AccountHealth> {
        match self
            .store
            .record_account_result(account_id, ok, now_epoch())
            .await
        {
            Ok(health) => {
                if health != AccountHealth::Healthy {
                    warn!(account_id = %account_id, health = health.as_str(), "account health degraded");
                }
                Some(health)
            }
            Err(e) => {
                warn!(account_id = %account_id, error = %e, "account health write failed");
                None
            }
        }
    }

    pub async fn snapshot(&self) -> StoreResult<Vec<SystemHealthRecord>> {
        self.store.health_records().await
    }

    /// Flags each listed service whose last heartbeat is older than its own limit.
    /// Services not listed are never marked.
    pub async fn mark_stale(&self, limits: &[(String, Duration)]) -> StoreResult<u64> {
        let now = now_epoch();
        let mut marked = 0;
        for (service, limit) in limits {
            let cutoff = now - limit.as_secs() as i64;
            if self.store.mark_service_stale(service, cutoff).await? {
                info!(service = %service, limit_secs = limit.as_secs(), "service marked stale");
                marked += 1;
            }
        }
        Ok(marked)
    }
}

/// Missed intervals tolerated before a recurring job counts as stale.
const STALE_INTERVALS: u64 = 2;

/// Staleness limit per scheduled job: two of its intervals, never below `floor`.
/// One-shot services have no schedule and so no limit.
pub fn stale_limits(jobs: &[JobState], floor: Duration) -> Vec<(String, Duration)> {
    jobs.iter()
        .map(|job| {
            let limit = Duration::from_secs(job.interval_secs.saturating_mul(STALE_INTERVALS));
            (job.name.clone(), limit.max(floor))
        })
        .collect()
}

/// Scheduled sweep that ages out silent services and publishes job states.
pub struct HealthJob {
    monitor: Arc<HealthMonitor>,
    scheduler: Weak<JobScheduler>,
    stale_after: Duration,
}

impl HealthJob {
    /// `stale_after` is the minimum limit; slower jobs get a limit from their interval.
    pub fn new(monitor: Arc<HealthMonitor>, scheduler: Weak<JobScheduler>, stale_after: Duration) -> Self {
        Self {
            monitor,
            scheduler,
            stale_after,
        }
    }
}

#[async_trait]
impl Job for HealthJob {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn run(&self, _ctx: &JobContext) -> Result<()> {
        let jobs = self
            .scheduler
            .upgrade()
            .map(|s| s.job_states())
            .unwrap_or_default();
        let limits = stale_limits(&jobs, self.stale_after);
        let (status, stale) = match self.monitor.mark_stale(&limits).await {
            Ok(stale) => (ServiceStatus::Ok, stale),
            Err(e) => {
                warn!(error = %e, "stale sweep failed");
                (ServiceStatus::Degraded, 0)
            }
        };
        if stale > 0 {
            info!(stale, "services marked stale");
        }
        self.monitor
            .record_heartbeat(SERVICE_NAME, status, json!({ "stale": stale, "jobs": jobs }))
            .await;
        Ok(())
    }
}
