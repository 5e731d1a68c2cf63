use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use super::health_monitor::HealthMonitor;
use super::inbox_reconciler::InboxReconciler;
use super::scheduler::{Job, JobContext};
use crate::db::Store;
use crate::models::ServiceStatus;

pub const SERVICE_NAME: &str = "backfill";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillStats {
    pub examined: u64,
    pub ingested: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub interrupted: bool,
    pub duration_ms: u64,
}

/// Replays historical sent mail through the reconciler. Re-running it is a no-op.
pub struct BackfillJob {
    store: Arc<dyn Store>,
    reconciler: Arc<InboxReconciler>,
    health: Arc<HealthMonitor>,
    organization_id: Option<String>,
    batch_size: i64,
}

impl BackfillJob {
    pub fn new(
        store: Arc<dyn Store>,
        reconciler: Arc<InboxReconciler>,
        health: Arc<HealthMonitor>,
        organization_id: Option<String>,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            reconciler,
            health,
            organization_id,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn run_backfill(&self, ctx: &JobContext) -> BackfillStats {
        let started = Instant::now();
        let mut stats = BackfillStats::default();
        let mut after: Option<(i64, String)> = None;

        loop {
            if ctx.is_stopping() {
                stats.interrupted = true;
                break;
            }
            let batch = match self
                .store
                .sent_history(self.organization_id.as_deref(), after.clone(), self.batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(error = %e, "reading sent history failed");
                    stats.failed += 1;
                    break;
                }
            };
            let Some(last) = batch.last() else { break };
            after = Some((last.sent_at.unwrap_or_default(), last.id.clone()));

            for send in &batch {
                stats.examined += 1;
                match self.reconciler.record_outbound(send).await {
                    Ok(outcome) if outcome.created_message => stats.ingested += 1,
                    Ok(_) => stats.duplicates += 1,
                    Err(e) if e.is_conflict() => stats.duplicates += 1,
                    Err(e) => {
                        warn!(send_id = %send.id, error = %e, "backfill row failed");
                        stats.failed += 1;
                    }
                }
            }
            if (batch.len() as i64) < self.batch_size {
                break;
            }
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            org_id = self.organization_id.as_deref().unwrap_or("*"),
            examined = stats.examined,
            ingested = stats.ingested,
            duplicates = stats.duplicates,
            failed = stats.failed,
            interrupted = stats.interrupted,
            "backfill finished"
        );
        stats
    }
}

#[async_trait]
impl Job for BackfillJob {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn run(&self, ctx: &JobContext) -> Result<()> {
        let stats = self.run_backfill(ctx).await;
        let status = if stats.interrupted {
            ServiceStatus::Interrupted
        } else if stats.failed > 0 {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Ok
        };
        self.health
            .record_heartbeat(SERVICE_NAME, status, serde_json::to_value(&stats)?)
            .await;
        if stats.failed > 0 {
            bail!("{} row(s) failed to backfill", stats.failed);
        }
        if stats.interrupted {
            bail!("backfill interrupted by shutdown");
        }
        Ok(())
    }
}
