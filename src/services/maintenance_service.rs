use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

use super::health_monitor::HealthMonitor;
use super::scheduler::{Job, JobContext};
use crate::db::Store;
use crate::models::ServiceStatus;

pub const SERVICE_NAME: &str = "db-maintenance";

/// Daily `PRAGMA optimize` / `ANALYZE`, with `VACUUM` when enabled.
pub struct MaintenanceJob {
    store: Arc<dyn Store>,
    health: Arc<HealthMonitor>,
    vacuum: bool,
}

impl MaintenanceJob {
    pub fn new(store: Arc<dyn Store>, health: Arc<HealthMonitor>, vacuum: bool) -> Self {
        Self {
            store,
            health,
            vacuum,
        }
    }
}

#[async_trait]
impl Job for MaintenanceJob {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn run(&self, _ctx: &JobContext) -> Result<()> {
        tracing::info!(vacuum = self.vacuum, "Running automated database maintenance...");
        let started = Instant::now();
        let result = self.store.maintain(self.vacuum).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(()) => {
                tracing::info!(elapsed_ms, "Database maintenance completed successfully.");
                self.health
                    .record_heartbeat(
                        SERVICE_NAME,
                        ServiceStatus::Ok,
                        json!({ "vacuum": self.vacuum, "duration_ms": elapsed_ms }),
                    )
                    .await;
            }
            Err(e) => {
                tracing::error!("Maintenance job failed: {}", e);
                self.health
                    .record_heartbeat(
                        SERVICE_NAME,
                        ServiceStatus::Failed,
                        json!({ "vacuum": self.vacuum, "error": e.to_string() }),
                    )
                    .await;
            }
        }
        Ok(result?)
    }
}
