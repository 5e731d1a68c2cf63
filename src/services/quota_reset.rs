use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use super::health_monitor::HealthMonitor;
use super::rate_limiter::RateLimiter;
use super::scheduler::{Job, JobContext};
use crate::models::ServiceStatus;

pub const SERVICE_NAME: &str = "quota-reset";

pub struct QuotaResetJob {
    limiter: Arc<RateLimiter>,
    health: Arc<HealthMonitor>,
}

impl QuotaResetJob {
    pub fn new(limiter: Arc<RateLimiter>, health: Arc<HealthMonitor>) -> Self {
        Self { limiter, health }
    }
}

#[async_trait]
impl Job for QuotaResetJob {
    fn name(&self) -> &str {
        SERVICE_NAME
    }

    async fn run(&self, _ctx: &JobContext) -> Result<()> {
        let report = self.limiter.reset_daily_counters().await;
        let status = if report.errors > 0 {
            ServiceStatus::Degraded
        } else {
            ServiceStatus::Ok
        };
        self.health
            .record_heartbeat(SERVICE_NAME, status, serde_json::to_value(report)?)
            .await;
        if report.errors > 0 {
            bail!("{} account(s) failed to reset", report.errors);
        }
        Ok(())
    }
}
