use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::config::Config;
use crate::credentials::{CredentialResolver, EnvCredentialResolver};
use crate::db::{self, SqliteStore, Store};
use crate::imap::{ImapProvider, MailboxProvider};
use crate::services::{
    BackfillJob, BounceScanner, HealthMonitor, InboxReconciler, MaintenanceJob, QuotaResetJob,
    RateLimiter,
};

/// Everything the jobs share, built once at startup and handed out as `Arc`s.
pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn MailboxProvider>,
    pub credentials: Arc<dyn CredentialResolver>,
    pub health: Arc<HealthMonitor>,
    pub limiter: Arc<RateLimiter>,
    pub reconciler: Arc<InboxReconciler>,
}

impl AppContext {
    /// Opens the database, applies migrations and wires the production adapters.
    pub async fn init(config: Config) -> Result<Self> {
        let pool = db::connect(&config.database_url, config.db_max_connections).await?;
        db::run_migrations(&pool).await?;
        tracing::info!(database = %db::normalize_sqlite_url(&config.database_url), "database ready");

        let provider = ImapProvider::new(config.imap_mailbox.clone())
            .with_timeout(Duration::from_secs(120));
        Ok(Self::from_parts(
            config,
            Arc::new(SqliteStore::new(pool)),
            Arc::new(provider),
            Arc::new(EnvCredentialResolver),
        ))
    }

    pub fn from_parts(
        config: Config,
        store: Arc<dyn Store>,
        provider: Arc<dyn MailboxProvider>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        let health = Arc::new(HealthMonitor::new(store.clone()));
        let limiter = Arc::new(RateLimiter::new(store.clone(), config.quota_rollover_hour_utc));
        let reconciler = Arc::new(InboxReconciler::new(store.clone()));
        Self {
            config,
            store,
            provider,
            credentials,
            health,
            limiter,
            reconciler,
        }
    }

    pub fn bounce_scanner(&self) -> BounceScanner {
        BounceScanner::new(
            self.store.clone(),
            self.provider.clone(),
            self.credentials.clone(),
            self.reconciler.clone(),
            self.limiter.clone(),
            self.health.clone(),
            self.config.scanner_settings(),
        )
    }

    pub fn backfill_job(&self, organization_id: Option<String>, batch_size: i64) -> BackfillJob {
        BackfillJob::new(
            self.store.clone(),
            self.reconciler.clone(),
            self.health.clone(),
            organization_id,
            batch_size,
        )
    }

    pub fn quota_reset_job(&self) -> QuotaResetJob {
        QuotaResetJob::new(self.limiter.clone(), self.health.clone())
    }

    pub fn maintenance_job(&self) -> MaintenanceJob {
        MaintenanceJob::new(
            self.store.clone(),
            self.health.clone(),
            self.config.maintenance_vacuum,
        )
    }
}
