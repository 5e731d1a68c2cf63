pub mod backfill;
pub mod bounce_classifier;
pub mod bounce_scanner;
pub mod health_monitor;
pub mod inbox_reconciler;
pub mod maintenance_service;
pub mod quota_reset;
pub mod rate_limiter;
pub mod scheduler;

pub use backfill::{BackfillJob, BackfillStats};
pub use bounce_scanner::{BounceScanner, ScanStats, ScannerSettings};
pub use health_monitor::{HealthJob, HealthMonitor};
pub use inbox_reconciler::{InboxReconciler, IngestOutcome};
pub use maintenance_service::MaintenanceJob;
pub use quota_reset::QuotaResetJob;
pub use rate_limiter::{QuotaStatus, RateLimiter, ResetReport};
pub use scheduler::{Job, JobContext, JobOptions, JobScheduler, JobState};
