use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ServiceStatus {
    Ok,
    Degraded,
    Interrupted,
    Failed,
    Stale,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ok => "ok",
            Self::Degraded => "degraded",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
            Self::Stale => "stale",
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, Self::Failed | Self::Stale)
    }
}

/// One row per service name, overwritten on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealthRecord {
    pub service: String,
    pub status: ServiceStatus,
    pub last_heartbeat: i64,
    pub metadata: serde_json::Value,
}
