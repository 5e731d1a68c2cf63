use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum BounceType {
    /// Permanent failure, e.g. the address does not exist
    Hard,
    /// Temporary failure, e.g. mailbox full or greylisting
    Soft,
}

impl BounceType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Hard => "hard",
            Self::Soft => "soft",
        }
    }
}

/// Write-once record of a detected bounce, unique per (account_id, message_id).
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BounceRecord {
    pub account_id: String,
    pub message_id: String,
    pub organization_id: String,
    pub lead_id: Option<String>,
    pub bounce_type: BounceType,
    pub reason: String,
    pub failed_recipient: Option<String>,
    pub detected_at: i64,
}
