use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A message as handed back by the mailbox provider.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub uid: u32,
    pub internal_date: Option<DateTime<Utc>>,
    /// Full RFC 822 source
    pub raw: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub uid_validity: u32,
    /// Ascending by UID
    pub messages: Vec<RawMessage>,
}

/// Where the next provider fetch starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPosition {
    AfterUid(u32),
    Since(DateTime<Utc>),
}

/// Per-account pointer owned by the bounce scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScanCursor {
    pub account_id: String,
    pub last_uid: u32,
    pub uid_validity: u32,
    pub updated_at: i64,
}
