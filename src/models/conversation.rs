use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Sent => "sent",
            Self::Received => "received",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ConversationType {
    Sent,
    Received,
    Mixed,
}

impl From<Direction> for ConversationType {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Sent => Self::Sent,
            Direction::Received => Self::Received,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Conversation {
    pub id: String,
    pub organization_id: String,
    /// Canonical counterpart address
    pub participant_key: String,
    pub conversation_type: ConversationType,
    pub last_activity_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConversationMessage {
    pub id: String,
    pub organization_id: String,
    pub account_id: String,
    pub conversation_id: String,
    pub message_id_header: String,
    pub thread_id: Option<String>,
    pub direction: Direction,
    pub subject: Option<String>,
    pub sent_at: i64,
    pub scheduled_send_id: Option<String>,
    pub created_at: i64,
}

/// Input to the reconciler: one physical email seen from one of our accounts.
#[derive(Debug, Clone)]
pub struct EmailEnvelope {
    pub organization_id: String,
    pub account_id: String,
    pub message_id_header: String,
    pub thread_id: Option<String>,
    /// The other side of the exchange: recipient for sent mail, sender for received
    pub counterpart: String,
    pub subject: Option<String>,
    pub sent_at: i64,
    pub scheduled_send_id: Option<String>,
}

/// Strip whitespace and the angle brackets around a Message-ID.
pub fn normalize_message_id(raw: &str) -> String {
    raw.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

pub fn participant_key(address: &str) -> String {
    normalize_message_id(address).to_lowercase()
}
