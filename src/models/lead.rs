use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum LeadStatus {
    Active,
    Replied,
    /// Terminal: no later classification moves a lead out of this state
    Bounced,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Lead {
    pub id: String,
    pub organization_id: String,
    pub email: String,
    pub status: LeadStatus,
    pub bounced_at: Option<i64>,
    pub replied_at: Option<i64>,
}

/// Clues a bounce or reply carries about which lead it belongs to.
#[derive(Debug, Clone, Default)]
pub struct LeadCorrelation {
    /// Message-IDs of our own outbound mail referenced by the inbound message
    pub referenced_message_ids: Vec<String>,
    /// Address the lead is expected to have
    pub address: Option<String>,
}

impl LeadCorrelation {
    pub fn is_empty(&self) -> bool {
        self.referenced_message_ids.is_empty() && self.address.is_none()
    }
}

/// A row written by the send path when a campaign email goes out.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduledSend {
    pub id: String,
    pub organization_id: String,
    pub account_id: String,
    pub lead_id: Option<String>,
    pub recipient: String,
    pub message_id_header: Option<String>,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub status: String,
    pub sent_at: Option<i64>,
}
