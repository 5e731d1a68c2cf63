pub mod account;
pub mod bounce;
pub mod conversation;
pub mod health;
pub mod lead;
pub mod message;

pub use account::{AccountHealth, EmailAccount, EmailProvider};
pub use bounce::{BounceRecord, BounceType};
pub use conversation::{
    Conversation, ConversationMessage, ConversationType, Direction, EmailEnvelope,
};
pub use health::{ServiceStatus, SystemHealthRecord};
pub use lead::{Lead, LeadCorrelation, LeadStatus, Organization, ScheduledSend};
pub use message::{MessagePage, RawMessage, ScanCursor, ScanPosition};
