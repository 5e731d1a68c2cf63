use thiserror::Error;

/// Failures talking to the mailbox provider. All of them are retried on the next tick.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<async_imap::error::Error> for ProviderError {
    fn from(value: async_imap::error::Error) -> Self {
        match value {
            async_imap::error::Error::Io(err) => Self::Connect(err.to_string()),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(value: std::io::Error) -> Self {
        Self::Connect(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(sqlx::Error),
    /// A unique key already holds this effect
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &value {
            if db.is_unique_violation() {
                return Self::Conflict(db.message().to_string());
            }
        }
        Self::Database(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Corrupt(value.to_string())
    }
}

/// Outcome of scanning a single account; the scanner isolates each one.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("provider unavailable: {0}")]
    TransientProvider(#[from] ProviderError),
    #[error("account {account_id} misconfigured: {reason}")]
    FatalConfiguration { account_id: String, reason: String },
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl ScanError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TransientProvider(_) => "transient_provider",
            Self::FatalConfiguration { .. } => "fatal_configuration",
            Self::Storage(_) => "storage",
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
