// IMAP module exports the mailbox provider used by the bounce scanner
pub mod conn;
pub mod sync;
pub mod xoauth2;

use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::Credential;
use crate::error::ProviderError;
use crate::models::{EmailAccount, MessagePage, ScanPosition};

/// Source of inbound mail for one account.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// At most `page_size` messages after `position`, ascending by UID.
    async fn list_messages(
        &self,
        account: &EmailAccount,
        credential: &Credential,
        position: ScanPosition,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError>;
}

pub struct ImapProvider {
    mailbox: String,
    timeout: Duration,
}

impl ImapProvider {
    pub fn new(mailbox: impl Into<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MailboxProvider for ImapProvider {
    async fn list_messages(
        &self,
        account: &EmailAccount,
        credential: &Credential,
        position: ScanPosition,
        page_size: usize,
    ) -> Result<MessagePage, ProviderError> {
        let (host, port) = account
            .imap_endpoint()
            .ok_or_else(|| ProviderError::Connect(format!("no IMAP endpoint for {}", account.email)))?;

        let work = async {
            let mut session = conn::connect(&host, port, credential).await?;
            let page = sync::fetch_page(&mut session, &self.mailbox, position, page_size).await;
            let _ = session.logout().await;
            page
        };
        match tokio::time::timeout(self.timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Connect(format!(
                "{host}:{port} timed out after {}s",
                self.timeout.as_secs()
            ))),
        }
    }
}
