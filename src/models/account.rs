/// Sending mailbox models
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EmailProvider {
    Gmail,
    Outlook,
    Yahoo,
    Icloud,
    #[default]
    Custom,
}

impl EmailProvider {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Gmail => "gmail",
            Self::Outlook => "outlook",
            Self::Yahoo => "yahoo",
            Self::Icloud => "icloud",
            Self::Custom => "custom",
        }
    }

    /// Default IMAP endpoint for known providers
    pub fn default_imap(&self) -> Option<(&'static str, u16)> {
        match self {
            Self::Gmail => Some(("imap.gmail.com", 993)),
            Self::Outlook => Some(("outlook.office365.com", 993)),
            Self::Yahoo => Some(("imap.mail.yahoo.com", 993)),
            Self::Icloud => Some(("imap.mail.me.com", 993)),
            Self::Custom => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AccountHealth {
    #[default]
    Healthy,
    Degraded,
    Failing,
}

impl AccountHealth {
    /// Consecutive scan failures before an account is reported as failing
    pub const FAILING_THRESHOLD: i64 = 3;

    pub fn as_str(&self) -> &str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Failing => "failing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EmailAccount {
    pub id: String,
    pub organization_id: String,
    pub email: String,
    pub provider: EmailProvider,
    pub imap_host: String,
    pub imap_port: u16,
    /// Reference into the secrets collaborator, never the secret itself
    pub credential_ref: String,
    pub enabled: bool,
    pub daily_sent: i64,
    pub daily_quota: i64,
    pub last_reset_at: i64,
    pub health_status: AccountHealth,
    pub consecutive_failures: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl EmailAccount {
    /// IMAP endpoint, falling back to the provider default when the row has no host
    pub fn imap_endpoint(&self) -> Option<(String, u16)> {
        if !self.imap_host.is_empty() {
            return Some((self.imap_host.clone(), self.imap_port));
        }
        self.provider
            .default_imap()
            .map(|(host, port)| (host.to_string(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(host: &str, provider: EmailProvider) -> EmailAccount {
        EmailAccount {
            id: "acc_1".into(),
            organization_id: "org_1".into(),
            email: "sender@example.com".into(),
            provider,
            imap_host: host.into(),
            imap_port: 1993,
            credential_ref: "env:X".into(),
            enabled: true,
            daily_sent: 0,
            daily_quota: 10,
            last_reset_at: 0,
            health_status: AccountHealth::Healthy,
            consecutive_failures: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn explicit_host_wins_over_provider_default() {
        let acc = account("mail.example.com", EmailProvider::Gmail);
        assert_eq!(acc.imap_endpoint(), Some(("mail.example.com".into(), 1993)));
    }

    #[test]
    fn provider_default_fills_missing_host() {
        let acc = account("", EmailProvider::Outlook);
        assert_eq!(
            acc.imap_endpoint(),
            Some(("outlook.office365.com".into(), 993))
        );
        assert_eq!(account("", EmailProvider::Custom).imap_endpoint(), None);
    }
}
