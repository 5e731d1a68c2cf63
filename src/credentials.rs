//! Turns an account's credential reference into a usable secret at scan time.
//!
//! References look like `env:VAR` (password LOGIN) or `oauth-env:VAR`
//! (XOAUTH2 bearer token). Secrets only ever live in memory.

use std::fmt;

use crate::error::ScanError;
use crate::models::EmailAccount;

#[derive(Clone)]
pub enum Secret {
    Password(String),
    OAuthToken(String),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password(_) => f.write_str("Password(***)"),
            Self::OAuthToken(_) => f.write_str("OAuthToken(***)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Credential {
    pub username: String,
    pub secret: Secret,
}

pub trait CredentialResolver: Send + Sync {
    /// Missing or malformed references are a configuration error for that account.
    fn resolve(&self, account: &EmailAccount) -> Result<Credential, ScanError>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvCredentialResolver;

impl EnvCredentialResolver {
    fn lookup(account: &EmailAccount, var: &str) -> Result<String, ScanError> {
        match std::env::var(var) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ScanError::FatalConfiguration {
                account_id: account.id.clone(),
                reason: format!("credential variable {var} is not set"),
            }),
        }
    }
}

impl CredentialResolver for EnvCredentialResolver {
    fn resolve(&self, account: &EmailAccount) -> Result<Credential, ScanError> {
        let reference = account.credential_ref.trim();
        let secret = if let Some(var) = reference.strip_prefix("oauth-env:") {
            Secret::OAuthToken(Self::lookup(account, var)?)
        } else if let Some(var) = reference.strip_prefix("env:") {
            Secret::Password(Self::lookup(account, var)?)
        } else {
            return Err(ScanError::FatalConfiguration {
                account_id: account.id.clone(),
                reason: format!("unsupported credential reference '{reference}'"),
            });
        };
        Ok(Credential {
            username: account.email.clone(),
            secret,
        })
    }
}
