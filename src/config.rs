use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::services::ScannerSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow!("unknown log format '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub http_port: u16,
    pub scan_interval: Duration,
    pub scan_initial_delay: Duration,
    pub health_interval: Duration,
    pub stale_after: Duration,
    pub org_page_size: i64,
    pub max_org_pages_per_run: u32,
    pub message_page_size: usize,
    pub max_pages_per_account: u32,
    pub account_pacing: Duration,
    pub lookback_days: i64,
    pub shutdown_timeout: Duration,
    pub quota_rollover_hour_utc: u32,
    /// Zero keeps the quota reset out of the long-running process
    pub quota_reset_interval: Duration,
    pub maintenance_interval: Duration,
    pub maintenance_vacuum: bool,
    pub imap_mailbox: String,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://outreach_worker.db".into(),
            db_max_connections: 5,
            http_port: 3030,
            scan_interval: Duration::from_secs(1800),
            scan_initial_delay: Duration::from_secs(30),
            health_interval: Duration::from_secs(60),
            stale_after: Duration::from_secs(7200),
            org_page_size: 25,
            max_org_pages_per_run: 4,
            message_page_size: 50,
            max_pages_per_account: 10,
            account_pacing: Duration::from_millis(2000),
            lookback_days: 7,
            shutdown_timeout: Duration::from_secs(30),
            quota_rollover_hour_utc: 0,
            quota_reset_interval: Duration::ZERO,
            maintenance_interval: Duration::from_secs(86400),
            maintenance_vacuum: false,
            imap_mailbox: "INBOX".into(),
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    /// Reads the process environment; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let d = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            Ok(Duration::from_secs(parse(&lookup, key, default.as_secs())?))
        };

        let quota_rollover_hour_utc = parse(&lookup, "QUOTA_ROLLOVER_HOUR_UTC", d.quota_rollover_hour_utc)?;
        if quota_rollover_hour_utc > 23 {
            return Err(anyhow!("QUOTA_ROLLOVER_HOUR_UTC must be 0-23, got {quota_rollover_hour_utc}"));
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(d.database_url),
            db_max_connections: parse(&lookup, "DB_MAX_CONNECTIONS", d.db_max_connections)?,
            http_port: parse(&lookup, "HTTP_PORT", d.http_port)?,
            scan_interval: secs("SCAN_INTERVAL_SECS", d.scan_interval)?,
            scan_initial_delay: secs("SCAN_INITIAL_DELAY_SECS", d.scan_initial_delay)?,
            health_interval: secs("HEALTH_INTERVAL_SECS", d.health_interval)?,
            stale_after: secs("STALE_AFTER_SECS", d.stale_after)?,
            org_page_size: parse(&lookup, "ORG_PAGE_SIZE", d.org_page_size)?,
            max_org_pages_per_run: parse(&lookup, "MAX_ORG_PAGES_PER_RUN", d.max_org_pages_per_run)?,
            message_page_size: parse(&lookup, "MESSAGE_PAGE_SIZE", d.message_page_size)?,
            max_pages_per_account: parse(&lookup, "MAX_PAGES_PER_ACCOUNT", d.max_pages_per_account)?,
            account_pacing: Duration::from_millis(parse(
                &lookup,
                "ACCOUNT_PACING_MS",
                d.account_pacing.as_millis() as u64,
            )?),
            lookback_days: parse(&lookup, "LOOKBACK_DAYS", d.lookback_days)?,
            shutdown_timeout: secs("SHUTDOWN_TIMEOUT_SECS", d.shutdown_timeout)?,
            quota_rollover_hour_utc,
            quota_reset_interval: secs("QUOTA_RESET_INTERVAL_SECS", d.quota_reset_interval)?,
            maintenance_interval: secs("MAINTENANCE_INTERVAL_SECS", d.maintenance_interval)?,
            maintenance_vacuum: parse_bool(&lookup, "MAINTENANCE_VACUUM", d.maintenance_vacuum)?,
            imap_mailbox: lookup("IMAP_MAILBOX")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(d.imap_mailbox),
            log_format: match lookup("LOG_FORMAT") {
                Some(v) => v.parse().context("LOG_FORMAT")?,
                None => d.log_format,
            },
        })
    }

    pub fn scanner_settings(&self) -> ScannerSettings {
        ScannerSettings {
            org_page_size: self.org_page_size.max(1),
            max_org_pages_per_run: self.max_org_pages_per_run.max(1),
            message_page_size: self.message_page_size.max(1),
            max_pages_per_account: self.max_pages_per_account.max(1),
            account_pacing: self.account_pacing,
            lookback: chrono::Duration::days(self.lookback_days.max(1)),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{key}={raw:?} is invalid: {e}")),
        _ => Ok(default),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> Result<bool> {
    match lookup(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("{key}={v:?} is not a boolean")),
        },
    }
}
