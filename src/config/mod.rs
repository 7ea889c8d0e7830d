use anyhow::{Context, Result, anyhow};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::utils::mask::{MaskingMakeWriter, SecretRegistry};
use crate::utils::retry::{DEFAULT_RETRY_COUNT, DEFAULT_RETRY_INTERVAL_SECS, RetryPolicy};

pub const ENV_RETRY_COUNT: &str = "AZSQL_FIREWALL_RETRY_COUNT";
pub const ENV_RETRY_INTERVAL: &str = "AZSQL_FIREWALL_RETRY_INTERVAL_SECS";
pub const ENV_HTTP_TIMEOUT: &str = "AZSQL_FIREWALL_HTTP_TIMEOUT_SECS";
pub const ENV_CONNECT_TIMEOUT: &str = "AZSQL_FIREWALL_CONNECT_TIMEOUT_SECS";
pub const ENV_LOG: &str = "AZSQL_FIREWALL_LOG";

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub retry: RetryPolicy,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            log_filter: "info".to_string(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid value '{}' for {}", raw, key)),
        _ => Ok(default),
    }
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!("Loaded environment from {}", path.display());
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let retry_count = parse_var(&lookup, ENV_RETRY_COUNT, DEFAULT_RETRY_COUNT)?;
        if retry_count == 0 {
            return Err(anyhow!("{} must be at least 1", ENV_RETRY_COUNT));
        }
        let interval_secs = parse_var(&lookup, ENV_RETRY_INTERVAL, DEFAULT_RETRY_INTERVAL_SECS)?;
        let http_timeout = parse_var(&lookup, ENV_HTTP_TIMEOUT, DEFAULT_HTTP_TIMEOUT_SECS)?;
        let connect_timeout = parse_var(&lookup, ENV_CONNECT_TIMEOUT, DEFAULT_CONNECT_TIMEOUT_SECS)?;
        let log_filter = lookup(ENV_LOG)
            .or_else(|| lookup("RUST_LOG"))
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            retry: RetryPolicy {
                retry_count,
                interval_secs,
            },
            http_timeout: Duration::from_secs(http_timeout),
            connect_timeout: Duration::from_secs(connect_timeout),
            log_filter,
        })
    }
}

/// Installs the global fmt subscriber. Everything registered in `secrets`,
/// now or later, is masked in the output.
pub fn init_logging(config: &Config, secrets: SecretRegistry) -> Result<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("Invalid log filter '{}'", config.log_filter))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MaskingMakeWriter::new(secrets))
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;
    Ok(())
}
