use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::crypto::MIN_RSA_BITS;
use crate::error::AppError;

pub const DEFAULT_BIND: &str = "127.0.0.1:8787";

/// Runtime configuration, read from `RELAY_*` environment variables.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub upstream_url: String,
    pub upstream_timeout: Duration,
    pub connect_timeout: Duration,
    pub rsa_bits: usize,
    /// Zero disables the response cache.
    pub cache_ttl: Duration,
    pub rate_limit_max: usize,
    pub rate_limit_window: Duration,
    /// Empty allows any origin.
    pub allowed_origins: Vec<String>,
    /// Crash logs are written here when set.
    pub data_dir: Option<PathBuf>,
    pub log_json: bool,
}

impl RelayConfig {
    /// Read the process environment. Call `dotenvy::dotenv()` first to pick
    /// up a `.env` file.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let upstream_url = get("RELAY_UPSTREAM_URL")
            .ok_or_else(|| AppError::Config("RELAY_UPSTREAM_URL is required".into()))?;

        let rsa_bits: usize = parse_or(get("RELAY_RSA_BITS"), "RELAY_RSA_BITS", 4096)?;
        if rsa_bits < MIN_RSA_BITS {
            return Err(AppError::Config(format!(
                "RELAY_RSA_BITS must be at least {MIN_RSA_BITS}, got {rsa_bits}"
            )));
        }

        let rate_limit_max: usize = parse_or(get("RELAY_RATE_LIMIT_MAX"), "RELAY_RATE_LIMIT_MAX", 20)?;
        if rate_limit_max == 0 {
            return Err(AppError::Config("RELAY_RATE_LIMIT_MAX must be positive".into()));
        }

        Ok(Self {
            bind: parse_or(
                get("RELAY_BIND"),
                "RELAY_BIND",
                SocketAddr::from(([127, 0, 0, 1], 8787)),
            )?,
            upstream_url,
            upstream_timeout: secs(get("RELAY_UPSTREAM_TIMEOUT_SECS"), "RELAY_UPSTREAM_TIMEOUT_SECS", 120)?,
            connect_timeout: secs(get("RELAY_CONNECT_TIMEOUT_SECS"), "RELAY_CONNECT_TIMEOUT_SECS", 10)?,
            rsa_bits,
            cache_ttl: secs(get("RELAY_CACHE_TTL_SECS"), "RELAY_CACHE_TTL_SECS", 300)?,
            rate_limit_max,
            rate_limit_window: secs(
                get("RELAY_RATE_LIMIT_WINDOW_SECS"),
                "RELAY_RATE_LIMIT_WINDOW_SECS",
                60,
            )?,
            allowed_origins: get("RELAY_ALLOWED_ORIGINS")
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            data_dir: get("RELAY_DATA_DIR").map(PathBuf::from),
            log_json: get("RELAY_LOG_JSON")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }
}

fn parse_or<T>(value: Option<String>, key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| AppError::Config(format!("{key}: invalid value '{raw}': {e}"))),
    }
}

fn secs(value: Option<String>, key: &str, default: u64) -> Result<Duration, AppError> {
    parse_or(value, key, default).map(Duration::from_secs)
}
