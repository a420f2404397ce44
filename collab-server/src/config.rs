//! Server configuration.
//!
//! Defaults suit local development; `ServerConfig::from_env` overrides them
//! from environment variables (a `.env` file is loaded by the binary first).

use std::time::Duration;

use crate::error::ConfigError;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Fast cache URL (None = in-process memory cache)
    pub redis_url: Option<String>,
    /// Base URL of the durable store API
    pub backend_url: String,
    /// Bearer token sent to the durable store, if any
    pub backend_api_token: Option<String>,
    /// Quiet period before a pending save is flushed to the cache
    pub save_debounce: Duration,
    /// Upper bound on how long a pending save can be pushed back
    pub save_max_debounce: Duration,
    /// Delay between the last disconnect and eviction
    pub gc_delay: Duration,
    /// TTL of `collab:doc:*` cache entries
    pub cache_ttl: Duration,
    /// WebSocket keepalive ping interval
    pub ping_interval: Duration,
    /// Presence entries not refreshed within this window are dropped
    pub awareness_timeout: Duration,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Remote shell connect timeout
    pub ssh_connect_timeout: Duration,
    /// Remote shell keepalive interval
    pub ssh_keepalive: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:1234".to_string(),
            redis_url: None,
            backend_url: "http://localhost:3000".to_string(),
            backend_api_token: None,
            save_debounce: Duration::from_millis(2000),
            save_max_debounce: Duration::from_millis(10_000),
            gc_delay: Duration::from_millis(30_000),
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            ping_interval: Duration::from_secs(30),
            awareness_timeout: Duration::from_secs(30),
            broadcast_capacity: 256,
            ssh_connect_timeout: Duration::from_secs(20),
            ssh_keepalive: Duration::from_secs(15),
        }
    }
}

impl ServerConfig {
    /// Build a configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            bind_addr: get("BIND_ADDR").unwrap_or(defaults.bind_addr),
            redis_url: get("REDIS_URL"),
            backend_url: get("BACKEND_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.backend_url),
            backend_api_token: get("BACKEND_API_TOKEN"),
            save_debounce: millis(&get, "SAVE_DEBOUNCE_MS", defaults.save_debounce)?,
            save_max_debounce: millis(&get, "SAVE_MAX_DEBOUNCE_MS", defaults.save_max_debounce)?,
            gc_delay: millis(&get, "GC_DELAY_MS", defaults.gc_delay)?,
            cache_ttl: secs(&get, "CACHE_TTL_SECS", defaults.cache_ttl)?,
            ping_interval: secs(&get, "PING_INTERVAL_SECS", defaults.ping_interval)?,
            awareness_timeout: secs(&get, "AWARENESS_TIMEOUT_SECS", defaults.awareness_timeout)?,
            broadcast_capacity: parse(&get, "BROADCAST_CAPACITY")?
                .filter(|c: &usize| *c > 0)
                .unwrap_or(defaults.broadcast_capacity),
            ssh_connect_timeout: secs(&get, "SSH_CONNECT_TIMEOUT_SECS", defaults.ssh_connect_timeout)?,
            ssh_keepalive: secs(&get, "SSH_KEEPALIVE_SECS", defaults.ssh_keepalive)?,
        })
    }
}

fn parse<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

/// Every interval must be non-zero: timers and `SET EX` reject zero.
fn nonzero<G>(get: &G, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse::<u64, _>(get, key)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        }),
        other => Ok(other),
    }
}

fn millis<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(nonzero(get, key)?.map_or(default, Duration::from_millis))
}

fn secs<G>(get: &G, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    Ok(nonzero(get, key)?.map_or(default, Duration::from_secs))
}
