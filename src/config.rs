//! Bridge configuration parsed from environment variables.
//!
//! Resolved once in `main` and shared read-only with every relay through
//! `AppState`. Nothing on the connection path reads the environment.

use std::fmt;

pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_UPSTREAM_HOST: &str = "localhost";
pub const DEFAULT_UPSTREAM_PORT: u16 = 3490;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid {var}: {value:?} is not a valid port")]
    InvalidPort { var: &'static str, value: String },
    #[error("invalid {var}: {value:?} is not a positive integer")]
    InvalidLimit { var: &'static str, value: String },
}

/// Fixed upstream endpoint every relay dials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub listen_port: u16,
    pub upstream: UpstreamAddr,
    /// Upper bound on concurrent relays. `None` means unbounded.
    pub max_relays: Option<usize>,
}

impl BridgeConfig {
    /// Build typed bridge config from environment variables.
    ///
    /// Optional:
    /// - `PORT`: listening port, default 8080
    /// - `SERVER_HOST`: upstream host, default `localhost`
    /// - `SERVER_PORT`: upstream port, default 3490
    /// - `MAX_RELAYS`: concurrent relay cap, unbounded when absent
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`BridgeConfig::from_env`] but reads values through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_port = parse_port("PORT", lookup("PORT").as_deref(), DEFAULT_LISTEN_PORT)?;
        let host = parse_host(lookup("SERVER_HOST").as_deref());
        let port = parse_port("SERVER_PORT", lookup("SERVER_PORT").as_deref(), DEFAULT_UPSTREAM_PORT)?;
        let max_relays = parse_limit("MAX_RELAYS", lookup("MAX_RELAYS").as_deref())?;

        Ok(Self { listen_port, upstream: UpstreamAddr { host, port }, max_relays })
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            upstream: UpstreamAddr { host: DEFAULT_UPSTREAM_HOST.to_string(), port: DEFAULT_UPSTREAM_PORT },
            max_relays: None,
        }
    }
}

/// Empty values fall back to the default, same as an unset variable.
fn parse_host(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => DEFAULT_UPSTREAM_HOST.to_string(),
    }
}

fn parse_port(var: &'static str, raw: Option<&str>, default: u16) -> Result<u16, ConfigError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(default);
    };
    match raw.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ConfigError::InvalidPort { var, value: raw.to_string() }),
    }
}

fn parse_limit(var: &'static str, raw: Option<&str>) -> Result<Option<usize>, ConfigError> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    match raw.parse::<usize>() {
        Ok(limit) if limit > 0 => Ok(Some(limit)),
        _ => Err(ConfigError::InvalidLimit { var, value: raw.to_string() }),
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
