//! Process configuration, read once from `TURNSTILE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::engine::Locale;
use crate::model::{Ms, MINUTE_MS};
use crate::store::StoreOptions;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("both TURNSTILE_TLS_CERT and TURNSTILE_TLS_KEY must be set, or neither")]
    TlsHalfConfigured,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<(PathBuf, PathBuf)>,
    pub store: StoreOptions,
    /// Grace after class end before confirmed bookings become no-shows. `None` disables the sweeper.
    pub no_show_grace: Option<Ms>,
    pub locale: Locale,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "turnstile".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls: None,
            store: StoreOptions::default(),
            no_show_grace: None,
            locale: Locale::En,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let tls = match (get("TURNSTILE_TLS_CERT"), get("TURNSTILE_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => return Err(ConfigError::TlsHalfConfigured),
        };
        let lock_timeout_ms: u64 = parsed(&get, "TURNSTILE_LOCK_TIMEOUT_MS")?
            .unwrap_or(defaults.store.lock_timeout.as_millis() as u64);
        let commit_timeout_ms: u64 = parsed(&get, "TURNSTILE_COMMIT_TIMEOUT_MS")?
            .unwrap_or(defaults.store.commit_timeout.as_millis() as u64);
        let grace_minutes: Option<i64> = parsed(&get, "TURNSTILE_NO_SHOW_GRACE_MINUTES")?;

        Ok(Self {
            port: parsed(&get, "TURNSTILE_PORT")?.unwrap_or(defaults.port),
            bind: get("TURNSTILE_BIND").unwrap_or(defaults.bind),
            data_dir: get("TURNSTILE_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("TURNSTILE_PASSWORD").unwrap_or(defaults.password),
            max_connections: parsed(&get, "TURNSTILE_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parsed(&get, "TURNSTILE_COMPACT_THRESHOLD")?.unwrap_or(defaults.compact_threshold),
            metrics_port: parsed(&get, "TURNSTILE_METRICS_PORT")?,
            tls,
            store: StoreOptions {
                lock_timeout: Duration::from_millis(lock_timeout_ms),
                commit_timeout: Duration::from_millis(commit_timeout_ms),
            },
            no_show_grace: grace_minutes.map(|m| m.max(0) * MINUTE_MS),
            locale: parsed(&get, "TURNSTILE_LOCALE")?.unwrap_or(defaults.locale),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError> {
    match get(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}
