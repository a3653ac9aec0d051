//! Device configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::amount::{Amount, DEFAULT_PER_STEP_YIELD, DEFAULT_STEP_CORRECTION, parse_amount};
use crate::sync::protocol::{DeviceId, DeviceRole};

/// Invalid environment override.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid value {value:?} for {key}")]
pub struct ConfigError {
    /// Variable name.
    pub key: &'static str,
    /// Rejected value.
    pub value: String,
}

/// Per-device runtime configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Primary (phone) or companion (wrist).
    pub role: DeviceRole,
    /// Fixed device id. `None` reuses the persisted id, or mints one.
    pub device_id: Option<DeviceId>,
    /// Directory for durable snapshot files. `None` keeps state in memory only.
    pub data_path: Option<PathBuf>,
    /// Foreground idle tick.
    pub tick_interval: Duration,
    /// Peer sync cadence.
    pub sync_interval: Duration,
    /// Sensor over-count correction applied to raw step values.
    pub step_correction: Amount,
    /// Currency per awarded step.
    pub per_step_yield: Amount,
    /// How long to wait for a peer reply.
    pub peer_timeout: Duration,
    /// Consecutive failed syncs before the peer is reported unreachable.
    pub sync_failure_threshold: u32,
    /// Peer to sync with (`ws://host:port`).
    pub peer_url: Option<String>,
    /// Address to accept peer syncs on.
    pub listen_addr: Option<SocketAddr>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            role: DeviceRole::Primary,
            device_id: None,
            data_path: None,
            tick_interval: Duration::from_secs(1),
            sync_interval: Duration::from_secs(3),
            step_correction: DEFAULT_STEP_CORRECTION,
            per_step_yield: DEFAULT_PER_STEP_YIELD,
            peer_timeout: Duration::from_secs(2),
            sync_failure_threshold: 5,
            peer_url: None,
            listen_addr: None,
        }
    }
}

impl DeviceConfig {
    /// Companion defaults.
    pub fn companion() -> Self {
        Self {
            role: DeviceRole::Companion,
            ..Self::default()
        }
    }

    /// Defaults overridden by `CLICKER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns per variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let invalid = |key: &'static str, value: &str| ConfigError {
            key,
            value: value.to_string(),
        };
        let millis = |key: &'static str, value: &str| {
            value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .ok_or_else(|| invalid(key, value))
        };
        let amount = |key: &'static str, value: &str| {
            parse_amount(value)
                .filter(|a| !a.is_sign_negative())
                .ok_or_else(|| invalid(key, value))
        };

        if let Some(v) = lookup("CLICKER_ROLE") {
            config.role = match v.trim().to_ascii_lowercase().as_str() {
                "primary" | "phone" => DeviceRole::Primary,
                "companion" | "watch" => DeviceRole::Companion,
                _ => return Err(invalid("CLICKER_ROLE", &v)),
            };
        }
        if let Some(v) = lookup("CLICKER_DEVICE_ID") {
            config.device_id =
                Some(v.trim().parse().map_err(|_| invalid("CLICKER_DEVICE_ID", &v))?);
        }
        if let Some(v) = lookup("CLICKER_DATA_PATH") {
            config.data_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CLICKER_TICK_MS") {
            config.tick_interval = millis("CLICKER_TICK_MS", &v)?;
        }
        if let Some(v) = lookup("CLICKER_SYNC_MS") {
            config.sync_interval = millis("CLICKER_SYNC_MS", &v)?;
        }
        if let Some(v) = lookup("CLICKER_PEER_TIMEOUT_MS") {
            config.peer_timeout = millis("CLICKER_PEER_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("CLICKER_STEP_CORRECTION") {
            config.step_correction = amount("CLICKER_STEP_CORRECTION", &v)?;
        }
        if let Some(v) = lookup("CLICKER_PER_STEP_YIELD") {
            config.per_step_yield = amount("CLICKER_PER_STEP_YIELD", &v)?;
        }
        if let Some(v) = lookup("CLICKER_PEER_URL") {
            config.peer_url = Some(v);
        }
        if let Some(v) = lookup("CLICKER_LISTEN_ADDR") {
            config.listen_addr =
                Some(v.trim().parse().map_err(|_| invalid("CLICKER_LISTEN_ADDR", &v))?);
        }

        Ok(config)
    }
}
