//! Runtime configuration loading for the play session runtime.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

use crate::state::session::TimeBankRules;

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/runtime.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "PLAY_RUNTIME_CONFIG_PATH";

#[derive(Debug, Clone)]
/// Immutable runtime configuration shared across the application.
pub struct RuntimeConfig {
    /// Participant bearer-token lifetime used when a session does not override it.
    pub token_ttl_hours: u32,
    /// Participant cap applied to sessions created without an explicit one.
    pub max_participants: u32,
    /// Upper bound for every persistence gateway call.
    pub gateway_timeout: Duration,
    /// Buffer size of each per-session fan-out channel.
    pub broadcast_capacity: usize,
    /// Interval advertised to clients when realtime push is disabled.
    pub poll_interval: Duration,
    /// Heartbeat silence after which a participant is marked disconnected.
    pub stale_participant_after: Duration,
    /// Maximum number of events processed in a single trigger cascade.
    pub max_trigger_cascade: usize,
    /// Time-bank rules applied to sessions created without their own.
    pub time_bank: TimeBankRules,
}

impl RuntimeConfig {
    /// Load the configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<RawConfig>(&contents) {
                Ok(raw) => {
                    let config: Self = raw.into();
                    info!(
                        path = %path.display(),
                        gateway_timeout_ms = config.gateway_timeout.as_millis() as u64,
                        "loaded runtime config"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RawConfig::default().into()
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
/// JSON representation of the configuration file located at [`DEFAULT_CONFIG_PATH`].
struct RawConfig {
    token_ttl_hours: u32,
    max_participants: u32,
    gateway_timeout_ms: u64,
    broadcast_capacity: usize,
    poll_interval_ms: u64,
    stale_participant_secs: u64,
    max_trigger_cascade: usize,
    time_bank: RawTimeBank,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            token_ttl_hours: 24,
            max_participants: 100,
            gateway_timeout_ms: 5_000,
            broadcast_capacity: 256,
            poll_interval_ms: 3_000,
            stale_participant_secs: 60,
            max_trigger_cascade: 32,
            time_bank: RawTimeBank::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawTimeBank {
    initial: i64,
    min: i64,
    max: i64,
}

impl Default for RawTimeBank {
    fn default() -> Self {
        Self {
            initial: 300,
            min: 0,
            max: 600,
        }
    }
}

impl From<RawConfig> for RuntimeConfig {
    fn from(value: RawConfig) -> Self {
        Self {
            token_ttl_hours: value.token_ttl_hours,
            max_participants: value.max_participants.max(1),
            gateway_timeout: Duration::from_millis(value.gateway_timeout_ms.max(1)),
            broadcast_capacity: value.broadcast_capacity.max(1),
            poll_interval: Duration::from_millis(value.poll_interval_ms),
            stale_participant_after: Duration::from_secs(value.stale_participant_secs),
            max_trigger_cascade: value.max_trigger_cascade.max(1),
            time_bank: TimeBankRules {
                initial_balance: value.time_bank.initial,
                min_balance: value.time_bank.min,
                max_balance: value.time_bank.max,
            },
        }
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let raw: RawConfig =
            serde_json::from_str(r#"{"gateway_timeout_ms": 250, "time_bank": {"max": 900}}"#)
                .unwrap();
        let config: RuntimeConfig = raw.into();

        assert_eq!(config.gateway_timeout, Duration::from_millis(250));
        assert_eq!(config.token_ttl_hours, 24);
        assert_eq!(config.time_bank.initial_balance, 300);
        assert_eq!(config.time_bank.max_balance, 900);
    }

    #[test]
    fn zero_capacities_are_clamped() {
        let raw: RawConfig =
            serde_json::from_str(r#"{"broadcast_capacity": 0, "max_participants": 0}"#).unwrap();
        let config: RuntimeConfig = raw.into();

        assert_eq!(config.broadcast_capacity, 1);
        assert_eq!(config.max_participants, 1);
    }
}
