//! Configuration loading for poster-sync.
//!
//! Configuration is loaded from a TOML file (default:
//! `<data-dir>/poster-sync.toml`). Every field has a default, and a missing
//! default file means "all defaults". Durations are in milliseconds.

use poster_sync_client::{LoopbackConfig, SyncConfig};
use poster_sync_core::Role;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE: &str = "poster-sync.toml";

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Engine timings and limits.
    pub engine: EngineConfig,
    /// Database locations.
    pub storage: StorageConfig,
    /// Loopback link used by `simulate`.
    pub simulation: SimulationConfig,
}

/// Engine configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Reassembly quiescence window (default: 1000).
    pub quiescence_window_ms: u64,
    /// Transmission attempts including the first (default: 3).
    pub retry_attempts: u32,
    /// Fixed delay between attempts (default: 2000).
    pub retry_delay_ms: u64,
    /// Settling delay before subscribing (default: 600).
    pub subscribe_settle_delay_ms: u64,
    /// Delay before the originator reads full state (default: 3000).
    pub full_state_delay_ms: u64,
    /// Unit size requested during negotiation (default: 512).
    pub preferred_unit_size: usize,
    /// Smallest acceptable unit size (default: 128).
    pub min_unit_size: usize,
    /// Back-off after a failed connection attempt (default: 5000).
    pub reconnect_backoff_ms: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Originator database, relative to the data directory.
    pub originator_db: PathBuf,
    /// Authority database, relative to the data directory.
    pub authority_db: PathBuf,
}

/// Simulation configuration.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Largest unit size the simulated link supports (default: 185).
    pub max_unit_size: usize,
    /// Pause between fragments of one write (default: 5).
    pub fragment_gap_ms: u64,
    /// How long a severed link stays down (default: 2000).
    pub outage_ms: u64,
    /// Give up if the two sides have not converged by then (default: 120000).
    pub converge_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let defaults = SyncConfig::originator();
        Self {
            quiescence_window_ms: millis(defaults.quiescence_window),
            retry_attempts: defaults.retry_attempts,
            retry_delay_ms: millis(defaults.retry_delay),
            subscribe_settle_delay_ms: millis(defaults.subscribe_settle_delay),
            full_state_delay_ms: millis(defaults.full_state_delay),
            preferred_unit_size: defaults.preferred_unit_size,
            min_unit_size: defaults.min_unit_size,
            reconnect_backoff_ms: millis(defaults.reconnect_backoff),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            originator_db: PathBuf::from("originator.db"),
            authority_db: PathBuf::from("authority.db"),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let link = LoopbackConfig::default();
        Self {
            max_unit_size: link.max_unit_size,
            fragment_gap_ms: millis(link.fragment_gap),
            outage_ms: 2000,
            converge_timeout_ms: 120_000,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Load `explicit` if given, otherwise the default file in `data_dir`
    /// if it exists, otherwise defaults.
    pub fn load(explicit: Option<&Path>, data_dir: &Path) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::from_file(path),
            None => {
                let path = data_dir.join(CONFIG_FILE);
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Engine configuration for `role`.
    pub fn sync_config(&self, role: Role) -> SyncConfig {
        let engine = &self.engine;
        SyncConfig::new(role)
            .with_quiescence_window(Duration::from_millis(engine.quiescence_window_ms))
            .with_retry(
                engine.retry_attempts,
                Duration::from_millis(engine.retry_delay_ms),
            )
            .with_settle_delay(Duration::from_millis(engine.subscribe_settle_delay_ms))
            .with_full_state_delay(Duration::from_millis(engine.full_state_delay_ms))
            .with_unit_sizes(engine.preferred_unit_size, engine.min_unit_size)
            .with_reconnect_backoff(Duration::from_millis(engine.reconnect_backoff_ms))
    }

    /// Loopback link characteristics for `simulate`.
    pub fn loopback(&self) -> LoopbackConfig {
        LoopbackConfig {
            max_unit_size: self.simulation.max_unit_size,
            fragment_gap: Duration::from_millis(self.simulation.fragment_gap_ms),
        }
    }

    /// Database path for `role`, resolved against `data_dir`.
    pub fn database(&self, role: Role, data_dir: &Path) -> PathBuf {
        let file = match role {
            Role::Originator => &self.storage.originator_db,
            Role::Authority => &self.storage.authority_db,
        };
        data_dir.join(file)
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}
