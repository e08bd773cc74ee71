use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AdapterError, AdapterResult};

/// Default capacity of a store, in estimated bytes.
pub const DEFAULT_MAX_SIZE: u64 = 5 * 1024 * 1024;

/// Construction-time configuration for a
/// [`PersistentAdapter`](crate::PersistentAdapter).
///
/// Every field has a default, so a TOML file only needs the keys it changes:
///
/// ```toml
/// name = "sessions"
/// max_size = 1048576
///
/// [tuning]
/// sweep_interval_secs = 300
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Namespace of the backing database.
    pub name: String,
    /// Capacity in estimated bytes. All thresholds derive from it.
    pub max_size: u64,
    /// Emit estimator and sweep diagnostics at `info` instead of `debug`.
    pub debug_logging: bool,
    pub tuning: Tuning,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            name: "stash".into(),
            max_size: DEFAULT_MAX_SIZE,
            debug_logging: false,
            tuning: Tuning::default(),
        }
    }
}

impl AdapterConfig {
    /// Config for the namespace `name` with capacity `max_size`.
    pub fn new(name: impl Into<String>, max_size: u64) -> Self {
        Self {
            name: name.into(),
            max_size,
            ..Self::default()
        }
    }

    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    pub fn with_tuning(mut self, tuning: Tuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Parse a TOML document.
    pub fn from_toml_str(s: &str) -> AdapterResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> AdapterResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AdapterError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Check that the configuration can back a working store.
    pub fn validate(&self) -> AdapterResult<()> {
        if self.name.is_empty() {
            return Err(AdapterError::Config("name must not be empty".into()));
        }
        if self.max_size == 0 {
            return Err(AdapterError::Config("max_size must be positive".into()));
        }
        if self.tuning.freshness_threshold == 0 {
            return Err(AdapterError::Config(
                "freshness_threshold must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Capacity thresholds derived from `max_size`.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds::from_max_size(self.max_size)
    }
}

/// Timing and estimator knobs. Durations are whole seconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tuning {
    /// Minimum spacing between sweeps while the store is below the high mark.
    pub sweep_interval_secs: u64,
    /// Entries expiring within this window of "now" count as expired.
    pub expires_fudge_secs: u64,
    /// Lifetime of entries stored without an explicit expiration.
    pub default_ttl_secs: u64,
    /// Estimator updates after which `get_size` stops trusting the guess.
    pub freshness_threshold: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 15 * 60,
            expires_fudge_secs: 10,
            default_ttl_secs: 60,
            freshness_threshold: 50,
        }
    }
}

impl Tuning {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn expires_fudge(&self) -> Duration {
        Duration::from_secs(self.expires_fudge_secs)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

/// Byte thresholds derived from a store's capacity.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Thresholds {
    pub max_size: f64,
    /// A sweep is needed above this.
    pub sweep_high: f64,
    /// A sweep evicts down to this.
    pub sweep_low: f64,
    /// Largest single entry accepted.
    pub item: f64,
    /// Error bar above which a write forces a sweep.
    pub error: f64,
}

impl Thresholds {
    pub fn from_max_size(max_size: u64) -> Self {
        let max = max_size as f64;
        Self {
            max_size: max,
            sweep_high: max * 0.9,
            sweep_low: max * 0.7,
            item: max * 0.25,
            error: max * 0.5,
        }
    }
}
