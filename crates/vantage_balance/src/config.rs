//! Configuration of the balancing fabric.
//!
//! Defaults match the documented behaviour (3 s ticks, 30 s busy window,
//! last-10 single load, peer lists of 5). Operators override them through a
//! `key = value` file with the recognised keys of [`FabricConfig::from_kv_str`].

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;
use validator::Validate;

/// Sentinel the original configuration format used for unknown loads.
/// Recognised for compatibility; unknown loads are modelled as `None`.
pub const LOAD_DONT_KNOW: i64 = 2_147_483_647;

fn deserialize_millis_to_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

/// Parameters of the balancing decision engine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct BalancingConfig {
    /// Period of the balancing tick.
    #[serde(deserialize_with = "deserialize_millis_to_duration")]
    pub delta_t: Duration,
    /// How many consecutive ticks must agree on an overload kind before the
    /// engine acts on it.
    pub overload_rechecks: u32,
    /// Below this average busy load no busy-based action fires.
    pub min_busy_load: u64,
    /// Below this average data load no data-based action fires.
    pub min_single_load: u64,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            delta_t: Duration::from_secs(3),
            overload_rechecks: 1,
            min_busy_load: 100,
            min_single_load: 10,
        }
    }
}

/// Parameters of the per-node and per-host load meters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct MeterConfig {
    /// Width of the busy-load sliding window.
    #[serde(deserialize_with = "deserialize_millis_to_duration")]
    pub busy_window: Duration,
    /// Number of samples the single-load mean runs over.
    #[validate(range(min = 1))]
    pub single_samples: usize,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self { busy_window: Duration::from_secs(30), single_samples: 10 }
    }
}

/// Parameters of the gossip estimator.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Validate)]
pub struct GossipConfig {
    /// Period of the gossip tick (suppressed while other traffic flows).
    #[serde(deserialize_with = "deserialize_millis_to_duration")]
    pub gossip_t: Duration,
    /// Size cap of each peer directory.
    #[validate(range(min = 1))]
    pub peer_list_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self { gossip_t: Duration::from_secs(3), peer_list_size: 5 }
    }
}

/// Complete configuration of one host's balancing fabric.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct FabricConfig {
    /// Decision engine parameters.
    #[validate(nested)]
    pub balancing: BalancingConfig,
    /// Load meter parameters.
    #[validate(nested)]
    pub meters: MeterConfig,
    /// Gossip parameters.
    #[validate(nested)]
    pub gossip: GossipConfig,
}

/// Configuration failures. The only fatal error class in the fabric: a host
/// refuses to start on an invalid configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// A line is not of the form `key = value`.
    #[error("configuration line {line} is not of the form `key = value`")]
    Malformed {
        /// 1-based line number.
        line: usize,
    },
    /// A value failed to parse for its key.
    #[error("configuration line {line}: invalid value {value:?} for key {key}")]
    InvalidValue {
        /// 1-based line number.
        line: usize,
        /// The recognised key.
        key: String,
        /// The offending raw value.
        value: String,
    },
    /// The key is not one of the recognised configuration keys.
    #[error("unrecognised configuration key {key:?} on line {line}")]
    UnknownKey {
        /// 1-based line number.
        line: usize,
        /// The offending key.
        key: String,
    },
    /// The assembled configuration is not usable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl FabricConfig {
    /// Parses a `key = value` configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_kv_str(&text)
    }

    /// Parses the `key = value` format. Blank lines and `#` comments are
    /// skipped. Recognised keys: `BalancingDeltaT`, `OverloadRechecks`,
    /// `BusyLoadWindowMilis`, `SingleLoadAverage`, `GossipT`, `PeerListSize`,
    /// `MinBusyLoad`, `MinSingleLoad`, `LOAD_DONT_KNOW`.
    pub fn from_kv_str(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        for (index, raw_line) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw_line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (key, value) = trimmed
                .split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or(ConfigError::Malformed { line })?;
            config.apply(line, key, value)?;
        }
        config.check()?;
        Ok(config)
    }

    fn apply(&mut self, line: usize, key: &str, value: &str) -> Result<(), ConfigError> {
        fn parse<T: std::str::FromStr>(
            line: usize,
            key: &str,
            value: &str,
        ) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::InvalidValue {
                line,
                key: key.to_string(),
                value: value.to_string(),
            })
        }

        match key {
            "BalancingDeltaT" => {
                self.balancing.delta_t = Duration::from_millis(parse(line, key, value)?);
            }
            "OverloadRechecks" => self.balancing.overload_rechecks = parse(line, key, value)?,
            "BusyLoadWindowMilis" => {
                self.meters.busy_window = Duration::from_millis(parse(line, key, value)?);
            }
            "SingleLoadAverage" => self.meters.single_samples = parse(line, key, value)?,
            "GossipT" => self.gossip.gossip_t = Duration::from_millis(parse(line, key, value)?),
            "PeerListSize" => self.gossip.peer_list_size = parse(line, key, value)?,
            "MinBusyLoad" => self.balancing.min_busy_load = parse(line, key, value)?,
            "MinSingleLoad" => self.balancing.min_single_load = parse(line, key, value)?,
            "LOAD_DONT_KNOW" => {
                let sentinel: i64 = parse(line, key, value)?;
                if sentinel != LOAD_DONT_KNOW {
                    warn!(sentinel, "nonstandard LOAD_DONT_KNOW sentinel ignored");
                }
            }
            _ => {
                return Err(ConfigError::UnknownKey { line, key: key.to_string() });
            }
        }
        Ok(())
    }

    /// Validates the assembled configuration.
    pub fn check(&self) -> Result<(), ConfigError> {
        Validate::validate(self).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.balancing.delta_t.is_zero() {
            return Err(ConfigError::Invalid("BalancingDeltaT must be positive".to_string()));
        }
        if self.meters.busy_window.is_zero() {
            return Err(ConfigError::Invalid("BusyLoadWindowMilis must be positive".to_string()));
        }
        if self.gossip.gossip_t.is_zero() {
            return Err(ConfigError::Invalid("GossipT must be positive".to_string()));
        }
        Ok(())
    }
}
