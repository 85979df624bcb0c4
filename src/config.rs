//! Configuration file support for adapter-prefetch
//!
//! Loads settings from `adapter-prefetch.toml` (or `$ADAPTER_PREFETCH_CONFIG`).
//! CLI arguments override config file values.

use crate::error::PoolError;
use crate::prefetch::predictor::{DEFAULT_HISTORY_WINDOW, DEFAULT_MAX_PREDICTIONS};
use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Top-level configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub pool: PoolConfig,
    pub prefetch: PrefetchConfig,
    pub transfer: TransferConfig,
    pub simulate: SimulateConfig,
}

/// Device slot pool shape
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub num_slots: usize,
    pub slot_bytes: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_slots: 8,
            slot_bytes: 4 * 1024 * 1024,
        }
    }
}

/// Predictive prefetch knobs
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchConfig {
    /// When false the pool is purely reactive: no prediction, no prefetch
    pub enable_prefetch: bool,
    /// Number of past batches the predictor remembers
    pub history_window: usize,
    /// Upper bound on adapters prefetched per batch
    pub max_predictions: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enable_prefetch: true,
            history_window: DEFAULT_HISTORY_WINDOW,
            max_predictions: DEFAULT_MAX_PREDICTIONS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferConfig {
    /// Emulated host→device bandwidth in MB/s (0 = unthrottled)
    pub bandwidth_mb_s: u64,
}

/// Synthetic traffic for `adapter-prefetch simulate`
#[derive(Debug, Clone, PartialEq)]
pub struct SimulateConfig {
    pub batches: usize,
    /// Size of the adapter catalog
    pub adapters: usize,
    /// Adapters required per batch
    pub batch_size: usize,
    /// Probability a batch repeats the previous batch's adapters
    pub reuse_probability: f64,
    /// Emulated forward-pass time per batch
    pub compute_ms: u64,
    pub seed: u64,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            batches: 200,
            adapters: 32,
            batch_size: 2,
            reuse_probability: 0.6,
            compute_ms: 2,
            seed: 42,
        }
    }
}

impl Config {
    /// Load config from default locations, falling back to defaults
    pub fn load() -> Result<Self> {
        let config_path = if let Ok(path) = std::env::var("ADAPTER_PREFETCH_CONFIG") {
            Some(PathBuf::from(path))
        } else {
            Self::find_config_file()
        };

        match config_path {
            Some(path) if path.exists() => Self::load_from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Find config file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = vec![PathBuf::from("adapter-prefetch.toml")];
        if let Some(dir) = dirs_config() {
            candidates.push(dir.join("adapter-prefetch.toml"));
        }
        candidates.into_iter().find(|c| c.exists())
    }

    /// Load and parse a TOML config file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse_toml(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse TOML content into Config (`[section]` + `key = value` subset)
    fn parse_toml(content: &str) -> Result<Self> {
        let mut config = Self::default();
        let kv_map = parse_toml_simple(content);

        for (key, value) in &kv_map {
            match key.as_str() {
                "pool.num_slots" => {
                    config.pool.num_slots = value.parse().unwrap_or(config.pool.num_slots);
                }
                "pool.slot_bytes" => {
                    config.pool.slot_bytes =
                        parse_size(value).unwrap_or(config.pool.slot_bytes);
                }
                "prefetch.enable_prefetch" => {
                    config.prefetch.enable_prefetch = value == "true";
                }
                "prefetch.history_window" => {
                    config.prefetch.history_window =
                        value.parse().unwrap_or(config.prefetch.history_window);
                }
                "prefetch.max_predictions" => {
                    config.prefetch.max_predictions =
                        value.parse().unwrap_or(config.prefetch.max_predictions);
                }
                "transfer.bandwidth_mb_s" => {
                    config.transfer.bandwidth_mb_s =
                        value.parse().unwrap_or(config.transfer.bandwidth_mb_s);
                }
                "simulate.batches" => {
                    config.simulate.batches = value.parse().unwrap_or(config.simulate.batches);
                }
                "simulate.adapters" => {
                    config.simulate.adapters = value.parse().unwrap_or(config.simulate.adapters);
                }
                "simulate.batch_size" => {
                    config.simulate.batch_size =
                        value.parse().unwrap_or(config.simulate.batch_size);
                }
                "simulate.reuse_probability" => {
                    config.simulate.reuse_probability =
                        value.parse().unwrap_or(config.simulate.reuse_probability);
                }
                "simulate.compute_ms" => {
                    config.simulate.compute_ms =
                        value.parse().unwrap_or(config.simulate.compute_ms);
                }
                "simulate.seed" => {
                    config.simulate.seed = value.parse().unwrap_or(config.simulate.seed);
                }
                _ => {} // ignore unknown keys
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject shapes the pool cannot be built with
    pub fn validate(&self) -> Result<(), PoolError> {
        let invalid = |reason: &str| {
            Err(PoolError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.pool.num_slots == 0 {
            return invalid("pool.num_slots must be at least 1");
        }
        if self.pool.slot_bytes == 0 {
            return invalid("pool.slot_bytes must be at least 1");
        }
        if self.prefetch.history_window == 0 {
            return invalid("prefetch.history_window must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.simulate.reuse_probability) {
            return invalid("simulate.reuse_probability must be within [0, 1]");
        }
        Ok(())
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        r#"# adapter-prefetch configuration file

[pool]
num_slots = 8
slot_bytes = "4M"

[prefetch]
enable_prefetch = true
history_window = 10
max_predictions = 3

[transfer]
# emulated host->device bandwidth in MB/s, 0 = unthrottled
bandwidth_mb_s = 0

[simulate]
batches = 200
adapters = 32
batch_size = 2
reuse_probability = 0.6
compute_ms = 2
seed = 42
"#
        .to_string()
    }
}

/// Parse a byte size with an optional K/M/G suffix ("4M", "512K", "1024")
pub fn parse_size(s: &str) -> Result<usize> {
    let s = s.trim().to_uppercase();
    let (num, multiplier) = if let Some(num) = s.strip_suffix('G') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('M') {
        (num, 1024 * 1024)
    } else if let Some(num) = s.strip_suffix('K') {
        (num, 1024)
    } else {
        (s.as_str(), 1)
    };
    let n: usize = num
        .trim()
        .parse()
        .with_context(|| format!("Invalid size: {}", s))?;
    if n == 0 {
        bail!("Size must be non-zero: {}", s);
    }
    Ok(n * multiplier)
}

/// Simple TOML parser: handles `[section]` headers and `key = value` pairs
fn parse_toml_simple(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut section = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            section = line[1..line.len() - 1].trim().to_string();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            let full_key = if section.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", section, key)
            };
            map.insert(full_key, value.to_string());
        }
    }
    map
}

/// Get platform config directory
fn dirs_config() -> Option<PathBuf> {
    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .map(|d| PathBuf::from(d).join("adapter-prefetch"))
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config").join("adapter-prefetch"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.prefetch.enable_prefetch);
        assert_eq!(config.prefetch.history_window, 10);
        assert_eq!(config.prefetch.max_predictions, 3);
        assert_eq!(config.pool.num_slots, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[pool]
num_slots = 4
slot_bytes = "64K"

[prefetch]
enable_prefetch = false
max_predictions = 5

[transfer]
bandwidth_mb_s = 12000
"#;
        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.pool.num_slots, 4);
        assert_eq!(config.pool.slot_bytes, 64 * 1024);
        assert!(!config.prefetch.enable_prefetch);
        assert_eq!(config.prefetch.max_predictions, 5);
        assert_eq!(config.prefetch.history_window, 10);
        assert_eq!(config.transfer.bandwidth_mb_s, 12000);
    }

    #[test]
    fn test_parse_toml_empty() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config.pool, PoolConfig::default());
    }

    #[test]
    fn test_parse_toml_comments_and_bad_values() {
        let toml = r#"
# This is a comment
[prefetch]
# history_window = 99
history_window = not-a-number
"#;
        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(config.prefetch.history_window, 10);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = Config::parse_toml("[pool]\nnum_slots = 0").unwrap_err();
        assert!(format!("{:#}", err).contains("num_slots"));

        let mut config = Config::default();
        config.prefetch.history_window = 0;
        assert!(matches!(
            config.validate(),
            Err(PoolError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_default_toml_parseable() {
        let config = Config::parse_toml(&Config::default_toml()).unwrap();
        assert_eq!(config.pool, PoolConfig::default());
        assert_eq!(config.prefetch, PrefetchConfig::default());
        assert_eq!(config.simulate, SimulateConfig::default());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4M").unwrap(), 4 * 1024 * 1024);
        assert_eq!(parse_size("512k").unwrap(), 512 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("100").unwrap(), 100);
        assert!(parse_size("abc").is_err());
        assert!(parse_size("0").is_err());
    }

    #[test]
    fn test_parse_toml_simple() {
        let content = "[section]\nkey = \"value\"\nnum = 42";
        let map = parse_toml_simple(content);
        assert_eq!(map.get("section.key").unwrap(), "value");
        assert_eq!(map.get("section.num").unwrap(), "42");
    }
}
