//! TOML/environment configuration loading.
//!
//! Programmatic construction goes through [`StoreSettings`]; this module
//! layers a file- and environment-driven path on top for deployments:
//! `TIDEKV_CONFIG` points at a TOML file, and `TIDEKV__section__field`
//! variables override individual fields.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::cache::ReadCacheConfig;
use crate::checkpoint::CheckpointVariant;
use crate::store::{CheckpointSettings, StoreSettings};

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// Top-level configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TideKvConfig {
    pub store: Option<StoreSection>,
    pub log: Option<LogSection>,
    pub cache: Option<CacheSection>,
    pub checkpoint: Option<CheckpointSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreSection {
    /// Number of hash buckets.
    pub hash_table_size: Option<u64>,
    /// Exclude pending operations from checkpoints.
    pub relaxed_cpr: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    pub page_bits: Option<u32>,
    pub memory_bits: Option<u32>,
    pub segment_bits: Option<u32>,
    pub mutable_fraction: Option<f64>,
    pub copy_reads_to_tail: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSection {
    pub enabled: Option<bool>,
    pub page_bits: Option<u32>,
    pub memory_bits: Option<u32>,
    pub second_chance_fraction: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckpointSection {
    pub dir: Option<PathBuf>,
    /// "fold_over" or "snapshot".
    pub variant: Option<String>,
}

impl TideKvConfig {
    /// Load from a TOML file.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Load from `TIDEKV_CONFIG` (if set), then apply env overrides.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = match env::var("TIDEKV_CONFIG").ok() {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Apply `TIDEKV__section__field` overrides in place.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        for (key, value) in env::vars() {
            let Some(path) = key.strip_prefix("TIDEKV__") else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let value = value.trim().to_string();
            match path.split("__").collect::<Vec<_>>().as_slice() {
                ["store", "hash_table_size"] => {
                    self.store_mut().hash_table_size = Some(parse_value(&key, &value)?);
                }
                ["store", "relaxed_cpr"] => {
                    self.store_mut().relaxed_cpr = Some(parse_value(&key, &value)?);
                }
                ["log", "page_bits"] => {
                    self.log_mut().page_bits = Some(parse_value(&key, &value)?);
                }
                ["log", "memory_bits"] => {
                    self.log_mut().memory_bits = Some(parse_value(&key, &value)?);
                }
                ["log", "segment_bits"] => {
                    self.log_mut().segment_bits = Some(parse_value(&key, &value)?);
                }
                ["log", "mutable_fraction"] => {
                    self.log_mut().mutable_fraction = Some(parse_value(&key, &value)?);
                }
                ["log", "copy_reads_to_tail"] => {
                    self.log_mut().copy_reads_to_tail = Some(parse_value(&key, &value)?);
                }
                ["cache", "enabled"] => {
                    self.cache_mut().enabled = Some(parse_value(&key, &value)?);
                }
                ["cache", "page_bits"] => {
                    self.cache_mut().page_bits = Some(parse_value(&key, &value)?);
                }
                ["cache", "memory_bits"] => {
                    self.cache_mut().memory_bits = Some(parse_value(&key, &value)?);
                }
                ["cache", "second_chance_fraction"] => {
                    self.cache_mut().second_chance_fraction = Some(parse_value(&key, &value)?);
                }
                ["checkpoint", "dir"] => {
                    self.checkpoint_mut().dir = Some(PathBuf::from(value));
                }
                ["checkpoint", "variant"] => {
                    self.checkpoint_mut().variant = Some(value);
                }
                _ => return Err(ConfigError::UnknownKey(key)),
            }
        }
        Ok(())
    }

    /// Build `StoreSettings` from defaults plus this configuration.
    pub fn to_store_settings(&self) -> Result<StoreSettings, ConfigError> {
        let mut settings = StoreSettings::new(
            self.store
                .as_ref()
                .and_then(|s| s.hash_table_size)
                .unwrap_or(1 << 20),
        );
        if let Some(store) = &self.store {
            if let Some(relaxed) = store.relaxed_cpr {
                settings.relaxed_cpr = relaxed;
            }
        }
        if let Some(log) = &self.log {
            if let Some(v) = log.page_bits {
                settings.log.page_bits = v;
            }
            if let Some(v) = log.memory_bits {
                settings.log.memory_bits = v;
            }
            if let Some(v) = log.segment_bits {
                settings.log.segment_bits = v;
            }
            if let Some(v) = log.mutable_fraction {
                settings.log.mutable_fraction = v;
            }
            if let Some(v) = log.copy_reads_to_tail {
                settings.log.copy_reads_to_tail = v;
            }
        }
        if let Some(cache) = &self.cache {
            if cache.enabled == Some(true) {
                let mut config = ReadCacheConfig::default();
                if let Some(v) = cache.page_bits {
                    config.page_bits = v;
                }
                if let Some(v) = cache.memory_bits {
                    config.memory_bits = v;
                }
                if let Some(v) = cache.second_chance_fraction {
                    config.second_chance_fraction = v;
                }
                settings.log.read_cache = Some(config);
            }
        }
        if let Some(checkpoint) = &self.checkpoint {
            if let Some(dir) = &checkpoint.dir {
                let mut cs = CheckpointSettings::directory(dir.clone());
                if let Some(variant) = &checkpoint.variant {
                    cs.variant = match variant.to_ascii_lowercase().as_str() {
                        "fold_over" | "foldover" => CheckpointVariant::FoldOver,
                        "snapshot" => CheckpointVariant::Snapshot,
                        other => {
                            return Err(ConfigError::InvalidValue {
                                key: "checkpoint.variant".into(),
                                value: other.into(),
                            })
                        }
                    };
                }
                settings.checkpoint = Some(cs);
            }
        }
        Ok(settings)
    }

    fn store_mut(&mut self) -> &mut StoreSection {
        self.store.get_or_insert_with(StoreSection::default)
    }

    fn log_mut(&mut self) -> &mut LogSection {
        self.log.get_or_insert_with(LogSection::default)
    }

    fn cache_mut(&mut self) -> &mut CacheSection {
        self.cache.get_or_insert_with(CacheSection::default)
    }

    fn checkpoint_mut(&mut self) -> &mut CheckpointSection {
        self.checkpoint.get_or_insert_with(CheckpointSection::default)
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn parse_toml_sections() {
        let config: TideKvConfig = toml::from_str(
            r#"
            [store]
            hash_table_size = 4096

            [log]
            page_bits = 14
            memory_bits = 22

            [cache]
            enabled = true
            memory_bits = 20
            page_bits = 14

            [checkpoint]
            dir = "/tmp/tidekv-checkpoints"
            variant = "snapshot"
            "#,
        )
        .unwrap();

        let settings = config.to_store_settings().unwrap();
        assert_eq!(settings.hash_table_size, 4096);
        assert_eq!(settings.log.page_bits, 14);
        assert!(settings.log.read_cache.is_some());
        assert!(settings.checkpoint.is_some());
    }

    #[test]
    fn env_overrides() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("TIDEKV__store__hash_table_size", "2048");
        env::set_var("TIDEKV__log__mutable_fraction", "0.5");

        let mut config = TideKvConfig::default();
        config.apply_env_overrides().unwrap();

        env::remove_var("TIDEKV__store__hash_table_size");
        env::remove_var("TIDEKV__log__mutable_fraction");

        assert_eq!(config.store.unwrap().hash_table_size, Some(2048));
        assert_eq!(config.log.unwrap().mutable_fraction, Some(0.5));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("TIDEKV__store__no_such_field", "1");
        let mut config = TideKvConfig::default();
        let result = config.apply_env_overrides();
        env::remove_var("TIDEKV__store__no_such_field");
        assert!(matches!(result, Err(ConfigError::UnknownKey(_))));
    }

    #[test]
    fn bad_variant_is_rejected() {
        let config: TideKvConfig = toml::from_str(
            r#"
            [checkpoint]
            dir = "/tmp/x"
            variant = "incremental"
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.to_store_settings(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn defaults_when_empty() {
        let config = TideKvConfig::default();
        let settings = config.to_store_settings().unwrap();
        assert_eq!(settings.hash_table_size, 1 << 20);
        assert!(settings.checkpoint.is_none());
    }
}
