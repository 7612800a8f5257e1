//! Configuration management for geotrack.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::orders::DEFAULT_ORDERS_KEY;
use crate::provider::FixOptions;
use crate::sampler::SamplerConfig;
use crate::store::{DEFAULT_MAX_SAMPLES_PER_ORDER, DEFAULT_SAMPLES_KEY};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "geotrack";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "geotrack.db";

/// Environment variable prefix.
const ENV_PREFIX: &str = "GEOTRACK_";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `GEOTRACK_`, sections split by `__`)
/// 2. TOML config file at `~/.config/geotrack/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Tracking configuration.
    pub tracking: TrackingConfig,
    /// Polling configuration.
    pub polling: PollingConfig,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/geotrack/geotrack.db`
    pub database_path: Option<PathBuf>,
    /// Samples retained per order.
    pub max_samples_per_order: usize,
    /// Medium key holding the sample collection.
    pub samples_key: String,
    /// Medium key holding the order registry.
    pub orders_key: String,
}

/// Fix request configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Ask providers for their most precise fix.
    pub high_accuracy: bool,
    /// How long to wait for the initial fix.
    pub initial_timeout_ms: u64,
    /// Longest gap between watch events before a timeout is recorded.
    pub watch_timeout_ms: u64,
    /// How old a cached fix may be during a watch.
    pub maximum_age_ms: u64,
}

/// Poller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Time between aggregation passes.
    pub interval_ms: u64,
    /// Samples younger than this count as live.
    pub live_threshold_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_samples_per_order: DEFAULT_MAX_SAMPLES_PER_ORDER,
            samples_key: DEFAULT_SAMPLES_KEY.to_string(),
            orders_key: DEFAULT_ORDERS_KEY.to_string(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            initial_timeout_ms: 10_000,
            watch_timeout_ms: 10_000,
            maximum_age_ms: 5_000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            live_threshold_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading or parsing fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing, or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let figment = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Config = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load only the given TOML file over the defaults, ignoring the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unparsable, or invalid.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigValidation {
                message: format!("config file not found: {}", path.display()),
            });
        }
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            (
                "max_samples_per_order",
                u64::try_from(self.storage.max_samples_per_order).unwrap_or(u64::MAX),
            ),
            ("initial_timeout_ms", self.tracking.initial_timeout_ms),
            ("watch_timeout_ms", self.tracking.watch_timeout_ms),
            ("interval_ms", self.polling.interval_ms),
            ("live_threshold_secs", self.polling.live_threshold_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::ConfigValidation {
                    message: format!("{name} must be greater than 0"),
                });
            }
        }

        for (name, key) in [
            ("samples_key", &self.storage.samples_key),
            ("orders_key", &self.storage.orders_key),
        ] {
            if key.trim().is_empty() {
                return Err(Error::ConfigValidation {
                    message: format!("{name} cannot be empty"),
                });
            }
        }

        if self.storage.samples_key == self.storage.orders_key {
            return Err(Error::ConfigValidation {
                message: format!(
                    "samples_key and orders_key must differ (both are {:?})",
                    self.storage.samples_key
                ),
            });
        }

        Ok(())
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Fix options for the sampler.
    #[must_use]
    pub fn sampler_config(&self) -> SamplerConfig {
        let tracking = &self.tracking;
        SamplerConfig {
            initial: FixOptions {
                high_accuracy: tracking.high_accuracy,
                timeout: Duration::from_millis(tracking.initial_timeout_ms),
                maximum_age: Duration::ZERO,
            },
            watch: FixOptions {
                high_accuracy: tracking.high_accuracy,
                timeout: Duration::from_millis(tracking.watch_timeout_ms),
                maximum_age: Duration::from_millis(tracking.maximum_age_ms),
            },
        }
    }

    /// Get the poll interval as a Duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    /// Get the live threshold as a chrono Duration.
    #[must_use]
    pub fn live_threshold(&self) -> chrono::Duration {
        i64::try_from(self.polling.live_threshold_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.storage.database_path.is_none());
        assert_eq!(config.storage.max_samples_per_order, 100);
        assert_eq!(config.storage.samples_key, "location_updates");
        assert_eq!(config.storage.orders_key, "assigned_orders");
        assert!(config.tracking.high_accuracy);
        assert_eq!(config.polling.interval_ms, 5000);
        assert_eq!(config.polling.live_threshold_secs, 30);
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = Config::default();
        config.polling.interval_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("interval_ms"));
    }

    #[test]
    fn test_validate_zero_cap() {
        let mut config = Config::default();
        config.storage.max_samples_per_order = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_samples_per_order"));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.tracking.watch_timeout_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("watch_timeout_ms"));
    }

    #[test]
    fn test_validate_empty_key() {
        let mut config = Config::default();
        config.storage.orders_key = "  ".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("orders_key"));
    }

    #[test]
    fn test_validate_equal_keys() {
        let mut config = Config::default();
        config.storage.orders_key = config.storage.samples_key.clone();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("must differ"));
    }

    #[test]
    fn test_database_path_default() {
        let path = Config::default().database_path();
        assert!(path.to_string_lossy().contains("geotrack.db"));
    }

    #[test]
    fn test_database_path_custom() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/custom/path/db.sqlite"));

        assert_eq!(
            config.database_path(),
            PathBuf::from("/custom/path/db.sqlite")
        );
    }

    #[test]
    fn test_sampler_config() {
        let mut config = Config::default();
        config.tracking.high_accuracy = false;
        config.tracking.initial_timeout_ms = 2_000;

        let sampler = config.sampler_config();
        assert!(!sampler.initial.high_accuracy);
        assert_eq!(sampler.initial.timeout, Duration::from_secs(2));
        assert_eq!(sampler.initial.maximum_age, Duration::ZERO);
        assert_eq!(sampler.watch.timeout, Duration::from_secs(10));
        assert_eq!(sampler.watch.maximum_age, Duration::from_secs(5));
    }

    #[test]
    fn test_default_sampler_config_matches_fix_options() {
        assert_eq!(Config::default().sampler_config(), SamplerConfig::default());
    }

    #[test]
    fn test_intervals() {
        let config = Config::default();
        assert_eq!(config.poll_interval(), Duration::from_millis(5000));
        assert_eq!(config.live_threshold(), chrono::Duration::seconds(30));
    }

    #[test]
    fn test_default_config_path() {
        let path = Config::default_config_path();
        assert!(path.to_string_lossy().contains("geotrack"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_load_nonexistent_config() {
        let config = Config::load_from(Some(PathBuf::from("/nonexistent/config.toml"))).unwrap();
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[storage]\nmax_samples_per_order = 25\n\n[polling]\ninterval_ms = 1000\n",
        )
        .unwrap();

        let config = Config::load_file(&path).unwrap();
        assert_eq!(config.storage.max_samples_per_order, 25);
        assert_eq!(config.storage.samples_key, "location_updates");
        assert_eq!(config.polling.interval_ms, 1000);
        assert_eq!(config.polling.live_threshold_secs, 30);
    }

    #[test]
    fn test_load_file_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[polling]\ninterval_ms = 0\n").unwrap();

        let err = Config::load_file(&path).unwrap_err();
        assert!(matches!(err, Error::ConfigValidation { .. }));

        let err = Config::load_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_config_serialize() {
        let toml_like = serde_json::to_string(&Config::default()).unwrap();
        assert!(toml_like.contains("max_samples_per_order"));
        assert!(toml_like.contains("live_threshold_secs"));
    }

    #[test]
    fn test_storage_config_deserialize() {
        let json = r#"{"max_samples_per_order": 50}"#;
        let storage: StorageConfig = serde_json::from_str(json).unwrap();
        assert_eq!(storage.max_samples_per_order, 50);
        assert_eq!(storage.orders_key, "assigned_orders");
    }
}
