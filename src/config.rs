use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, TriageError};
use crate::rate_limiter::MIN_REFILL_RATE;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub classification: ClassificationConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClassificationConfig {
    /// Rules document; the built-in rules are used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket size in quota units
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// Quota units added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PollingStrategyKind {
    #[default]
    Volume,
    Time,
    Hybrid,
}

/// Tuning for the adaptive polling interval
///
/// Volume thresholds are compared against the average number of messages
/// fetched over the last `window_size` sync cycles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default)]
    pub strategy: PollingStrategyKind,
    /// Number of recent sync counts kept per user
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Average above this shrinks the interval
    #[serde(default = "default_high_volume_threshold")]
    pub high_volume_threshold: f64,
    /// Average below this grows the interval
    #[serde(default = "default_low_volume_threshold")]
    pub low_volume_threshold: f64,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    /// Interval for moderate volume and for users with no history
    #[serde(default = "default_default_interval_secs")]
    pub default_interval_secs: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// Multiplier applied on high volume, in (0, 1]
    #[serde(default = "default_shrink_factor")]
    pub shrink_factor: f64,
    /// Multiplier applied on low volume, at least 1
    #[serde(default = "default_grow_factor")]
    pub grow_factor: f64,
    /// First hour (local time) of the business period
    #[serde(default = "default_business_hours_start")]
    pub business_hours_start: u32,
    /// Hour the business period ends and the evening period begins
    #[serde(default = "default_business_hours_end")]
    pub business_hours_end: u32,
    /// Hour the evening period ends and the night period begins
    #[serde(default = "default_evening_end")]
    pub evening_end: u32,
    #[serde(default = "default_business_interval_secs")]
    pub business_interval_secs: u64,
    #[serde(default = "default_evening_interval_secs")]
    pub evening_interval_secs: u64,
    #[serde(default = "default_night_interval_secs")]
    pub night_interval_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            strategy: PollingStrategyKind::default(),
            window_size: default_window_size(),
            high_volume_threshold: default_high_volume_threshold(),
            low_volume_threshold: default_low_volume_threshold(),
            min_interval_secs: default_min_interval_secs(),
            default_interval_secs: default_default_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
            shrink_factor: default_shrink_factor(),
            grow_factor: default_grow_factor(),
            business_hours_start: default_business_hours_start(),
            business_hours_end: default_business_hours_end(),
            evening_end: default_evening_end(),
            business_interval_secs: default_business_interval_secs(),
            evening_interval_secs: default_evening_interval_secs(),
            night_interval_secs: default_night_interval_secs(),
        }
    }
}

impl PollingConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Directory holding one state document per user
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Gmail search query for messages to ingest
    #[serde(default = "default_query")]
    pub query: String,
    /// Upper bound on messages processed in one cycle
    #[serde(default = "default_max_messages_per_cycle")]
    pub max_messages_per_cycle: usize,
    /// How long to keep retrying a failed state write before giving up
    #[serde(default = "default_persist_max_elapsed_secs")]
    pub persist_max_elapsed_secs: u64,
    /// Attempts per Gmail call before a transient error is surfaced
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            query: default_query(),
            max_messages_per_cycle: default_max_messages_per_cycle(),
            persist_max_elapsed_secs: default_persist_max_elapsed_secs(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_capacity() -> u32 {
    500
}

fn default_refill_rate() -> f64 {
    250.0
}

fn default_window_size() -> usize {
    3
}

fn default_high_volume_threshold() -> f64 {
    40.0
}

fn default_low_volume_threshold() -> f64 {
    10.0
}

fn default_min_interval_secs() -> u64 {
    120
}

fn default_default_interval_secs() -> u64 {
    300
}

fn default_max_interval_secs() -> u64 {
    900
}

fn default_shrink_factor() -> f64 {
    0.5
}

fn default_grow_factor() -> f64 {
    1.5
}

fn default_business_hours_start() -> u32 {
    9
}

fn default_business_hours_end() -> u32 {
    17
}

fn default_evening_end() -> u32 {
    23
}

fn default_business_interval_secs() -> u64 {
    180
}

fn default_evening_interval_secs() -> u64 {
    600
}

fn default_night_interval_secs() -> u64 {
    1200
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".gmail-triage/state")
}

fn default_query() -> String {
    "in:inbox".to_string()
}

fn default_max_messages_per_cycle() -> usize {
    100
}

fn default_persist_max_elapsed_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TriageError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TriageError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                TriageError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TriageError::Config(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| TriageError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.capacity == 0 {
            return Err(TriageError::Config(
                "rate_limit.capacity must be greater than 0".to_string(),
            ));
        }
        if !self.rate_limit.refill_rate.is_finite()
            || self.rate_limit.refill_rate < MIN_REFILL_RATE
        {
            return Err(TriageError::Config(format!(
                "rate_limit.refill_rate must be at least {}",
                MIN_REFILL_RATE
            )));
        }

        let polling = &self.polling;
        if polling.window_size == 0 {
            return Err(TriageError::Config(
                "polling.window_size must be at least 1".to_string(),
            ));
        }
        if polling.low_volume_threshold > polling.high_volume_threshold {
            return Err(TriageError::Config(
                "polling.low_volume_threshold cannot exceed polling.high_volume_threshold"
                    .to_string(),
            ));
        }
        if polling.min_interval_secs == 0 {
            return Err(TriageError::Config(
                "polling.min_interval_secs must be greater than 0".to_string(),
            ));
        }
        if !(polling.min_interval_secs <= polling.default_interval_secs
            && polling.default_interval_secs <= polling.max_interval_secs)
        {
            return Err(TriageError::Config(
                "polling intervals must satisfy min_interval_secs <= default_interval_secs <= max_interval_secs"
                    .to_string(),
            ));
        }
        if !(polling.shrink_factor > 0.0 && polling.shrink_factor <= 1.0) {
            return Err(TriageError::Config(
                "polling.shrink_factor must be in (0, 1]".to_string(),
            ));
        }
        if !(polling.grow_factor.is_finite() && polling.grow_factor >= 1.0) {
            return Err(TriageError::Config(
                "polling.grow_factor must be at least 1".to_string(),
            ));
        }
        if !(polling.business_hours_start < polling.business_hours_end
            && polling.business_hours_end <= polling.evening_end
            && polling.evening_end <= 24)
        {
            return Err(TriageError::Config(
                "polling hours must satisfy business_hours_start < business_hours_end <= evening_end <= 24"
                    .to_string(),
            ));
        }
        if polling.business_interval_secs == 0
            || polling.evening_interval_secs == 0
            || polling.night_interval_secs == 0
        {
            return Err(TriageError::Config(
                "polling time-of-day intervals must be greater than 0".to_string(),
            ));
        }

        if self.sync.query.trim().is_empty() {
            return Err(TriageError::Config("sync.query cannot be empty".to_string()));
        }
        if self.sync.max_messages_per_cycle == 0 {
            return Err(TriageError::Config(
                "sync.max_messages_per_cycle must be greater than 0".to_string(),
            ));
        }
        if self.sync.max_retries == 0 {
            return Err(TriageError::Config(
                "sync.max_retries must be at least 1".to_string(),
            ));
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let mut config = Self::default();
        config.classification.rules_path = Some(PathBuf::from("config/rules.example.json"));
        config.save(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.classification.rules_path.is_none());
        assert_eq!(config.rate_limit.capacity, 500);
        assert_eq!(config.rate_limit.refill_rate, 250.0);

        assert_eq!(config.polling.strategy, PollingStrategyKind::Volume);
        assert_eq!(config.polling.window_size, 3);
        assert_eq!(config.polling.min_interval(), Duration::from_secs(120));
        assert_eq!(config.polling.default_interval(), Duration::from_secs(300));
        assert_eq!(config.polling.max_interval(), Duration::from_secs(900));

        assert_eq!(config.sync.query, "in:inbox");
        assert_eq!(config.sync.max_messages_per_cycle, 100);
    }

    #[test]
    fn test_config_validation_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_capacity() {
        let mut config = Config::default();
        config.rate_limit.capacity = 0;
        let result = config.validate();
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("capacity must be greater than 0"));
    }

    #[test]
    fn test_config_validation_tiny_refill_rate() {
        let mut config = Config::default();
        config.rate_limit.refill_rate = 1e-300;
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("refill_rate must be at least"));
    }

    #[test]
    fn test_config_validation_interval_ordering() {
        let mut config = Config::default();
        config.polling.min_interval_secs = 600;
        let result = config.validate();
        assert!(result.unwrap_err().to_string().contains("min_interval_secs"));
    }

    #[test]
    fn test_config_validation_thresholds() {
        let mut config = Config::default();
        config.polling.low_volume_threshold = 100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_factors() {
        let mut config = Config::default();
        config.polling.shrink_factor = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.grow_factor = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_hours() {
        let mut config = Config::default();
        config.polling.business_hours_start = 18;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.polling.evening_end = 25;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_empty_query() {
        let mut config = Config::default();
        config.sync.query = "  ".to_string();
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("sync.query cannot be empty"));
    }

    #[tokio::test]
    async fn test_config_load_save_roundtrip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let mut config = Config::default();
        config.polling.strategy = PollingStrategyKind::Hybrid;
        config.classification.rules_path = Some(PathBuf::from("rules.json"));
        config.save(path).await.unwrap();

        let loaded = Config::load(path).await.unwrap();
        assert_eq!(loaded.polling.strategy, PollingStrategyKind::Hybrid);
        assert_eq!(
            loaded.classification.rules_path,
            Some(PathBuf::from("rules.json"))
        );
        assert_eq!(loaded.sync.state_dir, config.sync.state_dir);
    }

    #[tokio::test]
    async fn test_config_load_nonexistent_returns_default() {
        let path = Path::new("/tmp/nonexistent-gmail-triage-config.toml");
        let config = Config::load(path).await.unwrap();
        assert_eq!(config.rate_limit.capacity, 500);
    }

    #[tokio::test]
    async fn test_config_load_invalid_toml() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();
        tokio::fs::write(path, "this is not valid toml {[}]")
            .await
            .unwrap();

        let result = Config::load(path).await;
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Failed to parse config file"));
    }

    #[tokio::test]
    async fn test_config_partial_with_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        let partial_config = r#"
[polling]
strategy = "time"
high_volume_threshold = 80.0

[sync]
query = "in:inbox is:unread"
"#;
        tokio::fs::write(path, partial_config).await.unwrap();

        let config = Config::load(path).await.unwrap();

        assert_eq!(config.polling.strategy, PollingStrategyKind::Time);
        assert_eq!(config.polling.high_volume_threshold, 80.0);
        assert_eq!(config.sync.query, "in:inbox is:unread");

        assert_eq!(config.polling.low_volume_threshold, 10.0);
        assert_eq!(config.rate_limit.capacity, 500);
    }

    #[tokio::test]
    async fn test_config_load_rejects_invalid_values() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();
        tokio::fs::write(path, "[polling]\nwindow_size = 0\n")
            .await
            .unwrap();

        assert!(Config::load(path).await.is_err());
    }

    #[tokio::test]
    async fn test_config_create_example() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        Config::create_example(&path).await.unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(
            config.classification.rules_path,
            Some(PathBuf::from("config/rules.example.json"))
        );
    }
}
