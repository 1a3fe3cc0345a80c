//! TOML configuration for the Logwarden engine.
//!
//! A layered configuration model: compiled-in defaults, an environment
//! variable override for the config file path, and a standard filesystem
//! location. Rule, channel and detection-job definitions live next to the
//! retention and detector settings.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alert::sink::ChannelConfig;
use crate::alert::AlertRule;
use crate::scheduler::DetectionJob;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "LOGWARDEN_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/logwarden/logwarden.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the engine process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: DetectionConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub rules: Vec<AlertRule>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub detections: Vec<DetectionJob>,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), rules = config.rules.len(), "loaded engine configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path specified by the `LOGWARDEN_CONFIG` environment variable.
    /// 2. `/etc/logwarden/logwarden.toml`.
    /// 3. Fall back to compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "LOGWARDEN_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.engine.bucket_size.as_millis() == 0 {
            bail!("engine.bucket_size must be positive");
        }
        if self.storage.shard_width.as_millis() == 0 {
            bail!("storage.shard_width must be positive");
        }
        if !self.engine.anomaly_threshold.is_finite() || self.engine.anomaly_threshold <= 0.0 {
            bail!(
                "engine.anomaly_threshold must be a positive number, got {}",
                self.engine.anomaly_threshold
            );
        }
        if self.engine.min_baseline_samples == 0 {
            bail!("engine.min_baseline_samples must be at least 1");
        }
        if self.engine.cache_enabled && self.engine.cache_capacity == 0 {
            bail!("engine.cache_capacity must be at least 1 when the cache is enabled");
        }
        if self.storage.retention_days == 0 {
            bail!("storage.retention_days must be at least 1");
        }
        for job in &self.detections {
            job.validate()
                .with_context(|| format!("invalid detection job '{}'", job.name))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Event store, journal and retention settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite journal file. `None` keeps events in memory only.
    pub journal_path: Option<PathBuf>,
    /// Width of each time shard.
    #[serde(with = "duration_str")]
    pub shard_width: Duration,
    /// Maximum serialized size of a single event.
    pub max_event_bytes: usize,
    /// Events older than this many days are evicted.
    pub retention_days: u32,
    /// How often the retention sweep runs.
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            journal_path: Some(PathBuf::from("data/logwarden.db")),
            shard_width: Duration::from_secs(3600),
            max_event_bytes: 64 * 1024,
            retention_days: 30,
            sweep_interval: Duration::from_secs(300),
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Windowing, baseline and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    #[serde(with = "duration_str")]
    pub bucket_size: Duration,
    pub anomaly_threshold: f64,
    pub min_baseline_samples: usize,
    /// Trailing buckets in each baseline. Defaults to 7 days of buckets.
    pub baseline_buckets: Option<usize>,
    pub cache_enabled: bool,
    /// Summarize results kept before the least recently used is evicted.
    pub cache_capacity: usize,
    #[serde(with = "duration_str")]
    pub query_timeout: Duration,
    #[serde(with = "duration_str")]
    pub ingest_timeout: Duration,
    /// Attempts for transient journal failures at the ingestion boundary.
    pub ingest_retries: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            bucket_size: Duration::from_secs(300),
            anomaly_threshold: 2.0,
            min_baseline_samples: 2,
            baseline_buckets: None,
            cache_enabled: false,
            cache_capacity: 256,
            query_timeout: Duration::from_secs(30),
            ingest_timeout: Duration::from_secs(5),
            ingest_retries: 3,
        }
    }
}

impl DetectionConfig {
    /// Number of trailing buckets each baseline keeps.
    pub fn baseline_window(&self) -> usize {
        self.baseline_buckets.unwrap_or_else(|| {
            let week_ms = 7 * 24 * 3600 * 1000u128;
            let bucket_ms = self.bucket_size.as_millis().max(1);
            (week_ms / bucket_ms).max(1) as usize
        })
    }
}

// ---------------------------------------------------------------------------
// API / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Durations
// ---------------------------------------------------------------------------

/// Parse `"250ms"`, `"30s"`, `"5m"`, `"1h"`, `"7d"`, `"2w"`; a bare number is seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let n: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{s}'"))?;
    let scale: u64 = match unit.trim() {
        "ms" => return Ok(Duration::from_millis(n)),
        "" | "s" | "sec" | "secs" => 1,
        "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" => 3600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 7 * 86_400,
        other => return Err(format!("unknown duration unit '{other}' in '{s}'")),
    };
    let secs = n
        .checked_mul(scale)
        .ok_or_else(|| format!("duration '{s}' is too large"))?;
    Ok(Duration::from_secs(secs))
}

/// Render a duration in the largest whole unit.
pub fn format_duration(d: &Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    for (unit, size) in [("w", 7 * 86_400), ("d", 86_400), ("h", 3600), ("m", 60)] {
        if secs >= size && secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}

/// Serde adapter for human-readable durations.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    /// Same adapter for `Option<Duration>` fields.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => s.serialize_str(&super::super::format_duration(d)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            let raw = Option::<String>::deserialize(d)?;
            raw.map(|r| super::super::parse_duration(&r).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.engine.anomaly_threshold, 2.0);
        assert_eq!(config.engine.min_baseline_samples, 2);
        assert_eq!(config.engine.bucket_size, Duration::from_secs(300));
        assert_eq!(config.storage.retention_days, 30);
        // 7 days of 5-minute buckets
        assert_eq!(config.engine.baseline_window(), 2016);
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[storage]
retention_days = 7
shard_width = "30m"

[engine]
bucket_size = "1m"
anomaly_threshold = 3.0
min_baseline_samples = 5
baseline_buckets = 60
cache_enabled = true

[logging]
format = "json"

[[channels]]
name = "ops"
type = "log"

[[rules]]
id = "error-spike"
name = "Error spike"
channel = "ops"
cooldown = "15m"
severity = "Error"
predicate = { kind = "anomalous" }
"#;
        let config = EngineConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.storage.retention_days, 7);
        assert_eq!(config.storage.shard_width, Duration::from_secs(1800));
        assert_eq!(config.engine.bucket_size, Duration::from_secs(60));
        assert_eq!(config.engine.baseline_window(), 60);
        assert!(config.engine.cache_enabled);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].cooldown, Duration::from_secs(900));
        assert_eq!(config.channels.len(), 1);
        // Unspecified sections keep their defaults.
        assert_eq!(config.api.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let err = EngineConfig::from_toml("[engine]\nanomaly_threshold = 0.0\n").unwrap_err();
        assert!(err.to_string().contains("anomaly_threshold"));
    }

    #[test]
    fn test_duration_parsing() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("m").is_err());
        let err = parse_duration("18446744073709551615w").unwrap_err();
        assert!(err.contains("too large"));
        assert!(parse_duration("30500000000000000d").is_err());
        assert_eq!(
            parse_duration("18446744073709551615ms").unwrap(),
            Duration::from_millis(u64::MAX)
        );
        assert_eq!(format_duration(&Duration::from_secs(300)), "5m");
        assert_eq!(format_duration(&Duration::from_secs(90)), "90s");
        assert_eq!(format_duration(&Duration::from_millis(1500)), "1500ms");
    }
}
