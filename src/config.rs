//! Layered configuration: environment variables override
//! `<data_dir>/config.toml`, which overrides [`Config::default`].

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const ENV_PREFIX: &str = "TELEMETRY_ENGINE_";

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_length: usize,
    pub visibility_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            max_length: crate::queue::DEFAULT_MAXLEN,
            visibility_timeout_ms: crate::queue::DEFAULT_VISIBILITY_TIMEOUT_MS,
            max_retries: crate::queue::DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub high_watermark_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            batch_size: 100,
            batch_timeout_ms: 100,
            high_watermark_ms: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SlowPathConfig {
    pub worker_count: usize,
    pub partitioning: String,
}

impl Default for SlowPathConfig {
    fn default() -> Self {
        SlowPathConfig {
            worker_count: 3,
            partitioning: "session_hash".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompositeConfig {
    pub interval_s: u64,
    pub lock_ttl_s: u64,
}

impl Default for CompositeConfig {
    fn default() -> Self {
        CompositeConfig {
            interval_s: 30,
            lock_ttl_s: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub raw_hours: i64,
    pub per_minute_days: i64,
    pub per_hour_years: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            raw_hours: 24,
            per_minute_days: 30,
            per_hour_years: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub queue: QueueConfig,
    pub ingest: IngestConfig,
    pub slow_path: SlowPathConfig,
    pub composite: CompositeConfig,
    pub retention: RetentionConfig,
    pub data_dir: PathBuf,
    /// Per-platform capture source paths, e.g. `claude -> ~/.claude/projects`.
    pub capture_sources: HashMap<String, String>,
    pub bind_addr: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue: QueueConfig::default(),
            ingest: IngestConfig::default(),
            slow_path: SlowPathConfig::default(),
            composite: CompositeConfig::default(),
            retention: RetentionConfig::default(),
            data_dir: default_data_dir(),
            capture_sources: HashMap::new(),
            bind_addr: "127.0.0.1:8787".to_string(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("telemetry-engine")
}

/// All-`Option` mirror of [`Config`], deserialized from `config.toml`.
/// Every field is optional so a partial file only overrides what it names.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub queue: Option<FileQueueConfig>,
    pub ingest: Option<FileIngestConfig>,
    pub slow_path: Option<FileSlowPathConfig>,
    pub composite: Option<FileCompositeConfig>,
    pub retention: Option<FileRetentionConfig>,
    pub data_dir: Option<String>,
    pub capture_sources: Option<HashMap<String, String>>,
    pub bind_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileQueueConfig {
    pub max_length: Option<usize>,
    pub visibility_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileIngestConfig {
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub high_watermark_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileSlowPathConfig {
    pub worker_count: Option<usize>,
    pub partitioning: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileCompositeConfig {
    pub interval_s: Option<u64>,
    pub lock_ttl_s: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FileRetentionConfig {
    pub raw_hours: Option<i64>,
    pub per_minute_days: Option<i64>,
    pub per_hour_years: Option<i64>,
}

impl Config {
    /// The single on-disk database file shared by the raw store, the
    /// derived store, and the metrics store — one WAL-mode file rather
    /// than managing several.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("engine.sqlite3")
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| {
            home.join(".config")
                .join("telemetry-engine")
                .join("config.toml")
        })
    }

    /// Writes out `Config::default()` as TOML if no config file exists yet.
    /// Config is optional, so failures here are logged and otherwise
    /// ignored — the engine still runs on defaults.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(error = %e, "failed to create config directory");
                return;
            }
        }
        let default_toml = "# telemetry-engine config.toml\n\
             # Every key here mirrors a Config field; omit a section to use\n\
             # its defaults.\n";
        if let Err(e) = std::fs::write(&path, default_toml) {
            tracing::warn!(error = %e, "failed to write default config file");
        }
    }

    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };
        let Ok(contents) = std::fs::read_to_string(&path) else {
            return FileConfig::default();
        };
        match toml::from_str(&contents) {
            Ok(file_config) => file_config,
            Err(e) => {
                // A broken config should fail fast with a clear error, not
                // silently fall back to defaults.
                eprintln!("telemetry-engine: failed to parse {}: {e}", path.display());
                std::process::exit(1);
            }
        }
    }

    /// Builds the effective configuration: environment variables override
    /// the file, which overrides hardcoded defaults.
    pub fn from_env() -> Config {
        let file = Self::load_file_config();
        let defaults = Config::default();

        let queue = QueueConfig {
            max_length: env_or("QUEUE_MAX_LENGTH")
                .or(file.queue.as_ref().and_then(|q| q.max_length))
                .unwrap_or(defaults.queue.max_length),
            visibility_timeout_ms: env_or("QUEUE_VISIBILITY_TIMEOUT_MS")
                .or(file.queue.as_ref().and_then(|q| q.visibility_timeout_ms))
                .unwrap_or(defaults.queue.visibility_timeout_ms),
            max_retries: env_or("QUEUE_MAX_RETRIES")
                .or(file.queue.as_ref().and_then(|q| q.max_retries))
                .unwrap_or(defaults.queue.max_retries),
        };

        let ingest = IngestConfig {
            batch_size: env_or("INGEST_BATCH_SIZE")
                .or(file.ingest.as_ref().and_then(|i| i.batch_size))
                .unwrap_or(defaults.ingest.batch_size),
            batch_timeout_ms: env_or("INGEST_BATCH_TIMEOUT_MS")
                .or(file.ingest.as_ref().and_then(|i| i.batch_timeout_ms))
                .unwrap_or(defaults.ingest.batch_timeout_ms),
            high_watermark_ms: env_or("INGEST_HIGH_WATERMARK_MS")
                .or(file.ingest.as_ref().and_then(|i| i.high_watermark_ms))
                .unwrap_or(defaults.ingest.high_watermark_ms),
        };

        let slow_path = SlowPathConfig {
            worker_count: env_or("SLOW_PATH_WORKER_COUNT")
                .or(file.slow_path.as_ref().and_then(|s| s.worker_count))
                .unwrap_or(defaults.slow_path.worker_count),
            partitioning: std::env::var(format!("{ENV_PREFIX}SLOW_PATH_PARTITIONING"))
                .ok()
                .or_else(|| file.slow_path.as_ref().and_then(|s| s.partitioning.clone()))
                .unwrap_or(defaults.slow_path.partitioning),
        };

        let composite = CompositeConfig {
            interval_s: env_or("COMPOSITE_INTERVAL_S")
                .or(file.composite.as_ref().and_then(|c| c.interval_s))
                .unwrap_or(defaults.composite.interval_s),
            lock_ttl_s: env_or("COMPOSITE_LOCK_TTL_S")
                .or(file.composite.as_ref().and_then(|c| c.lock_ttl_s))
                .unwrap_or(defaults.composite.lock_ttl_s),
        };

        let retention = RetentionConfig {
            raw_hours: env_or("RETENTION_RAW_HOURS")
                .or(file.retention.as_ref().and_then(|r| r.raw_hours))
                .unwrap_or(defaults.retention.raw_hours),
            per_minute_days: env_or("RETENTION_PER_MINUTE_DAYS")
                .or(file.retention.as_ref().and_then(|r| r.per_minute_days))
                .unwrap_or(defaults.retention.per_minute_days),
            per_hour_years: env_or("RETENTION_PER_HOUR_YEARS")
                .or(file.retention.as_ref().and_then(|r| r.per_hour_years))
                .unwrap_or(defaults.retention.per_hour_years),
        };

        let data_dir = std::env::var(format!("{ENV_PREFIX}DATA_DIR"))
            .ok()
            .map(PathBuf::from)
            .or_else(|| file.data_dir.clone().map(PathBuf::from))
            .unwrap_or(defaults.data_dir);

        let bind_addr = std::env::var(format!("{ENV_PREFIX}BIND_ADDR"))
            .ok()
            .or_else(|| file.bind_addr.clone())
            .unwrap_or(defaults.bind_addr);

        Config {
            queue,
            ingest,
            slow_path,
            composite,
            retention,
            data_dir,
            capture_sources: file.capture_sources.unwrap_or_default(),
            bind_addr,
        }
    }
}

/// `TELEMETRY_ENGINE_<suffix>`, parsed via `FromStr`. Returns `None` when
/// unset or unparsable, leaving the caller to fall back to the file value.
fn env_or<T: std::str::FromStr>(suffix: &str) -> Option<T> {
    std::env::var(format!("{ENV_PREFIX}{suffix}"))
        .ok()
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_recognized_values() {
        let config = Config::default();
        assert_eq!(config.queue.max_length, 10_000);
        assert_eq!(config.queue.visibility_timeout_ms, 30_000);
        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.ingest.batch_size, 100);
        assert_eq!(config.ingest.batch_timeout_ms, 100);
        assert_eq!(config.slow_path.worker_count, 3);
        assert_eq!(config.composite.interval_s, 30);
        assert_eq!(config.composite.lock_ttl_s, 5);
    }
}
