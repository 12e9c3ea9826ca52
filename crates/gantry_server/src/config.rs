//! Daemon configuration.
//!
//! Loaded from a TOML file; every section and key is optional.
//!
//! ```toml
//! bind = "0.0.0.0:8000"
//!
//! [log]
//! format = "json"
//! filter = "info,gantry=debug"
//!
//! [queue]
//! backend = "redis"
//! redis_url = "redis://127.0.0.1:6379"
//!
//! [results]
//! backend = "redb"
//! path = "/var/lib/gantry/results.redb"
//!
//! [scheduler]
//! pools = ["default"]
//! max_retries = 3
//! ```

use gantry_cluster::SchedulerConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Cannot read {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// The file is not valid configuration
    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// `[log]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Output format
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            format: LogFormat::Pretty,
            filter: "info,tower_http=warn".to_string(),
        }
    }
}

/// `[queue]`: task queue and worker registry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// `memory` or `redis`
    pub backend: String,
    /// Redis URL
    pub redis_url: String,
    /// Key prefix
    pub prefix: String,
    /// Consumer group
    pub group: String,
    /// Consumer name; defaults to one derived from the process id
    pub consumer: Option<String>,
    /// Sleep between empty stream reads, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            prefix: "gantry".to_string(),
            group: "gantry".to_string(),
            consumer: None,
            poll_interval_ms: 50,
        }
    }
}

/// `[results]` and `[provenance]`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// `memory` or `redb`
    pub backend: String,
    /// Database file for `redb`
    pub path: Option<PathBuf>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            path: None,
        }
    }
}

/// `[scheduler]`, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Pools whose loops start at boot
    pub pools: Vec<String>,
    /// Dequeue wait per loop iteration
    pub dequeue_timeout_ms: u64,
    /// Pause after a task found no worker
    pub no_worker_backoff_ms: u64,
    /// Pause after a label held a task back
    pub hold_backoff_ms: u64,
    /// Dispatch request timeout
    pub dispatch_timeout_ms: u64,
    /// In-flight age that makes a task an orphan
    pub orphan_idle_ms: u64,
    /// Sweep period
    pub sweep_interval_ms: u64,
    /// Reclaims before dead-lettering
    pub max_retries: u32,
    /// Worker heartbeat TTL
    pub worker_ttl_ms: u64,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            pools: Vec::new(),
            dequeue_timeout_ms: millis(defaults.dequeue_timeout),
            no_worker_backoff_ms: millis(defaults.no_worker_backoff),
            hold_backoff_ms: millis(defaults.hold_backoff),
            dispatch_timeout_ms: millis(defaults.dispatch_timeout),
            orphan_idle_ms: millis(defaults.orphan_idle),
            sweep_interval_ms: millis(defaults.sweep_interval),
            max_retries: defaults.max_retries,
            worker_ttl_ms: millis(defaults.worker_ttl),
        }
    }
}

impl SchedulerSection {
    /// Scheduler settings
    #[must_use]
    pub fn to_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_dequeue_timeout(Duration::from_millis(self.dequeue_timeout_ms))
            .with_no_worker_backoff(Duration::from_millis(self.no_worker_backoff_ms))
            .with_hold_backoff(Duration::from_millis(self.hold_backoff_ms))
            .with_dispatch_timeout(Duration::from_millis(self.dispatch_timeout_ms))
            .with_orphan_idle(Duration::from_millis(self.orphan_idle_ms))
            .with_sweep_interval(Duration::from_millis(self.sweep_interval_ms))
            .with_max_retries(self.max_retries)
            .with_worker_ttl(Duration::from_millis(self.worker_ttl_ms))
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listen address
    pub bind: String,
    /// Logging
    pub log: LogSection,
    /// Queue and worker registry
    pub queue: QueueSection,
    /// Result backend
    pub results: StoreSection,
    /// Provenance store
    pub provenance: StoreSection,
    /// Scheduler
    pub scheduler: SchedulerSection,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            log: LogSection::default(),
            queue: QueueSection::default(),
            results: StoreSection::default(),
            provenance: StoreSection::default(),
            scheduler: SchedulerSection::default(),
        }
    }
}

impl GatewayConfig {
    /// Parse TOML text
    ///
    /// # Errors
    ///
    /// Returns `Parse` for malformed TOML or mistyped keys
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read a TOML file
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, `Parse` if it is invalid
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_is_default() {
        let config = GatewayConfig::from_toml_str("").unwrap();
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.queue.backend, "memory");
        assert_eq!(config.scheduler.to_config(), SchedulerConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = GatewayConfig::from_toml_str(
            r#"
            bind = "0.0.0.0:9000"

            [log]
            format = "json"

            [queue]
            backend = "redis"
            redis_url = "redis://cache:6379/2"

            [provenance]
            backend = "redb"
            path = "/tmp/prov.redb"

            [scheduler]
            pools = ["gpu", "cpu"]
            max_retries = 5
            orphan_idle_ms = 1500
            hold_backoff_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.log.format, LogFormat::Json);
        assert_eq!(config.log.filter, LogSection::default().filter);
        assert_eq!(config.queue.redis_url, "redis://cache:6379/2");
        assert_eq!(config.queue.group, "gantry");
        assert_eq!(config.results.backend, "memory");
        assert_eq!(config.provenance.path, Some(PathBuf::from("/tmp/prov.redb")));

        let scheduler = config.scheduler.to_config();
        assert_eq!(scheduler.max_retries, 5);
        assert_eq!(scheduler.orphan_idle, Duration::from_millis(1500));
        assert_eq!(scheduler.dequeue_timeout, Duration::from_millis(500));
        assert_eq!(scheduler.hold_backoff, Duration::from_millis(250));
    }

    #[test]
    fn test_mistyped_key_rejected() {
        let err = GatewayConfig::from_toml_str("[scheduler]\nmax_retries = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "bind = \"127.0.0.1:7000\"").unwrap();
        let config = GatewayConfig::load(file.path()).unwrap();
        assert_eq!(config.bind, "127.0.0.1:7000");

        let missing = GatewayConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
