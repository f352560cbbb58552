//! Configuration for the balance engine

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use velocity_engine::{LimitsTable, VelocityLimits};

/// Balance engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Seconds between metrics reports logged by the server (0 disables)
    pub metrics_report_secs: u64,

    /// Emit JSON log lines
    pub json_logs: bool,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Balance cache configuration
    pub cache: CacheConfig,

    /// Pending hold configuration
    pub holds: HoldConfig,

    /// Delta flusher configuration
    pub flusher: FlusherConfig,

    /// Snapshot configuration
    pub snapshot: SnapshotConfig,

    /// Subscription configuration
    pub broadcaster: BroadcasterConfig,

    /// Per-program velocity limit overrides, keyed by program code
    pub limits: BTreeMap<String, VelocityLimits>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/balances"),
            service_name: "balance-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            metrics_report_secs: 60,
            json_logs: false,
            rocksdb: RocksDBConfig::default(),
            cache: CacheConfig::default(),
            holds: HoldConfig::default(),
            flusher: FlusherConfig::default(),
            snapshot: SnapshotConfig::default(),
            broadcaster: BroadcasterConfig::default(),
            limits: BTreeMap::new(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
            enable_statistics: false,
        }
    }
}

/// Balance cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL of the in-process cache (milliseconds)
    pub local_ttl_ms: u64,

    /// TTL of the shared Redis layer (seconds)
    pub shared_ttl_secs: u64,

    /// Redis URL; in-memory only when absent
    pub redis_url: Option<String>,

    /// Redis connect timeout (milliseconds)
    pub connect_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_ttl_ms: 5_000,
            shared_ttl_secs: 10,
            redis_url: None,
            connect_timeout_ms: 2_000,
        }
    }
}

impl CacheConfig {
    /// Local TTL as a duration
    pub fn local_ttl(&self) -> Duration {
        Duration::from_millis(self.local_ttl_ms)
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Pending hold configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldConfig {
    /// Auto-release timeout (seconds)
    pub timeout_secs: u64,

    /// Extra delay before the timeout release fires, letting a confirm that
    /// arrives right at the deadline win (milliseconds, may be zero)
    pub confirm_grace_ms: u64,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300, // 5 minutes
            confirm_grace_ms: 100,
        }
    }
}

impl HoldConfig {
    /// Timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Confirm grace as a duration
    pub fn confirm_grace(&self) -> Duration {
        Duration::from_millis(self.confirm_grace_ms)
    }
}

/// Delta flusher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlusherConfig {
    /// Maximum batch size (deltas)
    pub max_batch_size: usize,

    /// Flush interval (milliseconds)
    pub flush_interval_ms: u64,
}

impl Default for FlusherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            flush_interval_ms: 5_000,
        }
    }
}

impl FlusherConfig {
    /// Flush interval as a duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshot interval (seconds)
    pub interval_secs: u64,

    /// Run the scheduler
    pub enabled: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3_600, // Hourly
            enabled: true,
        }
    }
}

impl SnapshotConfig {
    /// Interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Subscription configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcasterConfig {
    /// Per-listener outbound buffer
    pub listener_buffer: usize,

    /// Event bus capacity
    pub event_capacity: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self {
            listener_buffer: 64,
            event_capacity: 1_024,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("BALANCE_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(url) = std::env::var("BALANCE_REDIS_URL") {
            config.cache.redis_url = Some(url);
        }

        if let Some(secs) = parse_env("BALANCE_METRICS_REPORT_SECS")? {
            config.metrics_report_secs = secs;
        }

        if let Some(secs) = parse_env("BALANCE_HOLD_TIMEOUT_SECS")? {
            config.holds.timeout_secs = secs;
        }

        if let Some(ms) = parse_env("BALANCE_HOLD_CONFIRM_GRACE_MS")? {
            config.holds.confirm_grace_ms = ms;
        }

        if let Some(ms) = parse_env("BALANCE_FLUSH_INTERVAL_MS")? {
            config.flusher.flush_interval_ms = ms;
        }

        if let Some(secs) = parse_env("BALANCE_SNAPSHOT_INTERVAL_SECS")? {
            config.snapshot.interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let zero = [
            ("flusher.max_batch_size", self.flusher.max_batch_size as u64),
            ("flusher.flush_interval_ms", self.flusher.flush_interval_ms),
            ("holds.timeout_secs", self.holds.timeout_secs),
            ("snapshot.interval_secs", self.snapshot.interval_secs),
            ("broadcaster.listener_buffer", self.broadcaster.listener_buffer as u64),
            ("broadcaster.event_capacity", self.broadcaster.event_capacity as u64),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, value)| *value == 0) {
            return Err(crate::Error::Config(format!("{} must be greater than zero", name)));
        }

        self.limits_table()?;
        Ok(())
    }

    /// Velocity limits with the configured overrides applied
    pub fn limits_table(&self) -> crate::Result<LimitsTable> {
        Ok(LimitsTable::from_config(&self.limits)?)
    }
}

fn parse_env(name: &str) -> crate::Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|e| crate::Error::Config(format!("{}: {}", name, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use velocity_engine::ProgramType;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "balance-core");
        assert_eq!(config.flusher.max_batch_size, 100);
        assert_eq!(config.holds.timeout(), Duration::from_secs(300));
        assert_eq!(config.holds.confirm_grace(), Duration::from_millis(100));
        assert_eq!(config.cache.local_ttl(), Duration::from_secs(5));
        assert_eq!(config.cache.shared_ttl_secs, 10);
        assert!(config.snapshot.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml_with_overrides() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/balances"

            [holds]
            timeout_secs = 60
            confirm_grace_ms = 0

            [cache]
            redis_url = "redis://127.0.0.1:6379"

            [limits.SNAP]
            daily_limit = "300"
            transaction_limit = "75"
            daily_transaction_count = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.holds.timeout_secs, 60);
        assert_eq!(config.holds.confirm_grace(), Duration::ZERO);
        assert_eq!(config.flusher.flush_interval_ms, 5_000);
        assert_eq!(config.cache.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));

        let table = config.limits_table().unwrap();
        let snap = table.limits_for(ProgramType::Snap);
        assert_eq!(snap.daily_limit, Some(Decimal::from(300)));
        assert_eq!(snap.daily_transaction_count, Some(12));
        assert_eq!(
            table.limits_for(ProgramType::Wic),
            VelocityLimits::default_for(ProgramType::Wic)
        );
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = Config::default();
        config.flusher.max_batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_batch_size"));
    }

    #[test]
    fn test_validate_rejects_unknown_program() {
        let mut config = Config::default();
        config.limits.insert("LOTTERY".to_string(), VelocityLimits::default());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("balance.toml");
        std::fs::write(&path, "[flusher]\nmax_batch_size = 25\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.flusher.max_batch_size, 25);
    }
}
