//! Runtime configuration.
//!
//! Every section defaults sensibly, so an empty TOML document is a valid
//! configuration. `Config::load` reads the file named by `PROXIMITY_CONFIG`
//! when that variable is set.

use crate::error::{ProximityError, Result};
use crate::persistence::{AofConfig, SyncPolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "PROXIMITY_CONFIG";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub index: IndexConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub reconcile: ReconcileConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub request_timeout_ms: u64,
    pub max_in_flight: usize,
    pub max_queued: usize,
    pub queue_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            request_timeout_ms: 5_000,
            max_in_flight: 256,
            max_queued: 512,
            queue_wait_ms: 100,
        }
    }
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ProximityError::Config(format!("invalid server address: {}", e)))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn queue_wait(&self) -> Duration {
        Duration::from_millis(self.queue_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// AOF location; without one the store lives in memory only
    pub aof_path: Option<PathBuf>,
    pub sync_policy: SyncPolicy,
    pub rewrite_size_threshold: u64,
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            aof_path: None,
            sync_policy: SyncPolicy::EverySecond,
            rewrite_size_threshold: AofConfig::default().rewrite_size_threshold,
            timeout_ms: 1_000,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn aof_config(&self) -> AofConfig {
        AofConfig {
            sync_policy: self.sync_policy,
            rewrite_size_threshold: self.rewrite_size_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Geohash characters per bucket
    pub precision: usize,
    /// How long forwarding entries and tombstones outlive the write that made them
    pub prune_grace_ms: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            precision: 5,
            prune_grace_ms: 5_000,
        }
    }
}

impl IndexConfig {
    pub fn prune_grace(&self) -> Duration {
        Duration::from_millis(self.prune_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub entity_ttl_secs: u64,
    pub query_ttl_secs: u64,
    pub timeout_ms: u64,
    /// Decimal places query centers are rounded to for the cache key
    pub coordinate_decimals: u32,
    pub max_entries: usize,
    /// Larger candidate sets are served but not cached
    pub max_cached_candidates: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entity_ttl_secs: 30,
            query_ttl_secs: 10,
            timeout_ms: 50,
            coordinate_decimals: 3,
            max_entries: 100_000,
            max_cached_candidates: 1_000,
        }
    }
}

impl CacheConfig {
    pub fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_secs)
    }

    pub fn query_ttl(&self) -> Duration {
        Duration::from_secs(self.query_ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            multiplier: 2.0,
            max_backoff_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Seconds between background sweeps; 0 disables them
    pub interval_secs: u64,
    pub chunk_size: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            chunk_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Fallback filter when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Json,
            filter: "info,tower_http=info".into(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| ProximityError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ProximityError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Load from `$PROXIMITY_CONFIG` if set, defaults otherwise
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ProximityError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(ProximityError::Config(msg.to_string()));

        if !(1..=12).contains(&self.index.precision) {
            return invalid("index.precision must be between 1 and 12");
        }
        if self.server.max_in_flight == 0 {
            return invalid("server.max_in_flight must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be positive");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be at least 1.0");
        }
        if self.reconcile.chunk_size == 0 {
            return invalid("reconcile.chunk_size must be positive");
        }
        if self.cache.coordinate_decimals > 9 {
            return invalid("cache.coordinate_decimals must be at most 9");
        }
        if self.store.timeout_ms == 0 || self.cache.timeout_ms == 0 {
            return invalid("store and cache timeouts must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.index.precision, 5);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
            [server]
            port = 9090

            [store]
            aof_path = "/var/lib/proximity/store.aof"
            sync_policy = "always"

            [cache]
            entity_ttl_secs = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.store.sync_policy, SyncPolicy::Always);
        assert_eq!(config.cache.entity_ttl(), Duration::from_secs(5));
        assert_eq!(config.cache.query_ttl_secs, 10);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::from_toml_str("[index]\nprecision = 0").is_err());
        assert!(Config::from_toml_str("[index]\nprecision = 13").is_err());
        assert!(Config::from_toml_str("[server]\nmax_in_flight = 0").is_err());
        assert!(Config::from_toml_str("[retry]\nmultiplier = 0.5").is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config::default();
        let raw = config.to_toml_string().unwrap();
        assert_eq!(Config::from_toml_str(&raw).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("proximity.toml");
        std::fs::write(&path, "[reconcile]\ninterval_secs = 0\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.reconcile.interval_secs, 0);

        assert!(Config::from_file(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_socket_addr() {
        let addr = ServerConfig::default().socket_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }
}
