//! Engine configuration
//!
//! Every tunable lives here with a default that matches the production
//! client. `EngineConfig::from_env` overlays `STAGEMARK_*` variables on top
//! of those defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SyncError, SyncResult};

/// Top-level configuration for [`crate::OfflineEngine`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub request: RequestConfig,
    pub cache: CacheConfig,
    pub notifications: NotificationConfig,
}

/// Local SQLite store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the database file, or `:memory:`
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "stagemark_local.db".to_string(),
            max_connections: 5,
            enable_wal: true,
        }
    }
}

/// Sync queue behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Failed drain attempts before an item is abandoned
    pub max_retries: u32,
    /// Interval of the opportunistic drain timer
    #[serde(with = "duration_secs")]
    pub sync_interval: Duration,
    /// Request-layer retries for each dispatch inside a drain
    pub dispatch_retries: u32,
    /// Base backoff delay for those retries
    #[serde(with = "duration_ms")]
    pub dispatch_base_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            sync_interval: Duration::from_secs(30),
            dispatch_retries: 1,
            dispatch_base_delay: Duration::from_millis(500),
        }
    }
}

/// Timeout and retry policy of the request layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    #[serde(with = "duration_ms")]
    pub default_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub read_heavy_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub write_heavy_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub upload_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub retry_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub background_timeout: Duration,
    /// Hard ceiling on any computed timeout
    #[serde(with = "duration_ms")]
    pub max_timeout: Duration,
    /// Lowest value a retry may shorten a timeout to
    #[serde(with = "duration_ms")]
    pub min_retry_timeout: Duration,
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(15),
            read_heavy_timeout: Duration::from_secs(20),
            write_heavy_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(60),
            retry_timeout: Duration::from_secs(10),
            background_timeout: Duration::from_secs(45),
            max_timeout: Duration::from_secs(60),
            min_retry_timeout: Duration::from_secs(5),
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// Entity cache and response cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cached entities older than this are removed by the cleanup pass
    #[serde(with = "duration_secs")]
    pub max_age: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_secs")]
    pub default_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub default_max_stale_age: Duration,
    /// Response cache capacity
    pub max_responses: u64,
    /// Responses are dropped after this age whatever the per-call stale window
    #[serde(with = "duration_secs")]
    pub response_retention: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(60 * 60),
            default_ttl: Duration::from_secs(5 * 60),
            default_max_stale_age: Duration::from_secs(30 * 60),
            max_responses: 1_000,
            response_retention: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Ring buffer size; oldest notifications are evicted first
    pub capacity: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self { capacity: 50 }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables (and `.env` if present)
    pub fn from_env() -> SyncResult<Self> {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        // === Store ===
        if let Ok(path) = std::env::var("STAGEMARK_DB_PATH") {
            config.store.db_path = path;
        }
        if let Some(n) = env_parse::<u32>("STAGEMARK_DB_MAX_CONNECTIONS")? {
            config.store.max_connections = n;
        }
        if let Some(wal) = env_parse::<bool>("STAGEMARK_DB_WAL")? {
            config.store.enable_wal = wal;
        }

        // === Queue ===
        if let Some(n) = env_parse::<u32>("STAGEMARK_SYNC_MAX_RETRIES")? {
            config.queue.max_retries = n;
        }
        if let Some(secs) = env_parse::<u64>("STAGEMARK_SYNC_INTERVAL_SECS")? {
            config.queue.sync_interval = Duration::from_secs(secs);
        }

        // === Request ===
        if let Some(n) = env_parse::<u32>("STAGEMARK_REQUEST_MAX_RETRIES")? {
            config.request.max_retries = n;
        }
        if let Some(ms) = env_parse::<u64>("STAGEMARK_REQUEST_TIMEOUT_MS")? {
            config.request.default_timeout = Duration::from_millis(ms);
        }

        // === Cache ===
        if let Some(secs) = env_parse::<u64>("STAGEMARK_CACHE_MAX_AGE_SECS")? {
            config.cache.max_age = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u64>("STAGEMARK_CACHE_MAX_RESPONSES")? {
            config.cache.max_responses = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> SyncResult<()> {
        if self.store.max_connections == 0 {
            return Err(SyncError::Configuration(
                "store.max_connections must be at least 1".to_string(),
            ));
        }
        if self.queue.max_retries == 0 {
            return Err(SyncError::Configuration(
                "queue.max_retries must be at least 1".to_string(),
            ));
        }
        if self.queue.sync_interval.is_zero() {
            return Err(SyncError::Configuration(
                "queue.sync_interval must be non-zero".to_string(),
            ));
        }
        if self.cache.cleanup_interval.is_zero() {
            return Err(SyncError::Configuration(
                "cache.cleanup_interval must be non-zero".to_string(),
            ));
        }
        if self.cache.max_responses == 0 {
            return Err(SyncError::Configuration(
                "cache.max_responses must be at least 1".to_string(),
            ));
        }
        if self.cache.response_retention < self.cache.default_max_stale_age {
            return Err(SyncError::Configuration(
                "cache.response_retention must not be shorter than cache.default_max_stale_age".to_string(),
            ));
        }
        if self.notifications.capacity == 0 {
            return Err(SyncError::Configuration(
                "notifications.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> SyncResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| SyncError::Configuration(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(None),
    }
}

// Serialize Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Serialize Duration as milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.queue.max_retries, 3);
        assert_eq!(config.queue.sync_interval, Duration::from_secs(30));
        assert_eq!(config.request.max_timeout, Duration::from_secs(60));
        assert_eq!(config.notifications.capacity, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_merges_over_defaults() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"queue": {"max_retries": 5}, "request": {"default_timeout": 2000}}"#,
        )
        .unwrap();

        assert_eq!(config.queue.max_retries, 5);
        assert_eq!(config.queue.sync_interval, Duration::from_secs(30));
        assert_eq!(config.request.default_timeout, Duration::from_millis(2000));
        assert_eq!(config.store.db_path, "stagemark_local.db");
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = EngineConfig::default();
        config.notifications.capacity = 0;
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_unbounded_response_cache_settings() {
        let mut config = EngineConfig::default();
        config.cache.max_responses = 0;
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));

        let mut config = EngineConfig::default();
        config.cache.response_retention = Duration::from_secs(60);
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));
    }
}
