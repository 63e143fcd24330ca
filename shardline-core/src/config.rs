// Configuration for shardline instances: shard endpoints, migration defaults,
// health thresholds and scaling knobs

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Instance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub instance_id: String,
    pub region: String,
    pub data_dir: String,
    pub log_level: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            region: "us-east-1".to_string(),
            data_dir: "./data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// One shard the router should know about
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardEndpoint {
    pub id: u32,
    /// Directory of the shard's embedded store
    pub path: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Overrides `connection_pool.max_connections` for this shard
    #[serde(default)]
    pub max_connections: Option<usize>,
}

/// Per-shard connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            acquire_timeout_ms: 30_000,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Defaults applied to migration requests that leave options unset
/// Longest run a single migration may be given
pub const MAX_MIGRATION_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationDefaults {
    pub batch_size: usize,
    pub verify_all: bool,
    pub rollback_on_error: bool,
    pub sample_size: usize,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub timeout_secs: u64,
    pub max_concurrent_migrations: usize,
    pub registry_ttl_secs: u64,
    pub status_interval_secs: u64,
}

impl Default for MigrationDefaults {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            verify_all: true,
            rollback_on_error: true,
            sample_size: 100,
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 5_000,
            timeout_secs: 24 * 60 * 60,
            max_concurrent_migrations: num_cpus::get().clamp(2, 8),
            registry_ttl_secs: 60 * 60,
            status_interval_secs: 10,
        }
    }
}

impl MigrationDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_secs(self.registry_ttl_secs)
    }
}

/// Shard health checking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub degraded_threshold_ms: u64,
    pub unhealthy_threshold_ms: u64,
    pub max_error_rate: f64,
    pub max_replication_lag_ms: u64,
    pub history_limit: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            probe_timeout_ms: 5_000,
            degraded_threshold_ms: 500,
            unhealthy_threshold_ms: 2_000,
            max_error_rate: 0.05,
            max_replication_lag_ms: 10_000,
            history_limit: 100,
        }
    }
}

/// Load balancing, server probing, autoscaling and failover
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingConfig {
    pub session_ttl_secs: u64,
    pub server_check_interval_secs: u64,
    pub server_probe_path: String,
    pub server_probe_timeout_ms: u64,
    pub max_consecutive_failures: u32,
    pub server_history_limit: usize,
    pub scaling_event_limit: usize,
    pub failover_event_limit: usize,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 30 * 60,
            server_check_interval_secs: 30,
            server_probe_path: "/health".to_string(),
            server_probe_timeout_ms: 5_000,
            max_consecutive_failures: 3,
            server_history_limit: 10_000,
            scaling_event_limit: 1_000,
            failover_event_limit: 1_000,
        }
    }
}

/// Complete shardline configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardlineConfig {
    pub instance: InstanceConfig,
    pub shards: Vec<ShardEndpoint>,
    pub connection_pool: ConnectionPoolConfig,
    pub migration: MigrationDefaults,
    pub health: HealthConfig,
    pub scaling: ScalingConfig,
}

impl ShardlineConfig {
    /// Load configuration from file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path, e)))?;
        Self::from_str(&content)
    }

    /// Load configuration from a JSON, TOML or YAML document
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        if let Ok(config) = serde_json::from_str::<ShardlineConfig>(content) {
            return Ok(config);
        }

        let toml_err = match toml::from_str::<ShardlineConfig>(content) {
            Ok(config) => return Ok(config),
            Err(e) => e,
        };

        if let Ok(config) = serde_yaml::from_str::<ShardlineConfig>(content) {
            return Ok(config);
        }

        Err(ConfigError::ParseError(format!(
            "not valid JSON, TOML or YAML ({})",
            toml_err.message()
        )))
    }

    /// Defaults overlaid with `SHARDLINE_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Overlay values from an arbitrary key lookup; unparsable values are ignored
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("SHARDLINE_LOG_LEVEL") {
            self.instance.log_level = level;
        }
        if let Some(dir) = lookup("SHARDLINE_DATA_DIR") {
            self.instance.data_dir = dir;
        }
        if let Some(region) = lookup("SHARDLINE_REGION") {
            self.instance.region = region;
        }
        if let Some(v) = lookup("SHARDLINE_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.migration.batch_size = v;
        }
        if let Some(v) = lookup("SHARDLINE_MAX_CONCURRENT_MIGRATIONS").and_then(|v| v.parse().ok()) {
            self.migration.max_concurrent_migrations = v;
        }
        if let Some(v) = lookup("SHARDLINE_HEALTH_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
            self.health.check_interval_secs = v;
        }
        if let Some(v) = lookup("SHARDLINE_MAX_CONNECTIONS").and_then(|v| v.parse().ok()) {
            self.connection_pool.max_connections = v;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migration.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "migration.batch_size must be > 0".to_string(),
            ));
        }

        if self.migration.max_concurrent_migrations == 0 {
            return Err(ConfigError::ValidationError(
                "migration.max_concurrent_migrations must be > 0".to_string(),
            ));
        }

        if self.migration.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "migration.max_attempts must be > 0".to_string(),
            ));
        }

        if self.migration.timeout_secs == 0
            || self.migration.timeout_secs > MAX_MIGRATION_TIMEOUT_SECS
        {
            return Err(ConfigError::ValidationError(format!(
                "migration.timeout_secs must be within 1..={}",
                MAX_MIGRATION_TIMEOUT_SECS
            )));
        }

        if self.connection_pool.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "connection_pool.max_connections must be > 0".to_string(),
            ));
        }

        if self.health.degraded_threshold_ms >= self.health.unhealthy_threshold_ms {
            return Err(ConfigError::ValidationError(
                "health.degraded_threshold_ms must be below health.unhealthy_threshold_ms"
                    .to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.health.max_error_rate) {
            return Err(ConfigError::ValidationError(
                "health.max_error_rate must be within 0.0..=1.0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for shard in &self.shards {
            if !seen.insert(shard.id) {
                return Err(ConfigError::ValidationError(format!(
                    "shard {} is declared twice",
                    shard.id
                )));
            }
            if shard.path.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "shard {} has an empty path",
                    shard.id
                )));
            }
            if shard.max_connections == Some(0) {
                return Err(ConfigError::ValidationError(format!(
                    "shard {} max_connections must be > 0",
                    shard.id
                )));
            }
        }

        Ok(())
    }

    pub fn shard(&self, id: u32) -> Option<&ShardEndpoint> {
        self.shards.iter().find(|s| s.id == id)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(e) => write!(f, "Validation error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::Error {
    fn from(e: ConfigError) -> Self {
        crate::Error::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = ShardlineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.migration.batch_size, 1000);
        assert_eq!(config.migration.timeout(), Duration::from_secs(86_400));
        assert_eq!(config.health.degraded_threshold_ms, 500);
    }

    #[test]
    fn test_parse_toml() {
        let content = r#"
            [instance]
            log_level = "debug"

            [[shards]]
            id = 0
            path = "/var/lib/shardline/shard-0"

            [[shards]]
            id = 4
            path = "/var/lib/shardline/shard-4"
            max_connections = 4

            [migration]
            batch_size = 250
        "#;
        let config = ShardlineConfig::from_str(content).unwrap();
        assert_eq!(config.instance.log_level, "debug");
        assert_eq!(config.shards.len(), 2);
        assert_eq!(config.shard(4).unwrap().max_connections, Some(4));
        assert_eq!(config.migration.batch_size, 250);
        assert!(config.migration.verify_all);
    }

    #[test]
    fn test_parse_json_and_yaml() {
        let json = r#"{"shards": [{"id": 1, "path": "s1"}], "health": {"max_error_rate": 0.1}}"#;
        let config = ShardlineConfig::from_str(json).unwrap();
        assert_eq!(config.shards[0].id, 1);
        assert_eq!(config.health.max_error_rate, 0.1);

        let yaml = "shards:\n  - id: 2\n    path: s2\nmigration:\n  verify_all: false\n";
        let config = ShardlineConfig::from_str(yaml).unwrap();
        assert_eq!(config.shards[0].id, 2);
        assert!(!config.migration.verify_all);
    }

    #[test]
    fn test_validate_rejects_duplicate_shards() {
        let mut config = ShardlineConfig::default();
        for _ in 0..2 {
            config.shards.push(ShardEndpoint {
                id: 3,
                path: "s3".to_string(),
                region: None,
                max_connections: None,
            });
        }
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = ShardlineConfig::default();
        config.health.degraded_threshold_ms = 3_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bounds_migration_timeout() {
        let mut config = ShardlineConfig::default();
        config.migration.timeout_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));
        config.migration.timeout_secs = 0;
        assert!(config.validate().is_err());
        config.migration.timeout_secs = MAX_MIGRATION_TIMEOUT_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overlay() {
        let vars: HashMap<&str, &str> = [
            ("SHARDLINE_BATCH_SIZE", "64"),
            ("SHARDLINE_LOG_LEVEL", "trace"),
            ("SHARDLINE_MAX_CONNECTIONS", "not-a-number"),
        ]
        .into_iter()
        .collect();
        let mut config = ShardlineConfig::default();
        config.apply_env_with(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.migration.batch_size, 64);
        assert_eq!(config.instance.log_level, "trace");
        assert_eq!(config.connection_pool.max_connections, 16);
    }

    #[test]
    fn test_from_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = ShardlineConfig::from_file(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
