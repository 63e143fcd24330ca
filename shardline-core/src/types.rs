use serde::{Deserialize, Serialize};
use std::fmt;

/// Shard identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

impl From<u32> for ShardId {
    fn from(id: u32) -> Self {
        ShardId(id)
    }
}

/// Migration identifier, `migration_{source}_to_{target}_{unix}_{suffix}`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MigrationId(pub String);

impl MigrationId {
    pub fn generate(source: ShardId, target: ShardId) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        MigrationId(format!(
            "migration_{}_to_{}_{}_{}",
            source.0,
            target.0,
            chrono::Utc::now().timestamp(),
            &suffix[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MigrationId {
    fn from(id: &str) -> Self {
        MigrationId(id.to_string())
    }
}

/// Health classification shared by shards and load-balanced servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthStatus {
    /// Numeric encoding used by the Prometheus exporter
    pub fn as_gauge(&self) -> i64 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Why a migration reached a failed or rolled-back state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Validation,
    Connectivity,
    VerificationMismatch,
    Cancelled,
    Cutover,
    Timeout,
    Storage,
    Interrupted,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureClass::Validation => "validation",
            FailureClass::Connectivity => "connectivity",
            FailureClass::VerificationMismatch => "verification_mismatch",
            FailureClass::Cancelled => "cancelled",
            FailureClass::Cutover => "cutover",
            FailureClass::Timeout => "timeout",
            FailureClass::Storage => "storage",
            FailureClass::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}
