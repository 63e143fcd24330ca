pub mod types;
pub mod error;
pub mod config;

pub use error::{Error, Result};
pub use types::{FailureClass, HealthStatus, MigrationId, ShardId};
pub use config::{ConfigError, ShardlineConfig};
