// Shard storage, online migration and the multi-region serving layer

pub mod record;
pub mod store;
pub mod sled_store;
pub mod connection_pool;
pub mod sharding;
pub mod retry;
pub mod journal;
pub mod dual_write;
pub mod migration;
pub mod checkpoint;
pub mod registry;
pub mod coordinator;
pub mod shard_health;
pub mod metrics_exporter;
pub mod load_balancer;
pub mod server_health;
pub mod auto_scaling;
pub mod failover;
pub mod multi_region;

pub use record::{Record, RecordKey, WriteBatch, WriteOp};
pub use store::{MemoryShardStore, ShardStore, StoreStats};
pub use sled_store::SledShardStore;
pub use connection_pool::{ConnectionPool, PooledConnection};
pub use sharding::{
    jump_consistent_hash, tenant_hash, CutoverHandler, ProbeResult, RouteSink, ShardHandle, ShardInfo,
    ShardRouter,
};
pub use retry::RetryPolicy;
pub use journal::UndoJournal;
pub use dual_write::{DualWriteCoordinator, DualWriteOutcome, DualWriteStats};
pub use migration::{MigrationConfig, MigrationProgress, MigrationState, ShardMigration};
pub use checkpoint::{CheckpointSink, MigrationStore};
pub use registry::MigrationRegistry;
pub use coordinator::{MigrationCoordinator, MigrationRequest};
pub use shard_health::{
    HealthSummary, HealthThresholds, QueryMetrics, ShardHealth, ShardHealthChecker, MIN_CHECK_INTERVAL,
};
pub use metrics_exporter::MetricsExporter;
pub use load_balancer::{
    GlobalStats, LoadBalancer, LoadBalancingStrategy, Region, RegionStats, Server, ServerStats,
};
pub use server_health::{
    GlobalHealthStatus, HealthCheckResult, HttpProbe, ServerHealthChecker, ServerHealthStatus,
    ServerProbe,
};
pub use auto_scaling::{
    AutoScaler, InstanceProvisioner, RegionScalingMetrics, ScalingAction, ScalingEvent,
    ScalingMetrics, ScalingPolicy, ScalingPolicyPatch, SimpleProvisioner,
};
pub use failover::{
    DisasterRecoveryPlan, FailoverEvent, FailoverManager, FailoverPolicy, FailoverState,
    FailoverStatus,
};
pub use multi_region::{
    haversine_km, DataCenter, DeploymentStrategy, MultiRegionConfig, MultiRegionDeployment,
    MultiRegionStatus, ReplicationMode,
};
