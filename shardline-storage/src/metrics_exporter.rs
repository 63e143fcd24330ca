// Prometheus gauges for shard health and migration progress

use crate::migration::MigrationProgress;
use crate::shard_health::ShardHealth;
use prometheus::{Encoder, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};
use shardline_core::{Error, Result};

pub struct MetricsExporter {
    registry: Registry,
    health_status: IntGaugeVec,
    response_time_ms: GaugeVec,
    error_rate: GaugeVec,
    qps: GaugeVec,
    size_bytes: GaugeVec,
    record_count: IntGaugeVec,
    available_connections: IntGaugeVec,
    migration_progress: GaugeVec,
    migration_records: IntGaugeVec,
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Configuration(format!("Prometheus error: {}", e))
}

impl MetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let shard = &["shard"];

        let health_status = IntGaugeVec::new(
            Opts::new(
                "shardline_shard_health_status",
                "Shard health (0 unknown, 1 healthy, 2 degraded, 3 unhealthy)",
            ),
            shard,
        )
        .map_err(metrics_error)?;
        let response_time_ms = GaugeVec::new(
            Opts::new("shardline_shard_response_time_ms", "Probe response time in milliseconds"),
            shard,
        )
        .map_err(metrics_error)?;
        let error_rate = GaugeVec::new(
            Opts::new("shardline_shard_error_rate_percentage", "Failed queries in percent"),
            shard,
        )
        .map_err(metrics_error)?;
        let qps = GaugeVec::new(
            Opts::new("shardline_shard_qps", "Queries per second"),
            shard,
        )
        .map_err(metrics_error)?;
        let size_bytes = GaugeVec::new(
            Opts::new("shardline_shard_database_size_bytes", "Approximate shard size in bytes"),
            shard,
        )
        .map_err(metrics_error)?;
        let record_count = IntGaugeVec::new(
            Opts::new("shardline_shard_record_count", "Records stored on the shard"),
            shard,
        )
        .map_err(metrics_error)?;
        let available_connections = IntGaugeVec::new(
            Opts::new("shardline_shard_available_connections", "Idle pool connections"),
            shard,
        )
        .map_err(metrics_error)?;
        let migration_progress = GaugeVec::new(
            Opts::new("shardline_migration_progress_percent", "Migration completion in percent"),
            &["migration", "state"],
        )
        .map_err(metrics_error)?;
        let migration_records = IntGaugeVec::new(
            Opts::new("shardline_migration_records", "Migration record counters"),
            &["migration", "kind"],
        )
        .map_err(metrics_error)?;

        registry.register(Box::new(health_status.clone())).map_err(metrics_error)?;
        registry.register(Box::new(response_time_ms.clone())).map_err(metrics_error)?;
        registry.register(Box::new(error_rate.clone())).map_err(metrics_error)?;
        registry.register(Box::new(qps.clone())).map_err(metrics_error)?;
        registry.register(Box::new(size_bytes.clone())).map_err(metrics_error)?;
        registry.register(Box::new(record_count.clone())).map_err(metrics_error)?;
        registry
            .register(Box::new(available_connections.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(migration_progress.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(migration_records.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            health_status,
            response_time_ms,
            error_rate,
            qps,
            size_bytes,
            record_count,
            available_connections,
            migration_progress,
            migration_records,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn update_shards(&self, shards: &[ShardHealth]) {
        for health in shards {
            let label = health.shard_id.0.to_string();
            let labels = &[label.as_str()];
            self.health_status
                .with_label_values(labels)
                .set(health.status.as_gauge());
            self.response_time_ms
                .with_label_values(labels)
                .set(health.response_time_ms);
            self.error_rate
                .with_label_values(labels)
                .set(health.error_rate * 100.0);
            self.qps
                .with_label_values(labels)
                .set(health.queries_per_second);
            self.size_bytes
                .with_label_values(labels)
                .set(health.database_size_bytes as f64);
            self.record_count
                .with_label_values(labels)
                .set(health.record_count as i64);
            self.available_connections
                .with_label_values(labels)
                .set(health.available_connections as i64);
        }
    }

    /// Replace migration series; a migration changing state drops its old series
    pub fn update_migrations(&self, migrations: &[MigrationProgress]) {
        self.migration_progress.reset();
        self.migration_records.reset();
        for progress in migrations {
            let id = progress.id.as_str();
            self.migration_progress
                .with_label_values(&[id, progress.state.as_str()])
                .set(progress.percent_complete);
            for (kind, value) in [
                ("total", progress.total_records),
                ("migrated", progress.migrated_records),
                ("verified", progress.verified_records),
                ("failed", progress.failed_records),
            ] {
                self.migration_records
                    .with_label_values(&[id, kind])
                    .set(value as i64);
            }
        }
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Serialization(e.to_string()))
    }
}
