// Periodic shard health checking with rolling query metrics

use crate::sharding::{ProbeResult, ShardRouter};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shardline_core::config::HealthConfig;
use shardline_core::{Error, HealthStatus, Result, ShardId};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthThresholds {
    pub degraded_latency: Duration,
    pub unhealthy_latency: Duration,
    /// Fraction of failed queries, 0.0..=1.0
    pub max_error_rate: f64,
    pub max_replication_lag: Duration,
    pub probe_timeout: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_latency: Duration::from_millis(500),
            unhealthy_latency: Duration::from_secs(2),
            max_error_rate: 0.05,
            max_replication_lag: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthThresholds {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            degraded_latency: Duration::from_millis(config.degraded_threshold_ms),
            unhealthy_latency: Duration::from_millis(config.unhealthy_threshold_ms),
            max_error_rate: config.max_error_rate,
            max_replication_lag: Duration::from_millis(config.max_replication_lag_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.degraded_latency >= self.unhealthy_latency {
            return Err(Error::Validation(
                "degraded latency must be below unhealthy latency".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.max_error_rate) {
            return Err(Error::Validation(
                "max_error_rate must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.probe_timeout.is_zero() {
            return Err(Error::Validation("probe_timeout must be > 0".to_string()));
        }
        Ok(())
    }

    /// Unreachable or slower than the unhealthy bound: unhealthy. Slower than
    /// the degraded bound, too many errors or too much lag: degraded.
    pub fn classify(
        &self,
        reachable: bool,
        response_time: Duration,
        error_rate: f64,
        replication_lag: Option<Duration>,
    ) -> HealthStatus {
        if !reachable || response_time >= self.unhealthy_latency {
            return HealthStatus::Unhealthy;
        }
        let lagging = replication_lag
            .map(|lag| lag > self.max_replication_lag)
            .unwrap_or(false);
        if response_time >= self.degraded_latency || error_rate > self.max_error_rate || lagging {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }
}

/// Latest health of one shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardHealth {
    pub shard_id: ShardId,
    pub status: HealthStatus,
    pub reachable: bool,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time_ms: f64,
    /// Fraction of failed queries since the last metrics reset
    pub error_rate: f64,
    pub queries_per_second: f64,
    pub replication_lag_ms: Option<u64>,
    pub database_size_bytes: u64,
    pub record_count: u64,
    pub pool_size: usize,
    pub available_connections: usize,
    pub message: Option<String>,
}

impl ShardHealth {
    pub fn unknown(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            status: HealthStatus::Unknown,
            reachable: false,
            last_check: None,
            response_time_ms: 0.0,
            error_rate: 0.0,
            queries_per_second: 0.0,
            replication_lag_ms: None,
            database_size_bytes: 0,
            record_count: 0,
            pool_size: 0,
            available_connections: 0,
            message: Some("not checked yet".to_string()),
        }
    }
}

/// Rolling query metrics fed by `record_query`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub failed_queries: u64,
    pub total_latency_ms: f64,
    pub max_latency_ms: f64,
    pub window_started: DateTime<Utc>,
}

impl QueryMetrics {
    fn new() -> Self {
        Self {
            total_queries: 0,
            failed_queries: 0,
            total_latency_ms: 0.0,
            max_latency_ms: 0.0,
            window_started: Utc::now(),
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.failed_queries as f64 / self.total_queries as f64
        }
    }

    pub fn average_latency_ms(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.total_latency_ms / self.total_queries as f64
        }
    }

    pub fn queries_per_second(&self) -> f64 {
        let secs = (Utc::now() - self.window_started).num_milliseconds() as f64 / 1000.0;
        if secs <= 0.0 {
            0.0
        } else {
            self.total_queries as f64 / secs
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total_shards: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
    pub average_response_time_ms: f64,
    /// No shard unhealthy and at least one checked
    pub system_healthy: bool,
    pub generated_at: DateTime<Utc>,
}

struct CheckerTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ShardHealthChecker {
    router: Arc<ShardRouter>,
    thresholds: RwLock<Arc<HealthThresholds>>,
    snapshot: RwLock<Arc<HashMap<ShardId, ShardHealth>>>,
    history: DashMap<ShardId, VecDeque<ShardHealth>>,
    metrics: DashMap<ShardId, QueryMetrics>,
    check_interval: Duration,
    history_limit: usize,
    task: Mutex<Option<CheckerTask>>,
}

/// Shortest period accepted for background polling loops
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

impl ShardHealthChecker {
    pub fn new(router: Arc<ShardRouter>, thresholds: HealthThresholds, check_interval: Duration) -> Self {
        Self {
            router,
            thresholds: RwLock::new(Arc::new(thresholds)),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            history: DashMap::new(),
            metrics: DashMap::new(),
            check_interval: check_interval.max(MIN_CHECK_INTERVAL),
            history_limit: 100,
            task: Mutex::new(None),
        }
    }

    pub fn from_config(router: Arc<ShardRouter>, config: &HealthConfig) -> Self {
        let mut checker = Self::new(
            router,
            HealthThresholds::from_config(config),
            Duration::from_secs(config.check_interval_secs.max(1)),
        );
        checker.history_limit = config.history_limit.max(1);
        checker
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    /// Start the periodic loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let checker = self.clone();
        let period = self.check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        checker.check_all().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Shard health loop exited");
        });
        *task = Some(CheckerTask { shutdown, handle });
        info!("Shard health checker started (every {:?})", period);
    }

    /// Stop the loop and wait for an in-flight cycle to finish
    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.shutdown.send_replace(true);
            if let Err(e) = task.handle.await {
                warn!("Shard health loop ended abnormally: {}", e);
            }
            info!("Shard health checker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Probe every registered shard once and publish a new snapshot
    pub async fn check_all(&self) -> Vec<ShardHealth> {
        let thresholds = self.thresholds.read().clone();
        let results = self.router.probe_all(thresholds.probe_timeout).await;

        let mut next = HashMap::with_capacity(results.len());
        for result in results {
            let health = self.evaluate(&thresholds, result);
            if health.status != HealthStatus::Healthy {
                warn!(
                    "{} is {}: {}",
                    health.shard_id,
                    health.status,
                    health.message.as_deref().unwrap_or("-")
                );
            }
            self.push_history(&health);
            next.insert(health.shard_id, health);
        }

        let mut out: Vec<ShardHealth> = next.values().cloned().collect();
        out.sort_by_key(|h| h.shard_id);
        *self.snapshot.write() = Arc::new(next);
        out
    }

    fn evaluate(&self, thresholds: &HealthThresholds, probe: ProbeResult) -> ShardHealth {
        let metrics = self.metrics.get(&probe.shard_id).map(|m| m.clone());
        let error_rate = metrics.as_ref().map(|m| m.error_rate()).unwrap_or(0.0);
        let qps = metrics.as_ref().map(|m| m.queries_per_second()).unwrap_or(0.0);
        let lag = probe.stats.as_ref().and_then(|s| s.replication_lag);
        let status = thresholds.classify(probe.reachable, probe.response_time, error_rate, lag);
        let (pool_size, available) = self
            .router
            .get(probe.shard_id)
            .map(|h| (h.pool().max_connections(), h.pool().available()))
            .unwrap_or((0, 0));

        let message = match status {
            HealthStatus::Unhealthy => probe
                .error
                .clone()
                .or_else(|| Some(format!("response time {:?}", probe.response_time))),
            HealthStatus::Degraded => Some(format!(
                "response time {:?}, error rate {:.2}%, lag {:?}",
                probe.response_time,
                error_rate * 100.0,
                lag
            )),
            _ => None,
        };

        ShardHealth {
            shard_id: probe.shard_id,
            status,
            reachable: probe.reachable,
            last_check: Some(Utc::now()),
            response_time_ms: probe.response_time.as_secs_f64() * 1000.0,
            error_rate,
            queries_per_second: qps,
            replication_lag_ms: lag.map(|l| l.as_millis() as u64),
            database_size_bytes: probe.stats.as_ref().map(|s| s.size_bytes).unwrap_or(0),
            record_count: probe.stats.as_ref().map(|s| s.record_count).unwrap_or(0),
            pool_size,
            available_connections: available,
            message,
        }
    }

    fn push_history(&self, health: &ShardHealth) {
        let mut entry = self.history.entry(health.shard_id).or_default();
        entry.push_back(health.clone());
        while entry.len() > self.history_limit {
            entry.pop_front();
        }
    }

    /// Latest known health; `Unknown` for shards never checked
    pub fn shard_health(&self, id: ShardId) -> ShardHealth {
        self.snapshot
            .read()
            .get(&id)
            .cloned()
            .unwrap_or_else(|| ShardHealth::unknown(id))
    }

    pub fn all_health(&self) -> Vec<ShardHealth> {
        let snapshot = self.snapshot.read().clone();
        let mut out: Vec<ShardHealth> = snapshot.values().cloned().collect();
        out.sort_by_key(|h| h.shard_id);
        out
    }

    pub fn summary(&self) -> HealthSummary {
        let snapshot = self.snapshot.read().clone();
        let mut summary = HealthSummary {
            total_shards: snapshot.len(),
            healthy: 0,
            degraded: 0,
            unhealthy: 0,
            unknown: 0,
            average_response_time_ms: 0.0,
            system_healthy: false,
            generated_at: Utc::now(),
        };
        let mut latency_sum = 0.0;
        for health in snapshot.values() {
            match health.status {
                HealthStatus::Healthy => summary.healthy += 1,
                HealthStatus::Degraded => summary.degraded += 1,
                HealthStatus::Unhealthy => summary.unhealthy += 1,
                HealthStatus::Unknown => summary.unknown += 1,
            }
            latency_sum += health.response_time_ms;
        }
        if !snapshot.is_empty() {
            summary.average_response_time_ms = latency_sum / snapshot.len() as f64;
        }
        summary.system_healthy = summary.total_shards > 0 && summary.unhealthy == 0;
        summary
    }

    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds.read().as_ref().clone()
    }

    /// Replace the whole threshold set; cycles in flight keep the old one
    pub fn set_thresholds(&self, thresholds: HealthThresholds) -> Result<()> {
        thresholds.validate()?;
        *self.thresholds.write() = Arc::new(thresholds);
        info!("Shard health thresholds updated");
        Ok(())
    }

    pub fn record_query(&self, id: ShardId, latency: Duration, success: bool) {
        let mut metrics = self.metrics.entry(id).or_insert_with(QueryMetrics::new);
        let latency_ms = latency.as_secs_f64() * 1000.0;
        metrics.total_queries += 1;
        if !success {
            metrics.failed_queries += 1;
        }
        metrics.total_latency_ms += latency_ms;
        if latency_ms > metrics.max_latency_ms {
            metrics.max_latency_ms = latency_ms;
        }
    }

    pub fn metrics(&self, id: ShardId) -> Option<QueryMetrics> {
        self.metrics.get(&id).map(|m| m.clone())
    }

    pub fn reset_metrics(&self, id: ShardId) {
        self.metrics.insert(id, QueryMetrics::new());
    }

    /// Most recent `limit` results for a shard, oldest first
    pub fn history(&self, id: ShardId, limit: usize) -> Vec<ShardHealth> {
        self.history
            .get(&id)
            .map(|entries| {
                let skip = entries.len().saturating_sub(limit);
                entries.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Time an operation against a shard and record its outcome
    pub async fn observe<T, F>(&self, id: ShardId, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = op.await;
        self.record_query(id, start.elapsed(), result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_bounds() {
        let t = HealthThresholds::default();
        assert_eq!(t.classify(true, Duration::from_millis(10), 0.0, None), HealthStatus::Healthy);
        assert_eq!(t.classify(true, Duration::from_millis(500), 0.0, None), HealthStatus::Degraded);
        assert_eq!(t.classify(true, Duration::from_secs(2), 0.0, None), HealthStatus::Unhealthy);
        assert_eq!(t.classify(false, Duration::from_millis(1), 0.0, None), HealthStatus::Unhealthy);
        assert_eq!(t.classify(true, Duration::from_millis(10), 0.06, None), HealthStatus::Degraded);
        assert_eq!(
            t.classify(true, Duration::from_millis(10), 0.0, Some(Duration::from_secs(11))),
            HealthStatus::Degraded
        );
        assert_eq!(t.classify(true, Duration::from_millis(10), 0.05, None), HealthStatus::Healthy);
    }

    #[test]
    fn test_threshold_validation() {
        let mut t = HealthThresholds::default();
        t.degraded_latency = Duration::from_secs(3);
        assert!(t.validate().is_err());
        let mut t = HealthThresholds::default();
        t.max_error_rate = 1.5;
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_query_metrics_error_rate() {
        let router = Arc::new(ShardRouter::new(1, Duration::from_secs(1)));
        let checker = ShardHealthChecker::new(router, HealthThresholds::default(), Duration::from_secs(30));
        for i in 0..10 {
            checker.record_query(ShardId(0), Duration::from_millis(10), i != 0);
        }
        let metrics = checker.metrics(ShardId(0)).unwrap();
        assert_eq!(metrics.total_queries, 10);
        assert!((metrics.error_rate() - 0.1).abs() < f64::EPSILON);
        checker.reset_metrics(ShardId(0));
        assert_eq!(checker.metrics(ShardId(0)).unwrap().total_queries, 0);
    }

    #[test]
    fn test_unknown_before_first_check() {
        let router = Arc::new(ShardRouter::new(1, Duration::from_secs(1)));
        let checker = ShardHealthChecker::new(router, HealthThresholds::default(), Duration::from_secs(30));
        assert_eq!(checker.shard_health(ShardId(3)).status, HealthStatus::Unknown);
        assert!(!checker.summary().system_healthy);
    }
}
