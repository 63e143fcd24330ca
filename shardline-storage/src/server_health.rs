// Active health checks for load-balanced application servers

use crate::load_balancer::{LoadBalancer, Server};
use crate::shard_health::MIN_CHECK_INTERVAL;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shardline_core::config::ScalingConfig;
use shardline_core::{Error, Result};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Issues one health request against a server and returns the status code
#[async_trait]
pub trait ServerProbe: Send + Sync {
    async fn probe(&self, server: &Server, path: &str, timeout: Duration) -> Result<u16>;
}

/// Plain HTTP GET
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ServerProbe for HttpProbe {
    async fn probe(&self, server: &Server, path: &str, timeout: Duration) -> Result<u16> {
        let url = format!("{}{}", server.url(), path);
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("GET {} failed: {}", url, e)))?;
        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Clone)]
struct ProbeTarget {
    path: String,
    expected_status: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub server_id: String,
    pub timestamp: DateTime<Utc>,
    pub healthy: bool,
    pub response_time_ms: f64,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHealthStatus {
    pub server_id: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_result: Option<HealthCheckResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalHealthStatus {
    pub monitored_servers: usize,
    pub healthy_servers: usize,
    pub total_checks: usize,
    pub successful_checks: usize,
    pub health_percentage: f64,
    pub running: bool,
}

struct CheckerTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ServerHealthChecker {
    balancer: Arc<LoadBalancer>,
    probe: Arc<dyn ServerProbe>,
    targets: RwLock<BTreeMap<String, ProbeTarget>>,
    failures: DashMap<String, u32>,
    results: Mutex<VecDeque<HealthCheckResult>>,
    check_interval: Duration,
    check_timeout: Duration,
    max_consecutive_failures: u32,
    history_limit: usize,
    task: Mutex<Option<CheckerTask>>,
}

impl ServerHealthChecker {
    pub fn new(
        balancer: Arc<LoadBalancer>,
        probe: Arc<dyn ServerProbe>,
        check_interval: Duration,
        check_timeout: Duration,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            balancer,
            probe,
            targets: RwLock::new(BTreeMap::new()),
            failures: DashMap::new(),
            results: Mutex::new(VecDeque::new()),
            check_interval: check_interval.max(MIN_CHECK_INTERVAL),
            check_timeout,
            max_consecutive_failures: max_consecutive_failures.max(1),
            history_limit: 10_000,
            task: Mutex::new(None),
        }
    }

    pub fn from_config(balancer: Arc<LoadBalancer>, probe: Arc<dyn ServerProbe>, config: &ScalingConfig) -> Self {
        let mut checker = Self::new(
            balancer,
            probe,
            Duration::from_secs(config.server_check_interval_secs.max(1)),
            Duration::from_millis(config.server_probe_timeout_ms),
            config.max_consecutive_failures,
        );
        checker.history_limit = config.server_history_limit.max(1);
        checker
    }

    /// Register a probe for a server already known to the load balancer
    pub fn register_probe(&self, server_id: &str, path: &str) -> Result<()> {
        if self.balancer.server(server_id).is_none() {
            return Err(Error::NotFound(format!("server {}", server_id)));
        }
        info!("Registering health probe {}{}", server_id, path);
        self.targets.write().insert(
            server_id.to_string(),
            ProbeTarget {
                path: path.to_string(),
                expected_status: 200,
            },
        );
        self.failures.insert(server_id.to_string(), 0);
        Ok(())
    }

    pub fn unregister_probe(&self, server_id: &str) {
        self.targets.write().remove(server_id);
        self.failures.remove(server_id);
    }

    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let checker = self.clone();
        let period = self.check_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
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
        });
        *task = Some(CheckerTask { shutdown, handle });
        info!("Server health checker started (every {:?})", period);
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.shutdown.send_replace(true);
            if let Err(e) = task.handle.await {
                warn!("Server health loop ended abnormally: {}", e);
            }
            info!("Server health checker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    /// Probe every registered server concurrently
    pub async fn check_all(&self) -> Vec<HealthCheckResult> {
        let targets: Vec<(String, ProbeTarget)> = self
            .targets
            .read()
            .iter()
            .map(|(id, target)| (id.clone(), target.clone()))
            .collect();
        join_all(
            targets
                .into_iter()
                .map(|(id, target)| async move { self.check_server(&id, &target).await }),
        )
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn check_server(&self, server_id: &str, target: &ProbeTarget) -> Option<HealthCheckResult> {
        // Removed from the balancer since registration
        let server = self.balancer.server(server_id)?;
        let start = Instant::now();
        let outcome = self.probe.probe(&server, &target.path, self.check_timeout).await;
        let elapsed = start.elapsed();

        let (healthy, status_code, error) = match outcome {
            Ok(code) if code == target.expected_status => (true, Some(code), None),
            Ok(code) => (false, Some(code), Some(format!("unexpected status code {}", code))),
            Err(e) => (false, None, Some(e.to_string())),
        };
        let result = HealthCheckResult {
            server_id: server_id.to_string(),
            timestamp: Utc::now(),
            healthy,
            response_time_ms: elapsed.as_secs_f64() * 1000.0,
            status_code,
            error,
        };

        if healthy {
            self.handle_healthy(server_id);
        } else {
            self.handle_unhealthy(server_id);
        }
        self.record(result.clone());
        Some(result)
    }

    fn handle_healthy(&self, server_id: &str) {
        let previous = self
            .failures
            .insert(server_id.to_string(), 0)
            .unwrap_or(0);
        let marked_down = self
            .balancer
            .server(server_id)
            .map(|s| !s.healthy)
            .unwrap_or(false);
        if previous >= self.max_consecutive_failures || marked_down {
            if let Err(e) = self.balancer.set_server_health(server_id, true) {
                warn!("Could not mark {} healthy: {}", server_id, e);
            } else {
                info!("Server {} recovered", server_id);
            }
        }
    }

    fn handle_unhealthy(&self, server_id: &str) {
        let failures = {
            let mut count = self.failures.entry(server_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        if failures >= self.max_consecutive_failures {
            if let Err(e) = self.balancer.set_server_health(server_id, false) {
                warn!("Could not mark {} unhealthy: {}", server_id, e);
            } else if failures == self.max_consecutive_failures {
                warn!("Server {} marked unhealthy after {} failures", server_id, failures);
            }
        } else {
            debug!("Server {} failed check {}/{}", server_id, failures, self.max_consecutive_failures);
        }
    }

    fn record(&self, result: HealthCheckResult) {
        let mut results = self.results.lock();
        results.push_back(result);
        while results.len() > self.history_limit {
            results.pop_front();
        }
    }

    pub fn get_health_status(&self, server_id: &str) -> Option<ServerHealthStatus> {
        let server = self.balancer.server(server_id)?;
        let last_result = self
            .results
            .lock()
            .iter()
            .rev()
            .find(|r| r.server_id == server_id)
            .cloned();
        Some(ServerHealthStatus {
            server_id: server_id.to_string(),
            healthy: server.healthy,
            consecutive_failures: self.failures.get(server_id).map(|c| *c).unwrap_or(0),
            last_result,
        })
    }

    /// Last `limit` results across all servers, oldest first
    pub fn history(&self, limit: usize) -> Vec<HealthCheckResult> {
        let results = self.results.lock();
        let skip = results.len().saturating_sub(limit);
        results.iter().skip(skip).cloned().collect()
    }

    /// Share of successful checks in the retained history; 100 when empty
    pub fn health_percentage(&self) -> f64 {
        let results = self.results.lock();
        if results.is_empty() {
            return 100.0;
        }
        let ok = results.iter().filter(|r| r.healthy).count();
        ok as f64 * 100.0 / results.len() as f64
    }

    pub fn global_status(&self) -> GlobalHealthStatus {
        let monitored: Vec<String> = self.targets.read().keys().cloned().collect();
        let healthy_servers = monitored
            .iter()
            .filter(|id| self.balancer.server(id).map(|s| s.healthy).unwrap_or(false))
            .count();
        let (total_checks, successful_checks) = {
            let results = self.results.lock();
            (results.len(), results.iter().filter(|r| r.healthy).count())
        };
        GlobalHealthStatus {
            monitored_servers: monitored.len(),
            healthy_servers,
            total_checks,
            successful_checks,
            health_percentage: self.health_percentage(),
            running: self.is_running(),
        }
    }
}
