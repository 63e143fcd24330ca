// Region failover and failback on top of the load balancer

use crate::load_balancer::LoadBalancer;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shardline_core::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Lag assumed for regions nobody has reported on
const DEFAULT_REPLICATION_LAG: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverPolicy {
    pub name: String,
    pub primary_region: String,
    pub secondary_region: String,
    /// Primary health percent below which automatic failover fires
    pub health_threshold: u32,
    pub failover_timeout: Duration,
    pub automatic: bool,
    pub max_replication_lag: Duration,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl FailoverPolicy {
    pub fn new(
        name: impl Into<String>,
        primary_region: impl Into<String>,
        secondary_region: impl Into<String>,
        health_threshold: u32,
    ) -> Self {
        Self {
            name: name.into(),
            primary_region: primary_region.into(),
            secondary_region: secondary_region.into(),
            health_threshold,
            failover_timeout: Duration::from_secs(60),
            automatic: true,
            max_replication_lag: Duration::from_secs(5),
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.primary_region == self.secondary_region {
            return Err(Error::Validation(format!(
                "policy {} uses {} as both primary and secondary",
                self.name, self.primary_region
            )));
        }
        if self.health_threshold > 100 {
            return Err(Error::Validation("health_threshold must be <= 100".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    Initiated,
    InProgress,
    Completed,
    Failed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverEvent {
    pub id: u64,
    pub policy: String,
    pub timestamp: DateTime<Utc>,
    pub from_region: String,
    pub to_region: String,
    pub reason: String,
    pub automatic: bool,
    pub data_lag_ms: Option<u64>,
    pub status: FailoverStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisasterRecoveryPlan {
    pub name: String,
    /// Recovery time objective
    pub rto: Duration,
    /// Recovery point objective
    pub rpo: Duration,
    pub backup_frequency: Duration,
    pub backup_retention: Duration,
    pub replication_enabled: bool,
    pub replication_targets: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverState {
    pub policy: FailoverPolicy,
    pub current_primary: String,
    pub failed_over: bool,
}

pub struct FailoverManager {
    balancer: Arc<LoadBalancer>,
    policies: RwLock<HashMap<String, FailoverState>>,
    plans: RwLock<HashMap<String, DisasterRecoveryPlan>>,
    replication_lag: DashMap<String, Duration>,
    events: Mutex<VecDeque<FailoverEvent>>,
    next_event_id: AtomicU64,
    event_limit: usize,
    // Serializes region switches
    switching: Mutex<()>,
}

impl FailoverManager {
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self {
            balancer,
            policies: RwLock::new(HashMap::new()),
            plans: RwLock::new(HashMap::new()),
            replication_lag: DashMap::new(),
            events: Mutex::new(VecDeque::new()),
            next_event_id: AtomicU64::new(1),
            event_limit: 1000,
            switching: Mutex::new(()),
        }
    }

    pub fn with_event_limit(mut self, limit: usize) -> Self {
        self.event_limit = limit.max(1);
        self
    }

    pub fn create_policy(&self, policy: FailoverPolicy) -> Result<()> {
        policy.validate()?;
        info!(
            "Failover policy {}: {} -> {} (automatic {}, threshold {}%)",
            policy.name,
            policy.primary_region,
            policy.secondary_region,
            policy.automatic,
            policy.health_threshold
        );
        let state = FailoverState {
            current_primary: policy.primary_region.clone(),
            failed_over: false,
            policy,
        };
        self.policies.write().insert(state.policy.name.clone(), state);
        Ok(())
    }

    pub fn policy(&self, name: &str) -> Option<FailoverPolicy> {
        self.policies.read().get(name).map(|s| s.policy.clone())
    }

    pub fn failover_status(&self, name: &str) -> Option<FailoverState> {
        self.policies.read().get(name).cloned()
    }

    pub fn create_dr_plan(&self, plan: DisasterRecoveryPlan) -> Result<()> {
        if plan.replication_enabled && plan.replication_targets.is_empty() {
            return Err(Error::Validation(format!(
                "DR plan {} enables replication without targets",
                plan.name
            )));
        }
        info!("DR plan {} (RTO {:?}, RPO {:?})", plan.name, plan.rto, plan.rpo);
        self.plans.write().insert(plan.name.clone(), plan);
        Ok(())
    }

    pub fn dr_plan(&self, name: &str) -> Option<DisasterRecoveryPlan> {
        self.plans.read().get(name).cloned()
    }

    pub fn update_replication_lag(&self, region: &str, lag: Duration) {
        self.replication_lag.insert(region.to_string(), lag);
    }

    pub fn replication_lag(&self, region: &str) -> Duration {
        self.replication_lag
            .get(region)
            .map(|l| *l)
            .unwrap_or(DEFAULT_REPLICATION_LAG)
    }

    /// True when an automatic, active policy's primary has fallen below its
    /// health threshold and it has not failed over yet
    pub fn evaluate_failover_needed(&self, name: &str) -> bool {
        let Some(state) = self.failover_status(name) else {
            return false;
        };
        if !state.policy.automatic || !state.policy.active || state.failed_over {
            return false;
        }
        match self
            .balancer
            .region_stats(&state.policy.primary_region)
            .and_then(|stats| stats.health_percentage())
        {
            Some(health) => health < state.policy.health_threshold,
            None => false,
        }
    }

    /// Run automatic failover for every policy that needs it
    pub fn evaluate_all(&self) -> Vec<FailoverEvent> {
        let names: Vec<String> = self.policies.read().keys().cloned().collect();
        let mut events = Vec::new();
        for name in names {
            if self.evaluate_failover_needed(&name) {
                match self.initiate_failover(&name, true, "primary health below threshold") {
                    Ok(event) => events.push(event),
                    Err(e) => warn!("Automatic failover for {} failed: {}", name, e),
                }
            }
        }
        events
    }

    pub fn manual_failover(&self, name: &str, reason: &str) -> Result<FailoverEvent> {
        self.initiate_failover(name, false, reason)
    }

    /// Move traffic from the primary to the secondary region. Every attempt is
    /// recorded; only a completed one changes routing.
    pub fn initiate_failover(&self, name: &str, automatic: bool, reason: &str) -> Result<FailoverEvent> {
        let _switching = self.switching.lock();
        let state = self
            .failover_status(name)
            .ok_or_else(|| Error::NotFound(format!("failover policy {}", name)))?;
        let policy = &state.policy;
        let from = state.current_primary.clone();
        let to = policy.secondary_region.clone();
        info!(
            "Failover {}: {} -> {} (automatic {}, reason: {})",
            name, from, to, automatic, reason
        );

        let mut event = FailoverEvent {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            policy: name.to_string(),
            timestamp: Utc::now(),
            from_region: from.clone(),
            to_region: to.clone(),
            reason: reason.to_string(),
            automatic,
            data_lag_ms: None,
            status: FailoverStatus::Initiated,
            error: None,
        };

        if state.failed_over {
            return Err(self.reject(event, Error::InvalidState(format!("{} already failed over to {}", name, to))));
        }

        let lag = self.replication_lag(&to);
        event.data_lag_ms = Some(lag.as_millis() as u64);
        if lag > policy.max_replication_lag {
            return Err(self.reject(
                event,
                Error::InvalidState(format!(
                    "replication lag {:?} exceeds {:?}",
                    lag, policy.max_replication_lag
                )),
            ));
        }

        let healthy = self
            .balancer
            .region_stats(&to)
            .map(|s| s.healthy_servers)
            .unwrap_or(0);
        if healthy == 0 {
            return Err(self.reject(
                event,
                Error::NoAvailableServers(format!("no healthy servers in {}", to)),
            ));
        }

        event.status = FailoverStatus::InProgress;
        let switched = self
            .balancer
            .set_region_active(&to, true)
            .and_then(|_| self.balancer.set_region_active(&from, false));
        if let Err(e) = switched {
            event.status = FailoverStatus::Failed;
            event.error = Some(e.to_string());
            self.record(event);
            return Err(e);
        }

        if let Some(state) = self.policies.write().get_mut(name) {
            state.current_primary = to.clone();
            state.failed_over = true;
        }
        event.status = FailoverStatus::Completed;
        self.record(event.clone());
        info!("Failover {} completed: traffic now routed to {}", name, to);
        Ok(event)
    }

    /// Return traffic to the primary once it has healthy servers again
    pub fn initiate_failback(&self, name: &str) -> Result<FailoverEvent> {
        let _switching = self.switching.lock();
        let state = self
            .failover_status(name)
            .ok_or_else(|| Error::NotFound(format!("failover policy {}", name)))?;
        let primary = state.policy.primary_region.clone();
        let mut event = FailoverEvent {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            policy: name.to_string(),
            timestamp: Utc::now(),
            from_region: state.current_primary.clone(),
            to_region: primary.clone(),
            reason: "primary region recovered".to_string(),
            automatic: false,
            data_lag_ms: Some(self.replication_lag(&primary).as_millis() as u64),
            status: FailoverStatus::Initiated,
            error: None,
        };

        if !state.failed_over {
            return Err(self.reject(event, Error::InvalidState(format!("{} is already on {}", name, primary))));
        }
        let healthy = self
            .balancer
            .region_stats(&primary)
            .map(|s| s.healthy_servers)
            .unwrap_or(0);
        if healthy == 0 {
            return Err(self.reject(
                event,
                Error::NoAvailableServers(format!("primary region {} has no healthy servers", primary)),
            ));
        }

        event.status = FailoverStatus::InProgress;
        if let Err(e) = self.balancer.set_region_active(&primary, true) {
            event.status = FailoverStatus::Failed;
            event.error = Some(e.to_string());
            self.record(event);
            return Err(e);
        }
        if let Some(state) = self.policies.write().get_mut(name) {
            state.current_primary = primary.clone();
            state.failed_over = false;
        }
        event.status = FailoverStatus::Completed;
        self.record(event.clone());
        info!("Failback {} completed: traffic back on {}", name, primary);
        Ok(event)
    }

    fn reject(&self, mut event: FailoverEvent, error: Error) -> Error {
        warn!(
            "Failover {} -> {} rejected: {}",
            event.from_region, event.to_region, error
        );
        event.status = FailoverStatus::Rejected;
        event.error = Some(error.to_string());
        self.record(event);
        error
    }

    fn record(&self, event: FailoverEvent) {
        let mut events = self.events.lock();
        events.push_back(event);
        while events.len() > self.event_limit {
            events.pop_front();
        }
    }

    /// Last `limit` events, oldest first
    pub fn history(&self, limit: usize) -> Vec<FailoverEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{LoadBalancingStrategy, Region, Server};

    fn setup() -> (Arc<LoadBalancer>, FailoverManager) {
        let lb = Arc::new(LoadBalancer::new(LoadBalancingStrategy::RoundRobin));
        lb.register_region(Region::new("us-east", "north-america", 0.0, 0.0, 1));
        lb.register_region(Region::new("us-west", "north-america", 0.0, 0.0, 2));
        lb.register_server(Server::new("e1", "us-east", "h", 1, 1, 10)).unwrap();
        lb.register_server(Server::new("e2", "us-east", "h", 2, 1, 10)).unwrap();
        lb.register_server(Server::new("w1", "us-west", "h", 3, 1, 10)).unwrap();
        let manager = FailoverManager::new(lb.clone());
        manager
            .create_policy(FailoverPolicy::new("east-west", "us-east", "us-west", 60))
            .unwrap();
        (lb, manager)
    }

    #[test]
    fn test_rejects_same_regions() {
        let (_lb, manager) = setup();
        assert!(manager
            .create_policy(FailoverPolicy::new("bad", "us-east", "us-east", 50))
            .is_err());
    }

    #[test]
    fn test_automatic_failover_and_failback() {
        let (lb, manager) = setup();
        assert!(!manager.evaluate_failover_needed("east-west"));
        lb.set_server_health("e1", false).unwrap();
        assert!(manager.evaluate_failover_needed("east-west"));

        let events = manager.evaluate_all();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, FailoverStatus::Completed);
        assert!(!lb.region("us-east").unwrap().active);
        assert_eq!(manager.failover_status("east-west").unwrap().current_primary, "us-west");
        assert!(!manager.evaluate_failover_needed("east-west"));

        lb.set_server_health("e1", true).unwrap();
        manager.initiate_failback("east-west").unwrap();
        assert!(lb.region("us-east").unwrap().active);
        assert!(!manager.failover_status("east-west").unwrap().failed_over);
    }

    #[test]
    fn test_replication_lag_rejection_is_recorded() {
        let (lb, manager) = setup();
        manager.update_replication_lag("us-west", Duration::from_secs(30));
        assert!(manager.manual_failover("east-west", "drill").is_err());
        assert!(lb.region("us-east").unwrap().active);
        let history = manager.history(10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, FailoverStatus::Rejected);
        assert_eq!(history[0].data_lag_ms, Some(30_000));
    }

    #[test]
    fn test_requires_healthy_destination() {
        let (lb, manager) = setup();
        lb.set_server_health("w1", false).unwrap();
        let err = manager.manual_failover("east-west", "drill").unwrap_err();
        assert!(matches!(err, Error::NoAvailableServers(_)));
        assert!(!manager.failover_status("east-west").unwrap().failed_over);
    }

    #[test]
    fn test_second_failover_rejected() {
        let (_lb, manager) = setup();
        manager.manual_failover("east-west", "drill").unwrap();
        assert!(manager.manual_failover("east-west", "again").is_err());
        let statuses: Vec<FailoverStatus> = manager.history(10).iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![FailoverStatus::Completed, FailoverStatus::Rejected]);
    }
}
