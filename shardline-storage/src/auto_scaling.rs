// Per-region auto-scaling driven by load balancer utilization
// Scaling decisions are serialized per scaler so a region never gets two
// events inside one cooldown window

use crate::load_balancer::LoadBalancer;
use crate::shard_health::MIN_CHECK_INTERVAL;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shardline_core::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Adds or removes instances in a region
pub trait InstanceProvisioner: Send + Sync {
    fn scale_region(&self, region: &str, from: usize, to: usize) -> Result<()>;
    fn instance_count(&self, region: &str) -> Option<usize>;
}

/// In-memory provisioner that only tracks requested counts
pub struct SimpleProvisioner {
    counts: RwLock<HashMap<String, usize>>,
}

impl SimpleProvisioner {
    pub fn new() -> Self {
        Self {
            counts: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for SimpleProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceProvisioner for SimpleProvisioner {
    fn scale_region(&self, region: &str, _from: usize, to: usize) -> Result<()> {
        self.counts.write().insert(region.to_string(), to);
        Ok(())
    }

    fn instance_count(&self, region: &str) -> Option<usize> {
        self.counts.read().get(region).copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub region: String,
    pub name: String,
    /// Utilization percent above which the region grows
    pub scale_up_threshold: u32,
    /// Utilization percent below which the region shrinks
    pub scale_down_threshold: u32,
    pub scale_up_quantity: usize,
    pub scale_down_quantity: usize,
    pub min_instances: usize,
    pub max_instances: usize,
    pub cooldown: Duration,
    pub check_interval: Duration,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ScalingPolicy {
    pub fn new(region: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            name: name.into(),
            scale_up_threshold: 80,
            scale_down_threshold: 20,
            scale_up_quantity: 1,
            scale_down_quantity: 1,
            min_instances: 1,
            max_instances: 10,
            cooldown: Duration::from_secs(300),
            check_interval: Duration::from_secs(30),
            active: true,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scale_up_threshold > 100 {
            return Err(Error::Validation("scale_up_threshold must be <= 100".to_string()));
        }
        if self.scale_down_threshold >= self.scale_up_threshold {
            return Err(Error::Validation(
                "scale_down_threshold must be below scale_up_threshold".to_string(),
            ));
        }
        if self.min_instances > self.max_instances {
            return Err(Error::Validation(
                "min_instances must not exceed max_instances".to_string(),
            ));
        }
        if self.scale_up_quantity == 0 || self.scale_down_quantity == 0 {
            return Err(Error::Validation("scaling quantities must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Partial policy update; `None` leaves the field unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScalingPolicyPatch {
    pub scale_up_threshold: Option<u32>,
    pub scale_down_threshold: Option<u32>,
    pub scale_up_quantity: Option<usize>,
    pub scale_down_quantity: Option<usize>,
    pub min_instances: Option<usize>,
    pub max_instances: Option<usize>,
    pub cooldown: Option<Duration>,
    pub check_interval: Option<Duration>,
    pub active: Option<bool>,
}

impl ScalingPolicyPatch {
    fn apply_to(&self, policy: &mut ScalingPolicy) {
        if let Some(v) = self.scale_up_threshold {
            policy.scale_up_threshold = v;
        }
        if let Some(v) = self.scale_down_threshold {
            policy.scale_down_threshold = v;
        }
        if let Some(v) = self.scale_up_quantity {
            policy.scale_up_quantity = v;
        }
        if let Some(v) = self.scale_down_quantity {
            policy.scale_down_quantity = v;
        }
        if let Some(v) = self.min_instances {
            policy.min_instances = v;
        }
        if let Some(v) = self.max_instances {
            policy.max_instances = v;
        }
        if let Some(v) = self.cooldown {
            policy.cooldown = v;
        }
        if let Some(v) = self.check_interval {
            policy.check_interval = v;
        }
        if let Some(v) = self.active {
            policy.active = v;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub id: u64,
    pub region: String,
    pub timestamp: DateTime<Utc>,
    pub action: ScalingAction,
    pub from_count: usize,
    pub to_count: usize,
    pub reason: String,
    pub utilization: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingMetrics {
    pub running: bool,
    pub total_policies: usize,
    pub total_events: usize,
    pub scale_up_count: usize,
    pub scale_down_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionScalingMetrics {
    pub region: String,
    pub policy: ScalingPolicy,
    pub scale_up_count: usize,
    pub scale_down_count: usize,
    pub seconds_since_last_scaling: Option<f64>,
    pub recent_events: usize,
}

struct ScalerTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct AutoScaler {
    balancer: Arc<LoadBalancer>,
    provisioner: Arc<dyn InstanceProvisioner>,
    policies: RwLock<HashMap<String, ScalingPolicy>>,
    // Region -> last scaling time; also the decision lock
    last_scaling: Mutex<HashMap<String, Instant>>,
    last_evaluated: Mutex<HashMap<String, Instant>>,
    events: Mutex<VecDeque<ScalingEvent>>,
    next_event_id: AtomicU64,
    event_limit: usize,
    task: Mutex<Option<ScalerTask>>,
}

impl AutoScaler {
    pub fn new(balancer: Arc<LoadBalancer>, provisioner: Arc<dyn InstanceProvisioner>) -> Self {
        Self {
            balancer,
            provisioner,
            policies: RwLock::new(HashMap::new()),
            last_scaling: Mutex::new(HashMap::new()),
            last_evaluated: Mutex::new(HashMap::new()),
            events: Mutex::new(VecDeque::new()),
            next_event_id: AtomicU64::new(1),
            event_limit: 1000,
            task: Mutex::new(None),
        }
    }

    pub fn with_event_limit(mut self, limit: usize) -> Self {
        self.event_limit = limit.max(1);
        self
    }

    /// Create or replace the policy for a region
    pub fn create_policy(&self, policy: ScalingPolicy) -> Result<()> {
        policy.validate()?;
        if self.balancer.region(&policy.region).is_none() {
            return Err(Error::NotFound(format!("region {}", policy.region)));
        }
        info!(
            "Scaling policy {} for {} (min {}, max {}, up {}%, down {}%)",
            policy.name,
            policy.region,
            policy.min_instances,
            policy.max_instances,
            policy.scale_up_threshold,
            policy.scale_down_threshold
        );
        self.policies.write().insert(policy.region.clone(), policy);
        Ok(())
    }

    pub fn policy(&self, region: &str) -> Option<ScalingPolicy> {
        self.policies.read().get(region).cloned()
    }

    /// Apply a partial update; the policy is untouched if the result is invalid
    pub fn update_policy(&self, region: &str, patch: &ScalingPolicyPatch) -> Result<ScalingPolicy> {
        let mut policies = self.policies.write();
        let current = policies
            .get(region)
            .ok_or_else(|| Error::NotFound(format!("scaling policy for {}", region)))?;
        let mut updated = current.clone();
        patch.apply_to(&mut updated);
        updated.validate()?;
        policies.insert(region.to_string(), updated.clone());
        info!("Updated scaling policy for {}", region);
        Ok(updated)
    }

    pub fn remove_policy(&self, region: &str) -> Option<ScalingPolicy> {
        self.policies.write().remove(region)
    }

    /// Evaluate one region from current load balancer stats
    pub fn evaluate_region(&self, region: &str) -> Result<Option<ScalingEvent>> {
        let stats = self
            .balancer
            .region_stats(region)
            .ok_or_else(|| Error::NotFound(format!("region {}", region)))?;
        let current = self
            .provisioner
            .instance_count(region)
            .unwrap_or(stats.total_servers);
        self.evaluate_at(region, current, stats.utilization, Instant::now())
    }

    /// Decide and apply at most one scaling step for `region`
    pub fn evaluate_at(
        &self,
        region: &str,
        current_count: usize,
        utilization: u32,
        now: Instant,
    ) -> Result<Option<ScalingEvent>> {
        let policy = match self.policy(region) {
            Some(policy) if policy.active => policy,
            _ => return Ok(None),
        };

        let mut last_scaling = self.last_scaling.lock();
        if let Some(last) = last_scaling.get(region) {
            if now.saturating_duration_since(*last) < policy.cooldown {
                debug!("{} is cooling down", region);
                return Ok(None);
            }
        }

        let (action, target, reason) = if utilization > policy.scale_up_threshold {
            let target = (current_count + policy.scale_up_quantity).min(policy.max_instances);
            (
                ScalingAction::ScaleUp,
                target,
                format!(
                    "utilization {}% above threshold {}%",
                    utilization, policy.scale_up_threshold
                ),
            )
        } else if utilization < policy.scale_down_threshold && current_count > policy.min_instances {
            let target = current_count
                .saturating_sub(policy.scale_down_quantity)
                .max(policy.min_instances);
            (
                ScalingAction::ScaleDown,
                target,
                format!(
                    "utilization {}% below threshold {}%",
                    utilization, policy.scale_down_threshold
                ),
            )
        } else {
            return Ok(None);
        };

        if target == current_count {
            return Ok(None);
        }

        self.provisioner.scale_region(region, current_count, target)?;
        last_scaling.insert(region.to_string(), now);
        drop(last_scaling);

        let event = ScalingEvent {
            id: self.next_event_id.fetch_add(1, Ordering::Relaxed),
            region: region.to_string(),
            timestamp: Utc::now(),
            action,
            from_count: current_count,
            to_count: target,
            reason,
            utilization,
        };
        info!(
            "{:?} {}: {} -> {} instances ({})",
            action, region, current_count, target, event.reason
        );
        self.record(event.clone());
        Ok(Some(event))
    }

    /// Evaluate every active policy whose check interval has elapsed
    pub fn evaluate_due(&self) -> Vec<ScalingEvent> {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let policies = self.policies.read();
            let mut last = self.last_evaluated.lock();
            for policy in policies.values().filter(|p| p.active) {
                let is_due = last
                    .get(&policy.region)
                    .map(|t| now.saturating_duration_since(*t) >= policy.check_interval)
                    .unwrap_or(true);
                if is_due {
                    last.insert(policy.region.clone(), now);
                    due.push(policy.region.clone());
                }
            }
        }

        let mut events = Vec::new();
        for region in due {
            match self.evaluate_region(&region) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => warn!("Scaling evaluation for {} failed: {}", region, e),
            }
        }
        events
    }

    pub fn start(self: &Arc<Self>, tick: Duration) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let scaler = self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick.max(MIN_CHECK_INTERVAL));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scaler.evaluate_due();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *task = Some(ScalerTask { shutdown, handle });
        info!("Auto-scaler started");
    }

    pub async fn stop(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.shutdown.send_replace(true);
            if let Err(e) = task.handle.await {
                warn!("Auto-scaler loop ended abnormally: {}", e);
            }
            info!("Auto-scaler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().is_some()
    }

    fn record(&self, event: ScalingEvent) {
        let mut events = self.events.lock();
        events.push_back(event);
        while events.len() > self.event_limit {
            events.pop_front();
        }
    }

    /// Last `limit` events, optionally for one region, oldest first
    pub fn get_scaling_events(&self, region: Option<&str>, limit: usize) -> Vec<ScalingEvent> {
        let events = self.events.lock();
        let matching: Vec<&ScalingEvent> = events
            .iter()
            .filter(|e| region.map(|r| e.region == r).unwrap_or(true))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub fn metrics(&self) -> ScalingMetrics {
        let events = self.events.lock();
        ScalingMetrics {
            running: self.is_running(),
            total_policies: self.policies.read().len(),
            total_events: events.len(),
            scale_up_count: events.iter().filter(|e| e.action == ScalingAction::ScaleUp).count(),
            scale_down_count: events.iter().filter(|e| e.action == ScalingAction::ScaleDown).count(),
        }
    }

    pub fn region_metrics(&self, region: &str) -> Option<RegionScalingMetrics> {
        let policy = self.policy(region)?;
        let since = self
            .last_scaling
            .lock()
            .get(region)
            .map(|t| t.elapsed().as_secs_f64());
        let events = self.events.lock();
        let regional: Vec<&ScalingEvent> = events.iter().filter(|e| e.region == region).collect();
        Some(RegionScalingMetrics {
            region: region.to_string(),
            policy,
            scale_up_count: regional.iter().filter(|e| e.action == ScalingAction::ScaleUp).count(),
            scale_down_count: regional.iter().filter(|e| e.action == ScalingAction::ScaleDown).count(),
            seconds_since_last_scaling: since,
            recent_events: regional.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::{LoadBalancingStrategy, Region};

    fn scaler() -> AutoScaler {
        let lb = Arc::new(LoadBalancer::new(LoadBalancingStrategy::RoundRobin));
        lb.register_region(Region::new("us-east", "north-america", 0.0, 0.0, 1));
        let scaler = AutoScaler::new(lb, Arc::new(SimpleProvisioner::new()));
        let mut policy = ScalingPolicy::new("us-east", "web");
        policy.scale_up_quantity = 3;
        policy.min_instances = 2;
        policy.max_instances = 6;
        policy.cooldown = Duration::from_secs(60);
        scaler.create_policy(policy).unwrap();
        scaler
    }

    #[test]
    fn test_scale_up_capped_at_max() {
        let scaler = scaler();
        let event = scaler
            .evaluate_at("us-east", 5, 95, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(event.action, ScalingAction::ScaleUp);
        assert_eq!(event.to_count, 6);
        // Already at max: nothing to do
        let later = Instant::now() + Duration::from_secs(120);
        assert!(scaler.evaluate_at("us-east", 6, 95, later).unwrap().is_none());
    }

    #[test]
    fn test_cooldown_allows_one_event_per_window() {
        let scaler = scaler();
        let t0 = Instant::now();
        assert!(scaler.evaluate_at("us-east", 2, 90, t0).unwrap().is_some());
        assert!(scaler
            .evaluate_at("us-east", 5, 90, t0 + Duration::from_secs(30))
            .unwrap()
            .is_none());
        assert!(scaler
            .evaluate_at("us-east", 5, 90, t0 + Duration::from_secs(61))
            .unwrap()
            .is_some());
        assert_eq!(scaler.get_scaling_events(Some("us-east"), 10).len(), 2);
    }

    #[test]
    fn test_scale_down_floored_at_min() {
        let scaler = scaler();
        let event = scaler
            .evaluate_at("us-east", 3, 5, Instant::now())
            .unwrap()
            .unwrap();
        assert_eq!(event.action, ScalingAction::ScaleDown);
        assert_eq!(event.to_count, 2);
        let later = Instant::now() + Duration::from_secs(120);
        assert!(scaler.evaluate_at("us-east", 2, 5, later).unwrap().is_none());
    }

    #[test]
    fn test_patch_rejects_invalid_and_keeps_old() {
        let scaler = scaler();
        let bad = ScalingPolicyPatch {
            scale_down_threshold: Some(90),
            ..Default::default()
        };
        assert!(scaler.update_policy("us-east", &bad).is_err());
        assert_eq!(scaler.policy("us-east").unwrap().scale_down_threshold, 20);

        let good = ScalingPolicyPatch {
            scale_up_threshold: Some(70),
            ..Default::default()
        };
        let updated = scaler.update_policy("us-east", &good).unwrap();
        assert_eq!(updated.scale_up_threshold, 70);
        assert_eq!(updated.max_instances, 6);
    }

    #[test]
    fn test_event_history_bounded() {
        let scaler = scaler().with_event_limit(2);
        let mut now = Instant::now();
        for _ in 0..4 {
            scaler.evaluate_at("us-east", 2, 95, now).unwrap();
            now += Duration::from_secs(61);
        }
        let events = scaler.get_scaling_events(None, 10);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 3);
        assert_eq!(scaler.metrics().scale_up_count, 2);
    }
}
