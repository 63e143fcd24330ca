// Multi-region deployment layout: data centers, traffic split and latency

use crate::load_balancer::LoadBalancer;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardline_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCenter {
    pub id: String,
    pub name: String,
    pub location: String,
    pub provider: String,
    pub region: String,
    pub latitude: f64,
    pub longitude: f64,
    pub capacity: u32,
    pub current_count: u32,
    pub active: bool,
    pub primary: bool,
    pub tier: String,
    pub created_at: DateTime<Utc>,
}

impl DataCenter {
    pub fn utilization(&self) -> u32 {
        if self.capacity == 0 {
            0
        } else {
            self.current_count * 100 / self.capacity
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentStrategy {
    ActiveActive,
    ActivePassive,
    ActiveWarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRegionConfig {
    pub name: String,
    /// In preference order; the first is the primary
    pub active_regions: Vec<String>,
    pub data_residency_region: Option<String>,
    pub disaster_recovery_region: Option<String>,
    pub strategy: DeploymentStrategy,
    pub cost_optimization: bool,
    pub latency_target_ms: u32,
    pub replication_mode: ReplicationMode,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl MultiRegionConfig {
    pub fn new(name: impl Into<String>, active_regions: Vec<String>, strategy: DeploymentStrategy) -> Self {
        Self {
            name: name.into(),
            active_regions,
            data_residency_region: None,
            disaster_recovery_region: None,
            strategy,
            cost_optimization: false,
            latency_target_ms: 100,
            replication_mode: ReplicationMode::Async,
            active: true,
            created_at: Utc::now(),
        }
    }

    /// Percentage of traffic per region for this strategy
    pub fn traffic_distribution(&self) -> BTreeMap<String, f64> {
        let regions = &self.active_regions;
        let mut split: BTreeMap<String, f64> = regions.iter().map(|r| (r.clone(), 0.0)).collect();
        if regions.is_empty() {
            return split;
        }
        match self.strategy {
            DeploymentStrategy::ActiveActive => {
                let share = 100.0 / regions.len() as f64;
                for region in regions {
                    split.insert(region.clone(), share);
                }
            }
            DeploymentStrategy::ActivePassive => {
                split.insert(regions[0].clone(), 100.0);
            }
            DeploymentStrategy::ActiveWarm => {
                if regions.len() >= 2 {
                    split.insert(regions[0].clone(), 80.0);
                    split.insert(regions[1].clone(), 20.0);
                } else {
                    split.insert(regions[0].clone(), 100.0);
                }
            }
        }
        split
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRegionStatus {
    pub config_name: String,
    pub strategy: DeploymentStrategy,
    pub active_regions: Vec<String>,
    pub data_residency_region: Option<String>,
    pub disaster_recovery_region: Option<String>,
    pub replication_mode: ReplicationMode,
    pub total_data_centers: usize,
    pub total_capacity: u64,
    pub total_servers: u64,
    pub healthy_servers: usize,
    pub traffic_distribution: BTreeMap<String, f64>,
    pub latency_target_ms: u32,
}

pub struct MultiRegionDeployment {
    balancer: Arc<LoadBalancer>,
    data_centers: RwLock<BTreeMap<String, DataCenter>>,
    configs: RwLock<HashMap<String, MultiRegionConfig>>,
    // from -> to -> latency in ms
    latencies: RwLock<HashMap<String, HashMap<String, u32>>>,
    traffic: RwLock<BTreeMap<String, f64>>,
}

impl MultiRegionDeployment {
    pub fn new(balancer: Arc<LoadBalancer>) -> Self {
        Self {
            balancer,
            data_centers: RwLock::new(BTreeMap::new()),
            configs: RwLock::new(HashMap::new()),
            latencies: RwLock::new(HashMap::new()),
            traffic: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn register_data_center(&self, dc: DataCenter) {
        info!("Registering data center {} ({}) in {}", dc.id, dc.provider, dc.location);
        self.traffic.write().entry(dc.region.clone()).or_insert(0.0);
        self.data_centers.write().insert(dc.id.clone(), dc);
    }

    pub fn data_center(&self, id: &str) -> Option<DataCenter> {
        self.data_centers.read().get(id).cloned()
    }

    pub fn create_config(&self, config: MultiRegionConfig) -> Result<()> {
        if config.active_regions.is_empty() {
            return Err(Error::Validation(format!(
                "deployment {} has no active regions",
                config.name
            )));
        }
        info!(
            "Deployment config {} ({:?}, regions {:?})",
            config.name, config.strategy, config.active_regions
        );
        self.configs.write().insert(config.name.clone(), config);
        Ok(())
    }

    pub fn config(&self, name: &str) -> Option<MultiRegionConfig> {
        self.configs.read().get(name).cloned()
    }

    pub fn update_latency(&self, from: &str, to: &str, latency_ms: u32) {
        self.latencies
            .write()
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string(), latency_ms);
    }

    /// Measured latency, `None` when never reported
    pub fn latency(&self, from: &str, to: &str) -> Option<u32> {
        self.latencies.read().get(from).and_then(|m| m.get(to)).copied()
    }

    pub fn latency_matrix(&self) -> HashMap<String, HashMap<String, u32>> {
        self.latencies.read().clone()
    }

    /// Compute and store the traffic split for a deployment config
    pub fn optimize_traffic(&self, name: &str) -> Result<BTreeMap<String, f64>> {
        let config = self
            .config(name)
            .ok_or_else(|| Error::NotFound(format!("deployment config {}", name)))?;
        let split = config.traffic_distribution();
        *self.traffic.write() = split.clone();
        info!("Traffic distribution for {}: {:?}", name, split);
        Ok(split)
    }

    /// The client's own region when it is active; otherwise the active region
    /// with the lowest positive measured latency; otherwise the first one
    pub fn select_region_for_request(&self, client_region: &str, name: &str) -> Result<String> {
        let config = self
            .config(name)
            .ok_or_else(|| Error::NotFound(format!("deployment config {}", name)))?;
        if config.active_regions.iter().any(|r| r == client_region) {
            return Ok(client_region.to_string());
        }
        let nearest = config
            .active_regions
            .iter()
            .filter_map(|r| {
                self.latency(client_region, r)
                    .filter(|l| *l > 0)
                    .map(|l| (l, r))
            })
            .min_by_key(|(l, _)| *l)
            .map(|(_, r)| r.clone());
        nearest
            .or_else(|| config.active_regions.first().cloned())
            .ok_or_else(|| Error::Validation(format!("deployment {} has no active regions", name)))
    }

    pub fn distance_between_data_centers(&self, a: &str, b: &str) -> Option<f64> {
        let dcs = self.data_centers.read();
        let (a, b) = (dcs.get(a)?, dcs.get(b)?);
        Some(haversine_km(a.latitude, a.longitude, b.latitude, b.longitude))
    }

    pub fn status(&self, name: &str) -> Option<MultiRegionStatus> {
        let config = self.config(name)?;
        let dcs = self.data_centers.read();
        let active: Vec<&DataCenter> = dcs.values().filter(|dc| dc.active).collect();
        let healthy_servers = config
            .active_regions
            .iter()
            .filter_map(|r| self.balancer.region_stats(r))
            .map(|s| s.healthy_servers)
            .sum();
        Some(MultiRegionStatus {
            config_name: config.name.clone(),
            strategy: config.strategy,
            active_regions: config.active_regions.clone(),
            data_residency_region: config.data_residency_region.clone(),
            disaster_recovery_region: config.disaster_recovery_region.clone(),
            replication_mode: config.replication_mode,
            total_data_centers: active.len(),
            total_capacity: active.iter().map(|dc| dc.capacity as u64).sum(),
            total_servers: active.iter().map(|dc| dc.current_count as u64).sum(),
            healthy_servers,
            traffic_distribution: self.traffic.read().clone(),
            latency_target_ms: config.latency_target_ms,
        })
    }
}
