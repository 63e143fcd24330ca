// Global request routing across regions and application servers

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use shardline_core::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Geographic region hosting servers. Lower `priority` wins under geo routing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub continent: String,
    pub latitude: f64,
    pub longitude: f64,
    pub priority: u32,
    pub active: bool,
}

impl Region {
    pub fn new(
        name: impl Into<String>,
        continent: impl Into<String>,
        latitude: f64,
        longitude: f64,
        priority: u32,
    ) -> Self {
        Self {
            name: name.into(),
            continent: continent.into(),
            latitude,
            longitude,
            priority,
            active: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub region: String,
    pub endpoint: String,
    pub port: u16,
    /// Relative weight for weighted-random, 1..=100
    pub weight: u32,
    /// Requests per second the server can take
    pub capacity: u32,
    pub current_load: u32,
    pub healthy: bool,
    pub response_time: Duration,
    /// Fraction of failed requests, 0.0..=1.0
    pub error_rate: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub last_health_check: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Server {
    pub fn new(
        id: impl Into<String>,
        region: impl Into<String>,
        endpoint: impl Into<String>,
        port: u16,
        weight: u32,
        capacity: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            region: region.into(),
            endpoint: endpoint.into(),
            port,
            weight,
            capacity,
            current_load: 0,
            healthy: true,
            response_time: Duration::ZERO,
            error_rate: 0.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            last_health_check: now,
            created_at: now,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}", self.endpoint, self.port)
    }

    /// Load as a percentage of capacity; a zero-capacity server counts as full
    pub fn utilization(&self) -> u32 {
        if self.capacity == 0 {
            100
        } else {
            ((self.current_load as u64 * 100) / self.capacity as u64) as u32
        }
    }

    /// 100 minus the error rate in percent, minus 5/10 points each for CPU and
    /// memory above 80/90 percent, floored at 0
    pub fn health_percentage(&self) -> u32 {
        let mut health = 100i64 - (self.error_rate * 100.0) as i64;
        health -= pressure_penalty(self.cpu_usage);
        health -= pressure_penalty(self.memory_usage);
        health.max(0) as u32
    }
}

fn pressure_penalty(usage: f64) -> i64 {
    if usage > 90.0 {
        10
    } else if usage > 80.0 {
        5
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    RoundRobin,
    LeastLoaded,
    Fastest,
    Geo,
    WeightedRandom,
}

impl std::fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LoadBalancingStrategy::RoundRobin => "round_robin",
            LoadBalancingStrategy::LeastLoaded => "least_loaded",
            LoadBalancingStrategy::Fastest => "fastest",
            LoadBalancingStrategy::Geo => "geo",
            LoadBalancingStrategy::WeightedRandom => "weighted_random",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStats {
    pub id: String,
    pub region: String,
    pub url: String,
    pub healthy: bool,
    pub current_load: u32,
    pub capacity: u32,
    pub utilization: u32,
    pub response_time_ms: u64,
    pub error_rate_percent: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub health_percentage: u32,
    pub last_health_check: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionStats {
    pub name: String,
    pub continent: String,
    pub active: bool,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub total_load: u64,
    pub total_capacity: u64,
    pub utilization: u32,
    pub avg_response_ms: u64,
}

impl RegionStats {
    /// Healthy servers as a percentage of all servers; `None` when empty
    pub fn health_percentage(&self) -> Option<u32> {
        if self.total_servers == 0 {
            None
        } else {
            Some((self.healthy_servers * 100 / self.total_servers) as u32)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalStats {
    pub strategy: LoadBalancingStrategy,
    pub total_regions: usize,
    pub active_regions: usize,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub total_load: u64,
    pub total_capacity: u64,
    pub utilization: u32,
    pub avg_response_ms: u64,
    pub active_sessions: usize,
    pub session_affinity: bool,
}

struct Session {
    server_id: String,
    last_seen: Instant,
}

struct Topology {
    regions: HashMap<String, Region>,
    // Ordered so round-robin walks a stable sequence
    servers: BTreeMap<String, Server>,
}

pub struct LoadBalancer {
    topology: RwLock<Topology>,
    strategy: RwLock<LoadBalancingStrategy>,
    round_robin_index: RwLock<usize>,
    sessions: DashMap<String, Session>,
    session_affinity: bool,
    session_ttl: Duration,
}

impl LoadBalancer {
    pub fn new(strategy: LoadBalancingStrategy) -> Self {
        Self {
            topology: RwLock::new(Topology {
                regions: HashMap::new(),
                servers: BTreeMap::new(),
            }),
            strategy: RwLock::new(strategy),
            round_robin_index: RwLock::new(0),
            sessions: DashMap::new(),
            session_affinity: true,
            session_ttl: Duration::from_secs(30 * 60),
        }
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_session_affinity(mut self, enabled: bool) -> Self {
        self.session_affinity = enabled;
        self
    }

    pub fn register_region(&self, region: Region) {
        info!("Registering region {} (priority {})", region.name, region.priority);
        self.topology.write().regions.insert(region.name.clone(), region);
    }

    pub fn register_server(&self, server: Server) -> Result<()> {
        let mut topology = self.topology.write();
        if !topology.regions.contains_key(&server.region) {
            return Err(Error::NotFound(format!("region {}", server.region)));
        }
        info!(
            "Registering server {} in {} (capacity {} req/s)",
            server.id, server.region, server.capacity
        );
        topology.servers.insert(server.id.clone(), server);
        Ok(())
    }

    pub fn remove_server(&self, id: &str) -> Option<Server> {
        let removed = self.topology.write().servers.remove(id);
        if removed.is_some() {
            self.sessions.retain(|_, session| session.server_id != id);
            info!("Removed server {}", id);
        }
        removed
    }

    pub fn region(&self, name: &str) -> Option<Region> {
        self.topology.read().regions.get(name).cloned()
    }

    pub fn regions(&self) -> Vec<Region> {
        let mut regions: Vec<Region> = self.topology.read().regions.values().cloned().collect();
        regions.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        regions
    }

    pub fn server(&self, id: &str) -> Option<Server> {
        self.topology.read().servers.get(id).cloned()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.topology.read().servers.values().cloned().collect()
    }

    pub fn servers_in_region(&self, region: &str) -> Vec<Server> {
        self.topology
            .read()
            .servers
            .values()
            .filter(|s| s.region == region)
            .cloned()
            .collect()
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        *self.strategy.read()
    }

    pub fn set_strategy(&self, strategy: LoadBalancingStrategy) {
        *self.strategy.write() = strategy;
        info!("Load balancing strategy changed to {}", strategy);
    }

    /// Pick a server for one request.
    ///
    /// A live session sticks to its server while that server stays healthy
    /// and its region active. Otherwise candidates are the healthy servers of
    /// active regions, narrowed to `preferred_region` when it has any.
    pub fn select_server(&self, session_id: Option<&str>, preferred_region: Option<&str>) -> Result<Server> {
        let topology = self.topology.read();

        if self.session_affinity {
            if let Some(session_id) = session_id {
                if let Some(server) = self.sticky_server(&topology, session_id) {
                    debug!("Session {} stays on {}", session_id, server.id);
                    return Ok(server);
                }
            }
        }

        let candidates = Self::candidates(&topology, preferred_region);
        if candidates.is_empty() {
            return Err(Error::NoAvailableServers(match preferred_region {
                Some(region) => format!("no healthy server (preferred region {})", region),
                None => "no healthy server in any active region".to_string(),
            }));
        }

        let strategy = self.strategy();
        let selected = match strategy {
            LoadBalancingStrategy::RoundRobin => self.select_round_robin(&candidates),
            LoadBalancingStrategy::LeastLoaded => Self::select_least_loaded(&candidates),
            LoadBalancingStrategy::Fastest => Self::select_fastest(&candidates),
            LoadBalancingStrategy::Geo => Self::select_geo(&topology, &candidates),
            LoadBalancingStrategy::WeightedRandom => Self::select_weighted_random(&candidates),
        };
        let server = selected.clone();
        drop(topology);

        if self.session_affinity {
            if let Some(session_id) = session_id {
                self.sessions.insert(
                    session_id.to_string(),
                    Session {
                        server_id: server.id.clone(),
                        last_seen: Instant::now(),
                    },
                );
            }
        }
        debug!("Selected server {} ({})", server.id, strategy);
        Ok(server)
    }

    fn sticky_server(&self, topology: &Topology, session_id: &str) -> Option<Server> {
        let mut session = self.sessions.get_mut(session_id)?;
        let usable = session.last_seen.elapsed() < self.session_ttl
            && topology
                .servers
                .get(&session.server_id)
                .map(|s| s.healthy && Self::region_active(topology, &s.region))
                .unwrap_or(false);
        if !usable {
            drop(session);
            self.sessions.remove(session_id);
            return None;
        }
        session.last_seen = Instant::now();
        topology.servers.get(&session.server_id).cloned()
    }

    fn region_active(topology: &Topology, region: &str) -> bool {
        topology.regions.get(region).map(|r| r.active).unwrap_or(false)
    }

    fn candidates<'a>(topology: &'a Topology, preferred_region: Option<&str>) -> Vec<&'a Server> {
        let usable = |s: &&Server| s.healthy && Self::region_active(topology, &s.region);
        if let Some(region) = preferred_region {
            let preferred: Vec<&Server> = topology
                .servers
                .values()
                .filter(|s| s.region == region)
                .filter(usable)
                .collect();
            if !preferred.is_empty() {
                return preferred;
            }
        }
        topology.servers.values().filter(usable).collect()
    }

    fn select_round_robin<'a>(&self, servers: &[&'a Server]) -> &'a Server {
        let mut index = self.round_robin_index.write();
        let selected = servers[*index % servers.len()];
        *index = index.wrapping_add(1);
        selected
    }

    fn select_least_loaded<'a>(servers: &[&'a Server]) -> &'a Server {
        servers
            .iter()
            .copied()
            .min_by_key(|s| s.utilization())
            .unwrap_or(servers[0])
    }

    fn select_fastest<'a>(servers: &[&'a Server]) -> &'a Server {
        servers
            .iter()
            .copied()
            .min_by_key(|s| s.response_time)
            .unwrap_or(servers[0])
    }

    fn select_geo<'a>(topology: &Topology, servers: &[&'a Server]) -> &'a Server {
        let priority = |s: &Server| {
            topology
                .regions
                .get(&s.region)
                .map(|r| r.priority)
                .unwrap_or(u32::MAX)
        };
        let best = servers.iter().map(|s| priority(*s)).min().unwrap_or(u32::MAX);
        let in_best: Vec<&'a Server> = servers
            .iter()
            .copied()
            .filter(|s| priority(*s) == best)
            .collect();
        in_best[rand::thread_rng().gen_range(0..in_best.len())]
    }

    fn select_weighted_random<'a>(servers: &[&'a Server]) -> &'a Server {
        let total: u64 = servers.iter().map(|s| s.weight as u64).sum();
        let mut rng = rand::thread_rng();
        if total == 0 {
            return servers[rng.gen_range(0..servers.len())];
        }
        let mut pick = rng.gen_range(0..total);
        for server in servers {
            if pick < server.weight as u64 {
                return *server;
            }
            pick -= server.weight as u64;
        }
        servers[0]
    }

    pub fn update_server_metrics(
        &self,
        id: &str,
        current_load: u32,
        response_time: Duration,
        error_rate: f64,
        cpu_usage: f64,
        memory_usage: f64,
    ) -> Result<()> {
        let mut topology = self.topology.write();
        let server = topology
            .servers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("server {}", id)))?;
        server.current_load = current_load;
        server.response_time = response_time;
        server.error_rate = error_rate.clamp(0.0, 1.0);
        server.cpu_usage = cpu_usage;
        server.memory_usage = memory_usage;
        server.last_health_check = Utc::now();
        debug!(
            "Metrics for {}: load {}/{}, {:?}, errors {:.2}%",
            id,
            current_load,
            server.capacity,
            response_time,
            server.error_rate * 100.0
        );
        Ok(())
    }

    pub fn set_server_health(&self, id: &str, healthy: bool) -> Result<()> {
        let mut topology = self.topology.write();
        let server = topology
            .servers
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("server {}", id)))?;
        if server.healthy != healthy {
            info!(
                "Server {} marked {}",
                id,
                if healthy { "healthy" } else { "unhealthy" }
            );
        }
        server.healthy = healthy;
        server.last_health_check = Utc::now();
        Ok(())
    }

    pub fn set_region_active(&self, name: &str, active: bool) -> Result<()> {
        let mut topology = self.topology.write();
        let region = topology
            .regions
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("region {}", name)))?;
        region.active = active;
        info!(
            "Region {} {}",
            name,
            if active { "activated" } else { "deactivated" }
        );
        Ok(())
    }

    pub fn server_stats(&self, id: &str) -> Option<ServerStats> {
        let topology = self.topology.read();
        let server = topology.servers.get(id)?;
        Some(ServerStats {
            id: server.id.clone(),
            region: server.region.clone(),
            url: server.url(),
            healthy: server.healthy,
            current_load: server.current_load,
            capacity: server.capacity,
            utilization: server.utilization(),
            response_time_ms: server.response_time.as_millis() as u64,
            error_rate_percent: server.error_rate * 100.0,
            cpu_usage: server.cpu_usage,
            memory_usage: server.memory_usage,
            health_percentage: server.health_percentage(),
            last_health_check: server.last_health_check,
        })
    }

    pub fn region_stats(&self, name: &str) -> Option<RegionStats> {
        let topology = self.topology.read();
        let region = topology.regions.get(name)?;
        let servers: Vec<&Server> = topology.servers.values().filter(|s| s.region == name).collect();
        let (load, capacity, avg) = aggregate(&servers);
        Some(RegionStats {
            name: region.name.clone(),
            continent: region.continent.clone(),
            active: region.active,
            total_servers: servers.len(),
            healthy_servers: servers.iter().filter(|s| s.healthy).count(),
            total_load: load,
            total_capacity: capacity,
            utilization: percent(load, capacity),
            avg_response_ms: avg,
        })
    }

    pub fn global_stats(&self) -> GlobalStats {
        let topology = self.topology.read();
        let servers: Vec<&Server> = topology.servers.values().collect();
        let (load, capacity, avg) = aggregate(&servers);
        GlobalStats {
            strategy: self.strategy(),
            total_regions: topology.regions.len(),
            active_regions: topology.regions.values().filter(|r| r.active).count(),
            total_servers: servers.len(),
            healthy_servers: servers.iter().filter(|s| s.healthy).count(),
            total_load: load,
            total_capacity: capacity,
            utilization: percent(load, capacity),
            avg_response_ms: avg,
            active_sessions: self.sessions.len(),
            session_affinity: self.session_affinity,
        }
    }

    /// Drop sessions idle for longer than the TTL
    pub fn cleanup_expired_sessions(&self) -> usize {
        let ttl = self.session_ttl;
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.last_seen.elapsed() < ttl);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            info!("Cleaned up {} expired sessions", removed);
        }
        removed
    }
}

fn aggregate(servers: &[&Server]) -> (u64, u64, u64) {
    let load = servers.iter().map(|s| s.current_load as u64).sum();
    let capacity = servers.iter().map(|s| s.capacity as u64).sum();
    let avg = if servers.is_empty() {
        0
    } else {
        let total: u128 = servers.iter().map(|s| s.response_time.as_millis()).sum();
        (total / servers.len() as u128) as u64
    };
    (load, capacity, avg)
}

fn percent(part: u64, whole: u64) -> u32 {
    if whole == 0 {
        0
    } else {
        (part * 100 / whole) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn balancer(strategy: LoadBalancingStrategy) -> LoadBalancer {
        let lb = LoadBalancer::new(strategy);
        lb.register_region(Region::new("us-east", "north-america", 39.0, -77.5, 1));
        lb.register_region(Region::new("eu-west", "europe", 53.3, -6.2, 2));
        lb.register_server(Server::new("a", "us-east", "10.0.0.1", 8080, 10, 100)).unwrap();
        lb.register_server(Server::new("b", "us-east", "10.0.0.2", 8080, 10, 100)).unwrap();
        lb.register_server(Server::new("c", "eu-west", "10.1.0.1", 8080, 10, 100)).unwrap();
        lb
    }

    #[test]
    fn test_round_robin_cycles() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin);
        let picks: Vec<String> = (0..6)
            .map(|_| lb.select_server(None, None).unwrap().id)
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_least_loaded_and_fastest() {
        let lb = balancer(LoadBalancingStrategy::LeastLoaded);
        lb.update_server_metrics("a", 90, Duration::from_millis(5), 0.0, 10.0, 10.0).unwrap();
        lb.update_server_metrics("b", 10, Duration::from_millis(50), 0.0, 10.0, 10.0).unwrap();
        lb.update_server_metrics("c", 50, Duration::from_millis(20), 0.0, 10.0, 10.0).unwrap();
        assert_eq!(lb.select_server(None, None).unwrap().id, "b");

        lb.set_strategy(LoadBalancingStrategy::Fastest);
        assert_eq!(lb.select_server(None, None).unwrap().id, "a");
    }

    #[test]
    fn test_geo_prefers_priority_region() {
        let lb = balancer(LoadBalancingStrategy::Geo);
        for _ in 0..10 {
            assert_eq!(lb.select_server(None, None).unwrap().region, "us-east");
        }
    }

    #[test]
    fn test_preferred_region_with_fallback() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin);
        assert_eq!(lb.select_server(None, Some("eu-west")).unwrap().id, "c");
        lb.set_server_health("c", false).unwrap();
        assert_eq!(lb.select_server(None, Some("eu-west")).unwrap().region, "us-east");
    }

    #[test]
    fn test_inactive_region_skipped() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin);
        lb.set_region_active("us-east", false).unwrap();
        for _ in 0..4 {
            assert_eq!(lb.select_server(None, None).unwrap().id, "c");
        }
    }

    #[test]
    fn test_session_affinity_until_unhealthy() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin);
        let first = lb.select_server(Some("s1"), None).unwrap().id;
        for _ in 0..3 {
            assert_eq!(lb.select_server(Some("s1"), None).unwrap().id, first);
        }
        lb.set_server_health(&first, false).unwrap();
        assert_ne!(lb.select_server(Some("s1"), None).unwrap().id, first);
    }

    #[test]
    fn test_expired_sessions_cleaned() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin).with_session_ttl(Duration::ZERO);
        lb.select_server(Some("s1"), None).unwrap();
        assert_eq!(lb.cleanup_expired_sessions(), 1);
        assert_eq!(lb.global_stats().active_sessions, 0);
    }

    #[test]
    fn test_no_available_servers_is_retryable() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin);
        for id in ["a", "b", "c"] {
            lb.set_server_health(id, false).unwrap();
        }
        let err = lb.select_server(None, None).unwrap_err();
        assert!(matches!(err, Error::NoAvailableServers(_)));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_health_percentage() {
        let mut server = Server::new("x", "r", "h", 1, 1, 1);
        server.error_rate = 0.1;
        server.cpu_usage = 95.0;
        server.memory_usage = 85.0;
        assert_eq!(server.health_percentage(), 75);
        server.error_rate = 1.0;
        assert_eq!(server.health_percentage(), 0);
    }

    #[test]
    fn test_region_stats() {
        let lb = balancer(LoadBalancingStrategy::RoundRobin);
        lb.update_server_metrics("a", 50, Duration::from_millis(10), 0.0, 0.0, 0.0).unwrap();
        lb.set_server_health("b", false).unwrap();
        let stats = lb.region_stats("us-east").unwrap();
        assert_eq!(stats.total_servers, 2);
        assert_eq!(stats.healthy_servers, 1);
        assert_eq!(stats.utilization, 25);
        assert_eq!(stats.health_percentage(), Some(50));
        assert!(lb.register_server(Server::new("z", "nowhere", "h", 1, 1, 1)).is_err());
    }
}
