// Shard registry and routing: tenants map to shards by jump consistent hash,
// cutovers install redirects

use crate::connection_pool::{ConnectionPool, PooledConnection};
use crate::store::{ShardStore, StoreStats};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shardline_core::{Error, Result, ShardId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Static description of a shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: ShardId,
    pub region: Option<String>,
    pub location: String,
}

impl ShardInfo {
    pub fn new(id: ShardId, location: impl Into<String>) -> Self {
        Self {
            id,
            region: None,
            location: location.into(),
        }
    }
}

/// A registered shard: its store and connection pool
pub struct ShardHandle {
    pub info: ShardInfo,
    pool: ConnectionPool,
}

impl ShardHandle {
    pub fn id(&self) -> ShardId {
        self.info.id
    }

    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.pool.acquire().await
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

/// Outcome of probing one shard
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub shard_id: ShardId,
    pub reachable: bool,
    pub response_time: Duration,
    pub stats: Option<StoreStats>,
    pub error: Option<String>,
}

/// Installs the routing switch at the end of a migration
#[async_trait]
pub trait CutoverHandler: Send + Sync {
    async fn switch_route(&self, source: ShardId, target: ShardId) -> Result<()>;
}

/// Durable home for cutover redirects
pub trait RouteSink: Send + Sync {
    fn save_routes(&self, routes: &HashMap<ShardId, ShardId>) -> Result<()>;
}

/// Jump consistent hash (Lamping & Veach)
pub fn jump_consistent_hash(mut key: u64, buckets: u32) -> u32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1u64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b.max(0) as u32
}

/// Stable 64-bit hash of a tenant identifier
pub fn tenant_hash(tenant: &str) -> u64 {
    let digest = Sha256::digest(tenant.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Routes shard ids and tenants to live shard handles.
///
/// Redirects map a home shard straight to the shard serving it; they never
/// chain.
pub struct ShardRouter {
    shards: DashMap<ShardId, Arc<ShardHandle>>,
    redirects: RwLock<HashMap<ShardId, ShardId>>,
    route_sink: Option<Arc<dyn RouteSink>>,
    default_max_connections: usize,
    acquire_timeout: Duration,
}

impl ShardRouter {
    pub fn new(default_max_connections: usize, acquire_timeout: Duration) -> Self {
        Self {
            shards: DashMap::new(),
            redirects: RwLock::new(HashMap::new()),
            route_sink: None,
            default_max_connections,
            acquire_timeout,
        }
    }

    /// Persist every redirect change through `sink` before it takes effect
    pub fn with_route_sink(mut self, sink: Arc<dyn RouteSink>) -> Self {
        self.route_sink = Some(sink);
        self
    }

    /// Load redirects saved by an earlier process
    pub fn restore_routes(&self, routes: HashMap<ShardId, ShardId>) {
        let mut redirects = self.redirects.write();
        redirects.clear();
        redirects.extend(routes.into_iter().filter(|(from, to)| from != to));
        if !redirects.is_empty() {
            info!("Restored {} shard redirects", redirects.len());
        }
    }

    pub fn routes(&self) -> HashMap<ShardId, ShardId> {
        self.redirects.read().clone()
    }

    pub fn register(&self, info: ShardInfo, store: Arc<dyn ShardStore>) -> Result<Arc<ShardHandle>> {
        let max = self.default_max_connections;
        self.register_with_pool(info, store, max)
    }

    pub fn register_with_pool(
        &self,
        info: ShardInfo,
        store: Arc<dyn ShardStore>,
        max_connections: usize,
    ) -> Result<Arc<ShardHandle>> {
        if store.shard_id() != info.id {
            return Err(Error::Validation(format!(
                "store reports {} but was registered as {}",
                store.shard_id(),
                info.id
            )));
        }
        let handle = Arc::new(ShardHandle {
            pool: ConnectionPool::new(store, max_connections, self.acquire_timeout),
            info,
        });
        if self.shards.insert(handle.id(), handle.clone()).is_some() {
            info!("Replaced registration of {}", handle.id());
        } else {
            info!("Registered {} ({})", handle.id(), handle.info.location);
        }
        Ok(handle)
    }

    pub fn deregister(&self, id: ShardId) -> Option<Arc<ShardHandle>> {
        let removed = self.shards.remove(&id).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            handle.pool().close();
            self.redirects.write().retain(|from, to| *from != id && *to != id);
            info!("Deregistered {}", id);
        }
        removed
    }

    pub fn contains(&self, id: ShardId) -> bool {
        self.shards.contains_key(&id)
    }

    pub fn get(&self, id: ShardId) -> Result<Arc<ShardHandle>> {
        self.shards
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("{} is not registered", id)))
    }

    /// Registered shard ids in ascending order
    pub fn shard_ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.shards.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Shard currently serving data homed on `id`
    pub fn resolve(&self, id: ShardId) -> ShardId {
        self.redirects.read().get(&id).copied().unwrap_or(id)
    }

    pub fn redirect_for(&self, id: ShardId) -> Option<ShardId> {
        self.redirects.read().get(&id).copied()
    }

    pub fn clear_redirect(&self, id: ShardId) -> Result<Option<ShardId>> {
        let mut redirects = self.redirects.write();
        let mut next = redirects.clone();
        let removed = next.remove(&id);
        if removed.is_some() {
            self.persist_routes(&next)?;
            *redirects = next;
        }
        Ok(removed)
    }

    fn persist_routes(&self, routes: &HashMap<ShardId, ShardId>) -> Result<()> {
        match &self.route_sink {
            Some(sink) => sink.save_routes(routes),
            None => Ok(()),
        }
    }

    /// Home shard of a tenant, before redirects
    pub fn home_shard(&self, tenant: &str) -> Result<ShardId> {
        let ids = self.shard_ids();
        if ids.is_empty() {
            return Err(Error::NotFound("no shards registered".to_string()));
        }
        let bucket = jump_consistent_hash(tenant_hash(tenant), ids.len() as u32);
        Ok(ids[bucket as usize])
    }

    /// Shard currently serving a tenant
    pub fn route_tenant(&self, tenant: &str) -> Result<Arc<ShardHandle>> {
        let home = self.home_shard(tenant)?;
        self.get(self.resolve(home))
    }

    pub async fn acquire(&self, id: ShardId) -> Result<PooledConnection> {
        self.get(id)?.acquire().await
    }

    /// Ping a shard and collect its stats, bounded by `timeout`
    pub async fn probe(&self, id: ShardId, timeout: Duration) -> ProbeResult {
        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, async {
            let conn = self.acquire(id).await?;
            conn.ping().await?;
            conn.stats().await
        })
        .await;

        let response_time = start.elapsed();
        match outcome {
            Ok(Ok(stats)) => ProbeResult {
                shard_id: id,
                reachable: true,
                response_time,
                stats: Some(stats),
                error: None,
            },
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", id, e);
                ProbeResult {
                    shard_id: id,
                    reachable: false,
                    response_time,
                    stats: None,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => ProbeResult {
                shard_id: id,
                reachable: false,
                response_time,
                stats: None,
                error: Some(format!("probe timed out after {:?}", timeout)),
            },
        }
    }

    pub async fn probe_all(&self, timeout: Duration) -> Vec<ProbeResult> {
        let probes = self.shard_ids().into_iter().map(|id| self.probe(id, timeout));
        futures::future::join_all(probes).await
    }
}

#[async_trait]
impl CutoverHandler for ShardRouter {
    async fn switch_route(&self, source: ShardId, target: ShardId) -> Result<()> {
        if source == target {
            return Err(Error::Cutover(format!("cannot redirect {} to itself", source)));
        }
        if !self.contains(target) {
            return Err(Error::Cutover(format!("{} is not registered", target)));
        }
        // Everything served by `source` moves to `target`, including shards
        // previously redirected onto `source`.
        let mut redirects = self.redirects.write();
        let mut next = redirects.clone();
        for serving in next.values_mut() {
            if *serving == source {
                *serving = target;
            }
        }
        next.insert(source, target);
        next.retain(|from, to| from != to);
        self.persist_routes(&next)
            .map_err(|e| Error::Cutover(format!("could not persist routing switch: {}", e)))?;
        *redirects = next;
        drop(redirects);
        info!("Routing for {} now points at {}", source, target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryShardStore;

    fn router_with(ids: &[u32]) -> ShardRouter {
        let router = ShardRouter::new(4, Duration::from_secs(1));
        for id in ids {
            let store = Arc::new(MemoryShardStore::new(ShardId(*id)));
            router
                .register(ShardInfo::new(ShardId(*id), format!("mem://{}", id)), store)
                .unwrap();
        }
        router
    }

    #[test]
    fn test_jump_hash_range() {
        for key in 0..1000u64 {
            assert!(jump_consistent_hash(key, 7) < 7);
        }
        assert_eq!(jump_consistent_hash(42, 1), 0);
    }

    #[test]
    fn test_register_rejects_mismatched_store() {
        let router = ShardRouter::new(4, Duration::from_secs(1));
        let store = Arc::new(MemoryShardStore::new(ShardId(1)));
        assert!(router.register(ShardInfo::new(ShardId(2), "mem"), store).is_err());
    }

    #[test]
    fn test_tenant_routing_is_stable() {
        let router = router_with(&[0, 1, 2, 3]);
        let a = router.home_shard("restaurant-42").unwrap();
        let b = router.home_shard("restaurant-42").unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_cutover_redirects_tenant() {
        let router = router_with(&[0, 1]);
        let home = router.home_shard("tenant-a").unwrap();
        let other = if home == ShardId(0) { ShardId(1) } else { ShardId(0) };

        router.switch_route(home, other).await.unwrap();
        assert_eq!(router.route_tenant("tenant-a").unwrap().id(), other);
        assert!(router.switch_route(home, home).await.is_err());

        // Moving the data back leaves no redirect for the home shard
        router.switch_route(other, home).await.unwrap();
        assert_eq!(router.redirect_for(home), None);
        assert_eq!(router.resolve(other), home);
        assert_eq!(router.route_tenant("tenant-a").unwrap().id(), home);
    }

    #[tokio::test]
    async fn test_redirects_never_chain() {
        let router = router_with(&[0, 1, 2]);
        router.switch_route(ShardId(0), ShardId(1)).await.unwrap();
        router.switch_route(ShardId(1), ShardId(2)).await.unwrap();
        assert_eq!(router.redirect_for(ShardId(0)), Some(ShardId(2)));
        assert_eq!(router.resolve(ShardId(1)), ShardId(2));
        assert_eq!(router.resolve(ShardId(2)), ShardId(2));
    }

    struct FailingSink;

    impl RouteSink for FailingSink {
        fn save_routes(&self, _routes: &HashMap<ShardId, ShardId>) -> Result<()> {
            Err(Error::Storage("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn test_unpersisted_switch_is_not_applied() {
        let router = ShardRouter::new(4, Duration::from_secs(1)).with_route_sink(Arc::new(FailingSink));
        for id in [0, 1] {
            router
                .register(ShardInfo::new(ShardId(id), "mem"), Arc::new(MemoryShardStore::new(ShardId(id))))
                .unwrap();
        }
        let err = router.switch_route(ShardId(0), ShardId(1)).await.unwrap_err();
        assert!(matches!(err, Error::Cutover(_)));
        assert_eq!(router.resolve(ShardId(0)), ShardId(0));
    }

    #[tokio::test]
    async fn test_probe_unreachable_shard() {
        let router = ShardRouter::new(2, Duration::from_secs(1));
        let store = Arc::new(MemoryShardStore::new(ShardId(5)));
        store.set_unreachable(true);
        router.register(ShardInfo::new(ShardId(5), "mem"), store).unwrap();

        let result = router.probe(ShardId(5), Duration::from_millis(200)).await;
        assert!(!result.reachable);
        assert!(result.error.is_some());
    }
}
