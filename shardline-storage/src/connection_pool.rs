// Per-shard connection pooling

use crate::store::ShardStore;
use shardline_core::{Error, Result, ShardId};
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Bounded pool of connections to one shard's store
pub struct ConnectionPool {
    shard_id: ShardId,
    store: Arc<dyn ShardStore>,
    semaphore: Arc<Semaphore>,
    max_connections: usize,
    timeout: Duration,
}

impl ConnectionPool {
    pub fn new(store: Arc<dyn ShardStore>, max_connections: usize, timeout: Duration) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            shard_id: store.shard_id(),
            store,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            max_connections,
            timeout,
        }
    }

    /// Borrow a connection; released when the returned guard drops
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(self.timeout, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| {
                Error::Connectivity(format!(
                    "connection pool for {} timed out after {:?}",
                    self.shard_id, self.timeout
                ))
            })?
            .map_err(|_| Error::Connectivity(format!("connection pool for {} closed", self.shard_id)))?;

        Ok(PooledConnection {
            _permit: permit,
            store: self.store.clone(),
            acquired_at: Instant::now(),
        })
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.max_connections - self.available().min(self.max_connections)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn close(&self) {
        self.semaphore.close();
    }
}

/// Store handle holding a pool permit
pub struct PooledConnection {
    _permit: tokio::sync::OwnedSemaphorePermit,
    store: Arc<dyn ShardStore>,
    acquired_at: Instant,
}

impl PooledConnection {
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl Deref for PooledConnection {
    type Target = dyn ShardStore;

    fn deref(&self) -> &Self::Target {
        self.store.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryShardStore;

    #[tokio::test]
    async fn test_pool_bounds_connections() {
        let store = Arc::new(MemoryShardStore::new(ShardId(0)));
        let pool = ConnectionPool::new(store, 2, Duration::from_millis(50));

        let a = pool.acquire().await.unwrap();
        let _b = pool.acquire().await.unwrap();
        assert_eq!(pool.in_use(), 2);

        let err = pool.acquire().await.err().unwrap();
        assert!(err.is_retryable());

        drop(a);
        assert_eq!(pool.available(), 1);
        let conn = pool.acquire().await.unwrap();
        assert!(conn.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_pool_rejects() {
        let store = Arc::new(MemoryShardStore::new(ShardId(1)));
        let pool = ConnectionPool::new(store, 1, Duration::from_secs(1));
        pool.close();
        assert!(pool.acquire().await.is_err());
    }
}
