// Shard store abstraction plus an in-memory backend with fault injection

use crate::record::{PriorValues, Record, RecordKey, WriteBatch, WriteOp};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use shardline_core::{Error, Result, ShardId};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::time::Duration;

/// Size and freshness figures reported by a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub record_count: u64,
    pub size_bytes: u64,
    pub replication_lag: Option<Duration>,
}

/// Storage backend of one shard
#[async_trait]
pub trait ShardStore: Send + Sync {
    fn shard_id(&self) -> ShardId;

    async fn ping(&self) -> Result<()>;

    async fn count(&self) -> Result<u64>;

    /// Up to `limit` records with key strictly greater than `after`, in key order
    async fn scan_after(&self, after: Option<&RecordKey>, limit: usize) -> Result<Vec<Record>>;

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>>;

    async fn get_many(&self, keys: &[RecordKey]) -> Result<Vec<Option<Record>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    /// Apply every op or none; returns each touched key's prior value in op order
    async fn apply(&self, batch: WriteBatch) -> Result<PriorValues>;

    async fn stats(&self) -> Result<StoreStats>;
}

#[derive(Debug, Default)]
struct FaultPlan {
    unreachable: bool,
    apply_calls: u64,
    fail_after: Option<u64>,
    failures_left: u64,
    corrupt_keys: HashSet<RecordKey>,
}

/// In-memory shard store used for tests, demos and local tooling
pub struct MemoryShardStore {
    shard_id: ShardId,
    records: RwLock<BTreeMap<RecordKey, Record>>,
    faults: Mutex<FaultPlan>,
    latency: RwLock<Option<Duration>>,
    replication_lag: RwLock<Option<Duration>>,
}

impl MemoryShardStore {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            records: RwLock::new(BTreeMap::new()),
            faults: Mutex::new(FaultPlan::default()),
            latency: RwLock::new(None),
            replication_lag: RwLock::new(None),
        }
    }

    /// Insert records directly, bypassing fault injection
    pub fn seed(&self, records: impl IntoIterator<Item = Record>) {
        let mut map = self.records.write();
        for record in records {
            map.insert(record.key.clone(), record);
        }
    }

    pub fn snapshot(&self) -> Vec<Record> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.read().contains_key(key)
    }

    /// After `ok_calls` successful applies, fail the next `failures` applies
    pub fn fail_applies(&self, ok_calls: u64, failures: u64) {
        let mut faults = self.faults.lock();
        faults.fail_after = Some(faults.apply_calls + ok_calls);
        faults.failures_left = failures;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.faults.lock().unreachable = unreachable;
    }

    /// Writes to these keys land with an altered payload
    pub fn corrupt_on_write(&self, keys: impl IntoIterator<Item = RecordKey>) {
        self.faults.lock().corrupt_keys.extend(keys);
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    pub fn set_replication_lag(&self, lag: Option<Duration>) {
        *self.replication_lag.write() = lag;
    }

    fn check_reachable(&self) -> Result<()> {
        if self.faults.lock().unreachable {
            return Err(Error::Connectivity(format!("{} is unreachable", self.shard_id)));
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ShardStore for MemoryShardStore {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    async fn ping(&self) -> Result<()> {
        self.simulate_latency().await;
        self.check_reachable()
    }

    async fn count(&self) -> Result<u64> {
        self.check_reachable()?;
        Ok(self.records.read().len() as u64)
    }

    async fn scan_after(&self, after: Option<&RecordKey>, limit: usize) -> Result<Vec<Record>> {
        self.simulate_latency().await;
        self.check_reachable()?;
        let map = self.records.read();
        let lower = match after {
            Some(key) => Bound::Excluded(key.clone()),
            None => Bound::Unbounded,
        };
        Ok(map
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        self.check_reachable()?;
        Ok(self.records.read().get(key).cloned())
    }

    async fn apply(&self, batch: WriteBatch) -> Result<PriorValues> {
        self.simulate_latency().await;
        let corrupt_keys = {
            let mut faults = self.faults.lock();
            if faults.unreachable {
                return Err(Error::Connectivity(format!("{} is unreachable", self.shard_id)));
            }
            faults.apply_calls += 1;
            if let Some(after) = faults.fail_after {
                if faults.apply_calls > after && faults.failures_left > 0 {
                    faults.failures_left -= 1;
                    return Err(Error::Connectivity(format!(
                        "{} rejected write batch",
                        self.shard_id
                    )));
                }
            }
            faults.corrupt_keys.clone()
        };

        for op in &batch.ops {
            op.key().encode()?;
        }

        let mut map = self.records.write();
        let mut priors = Vec::with_capacity(batch.len());
        for op in batch.ops {
            match op {
                WriteOp::Put(mut record) => {
                    if corrupt_keys.contains(&record.key) {
                        record
                            .fields
                            .insert("__corrupted".to_string(), serde_json::Value::Bool(true));
                    }
                    let key = record.key.clone();
                    let prior = map.insert(key.clone(), record);
                    priors.push((key, prior));
                }
                WriteOp::Delete(key) => {
                    let prior = map.remove(&key);
                    priors.push((key, prior));
                }
            }
        }
        Ok(priors)
    }

    async fn stats(&self) -> Result<StoreStats> {
        self.check_reachable()?;
        let map = self.records.read();
        let size_bytes = map
            .values()
            .map(|r| r.to_bytes().map(|b| b.len() as u64).unwrap_or(0))
            .sum();
        Ok(StoreStats {
            record_count: map.len() as u64,
            size_bytes,
            replication_lag: *self.replication_lag.read(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: u64) -> Record {
        Record::new(RecordKey::new("orders", id)).with_field("total", json!(id * 10))
    }

    #[tokio::test]
    async fn test_scan_after_is_ordered_and_exclusive() {
        let store = MemoryShardStore::new(ShardId(0));
        store.seed((1..=10).rev().map(record));

        let first = store.scan_after(None, 4).await.unwrap();
        assert_eq!(first.iter().map(|r| r.key.id).collect::<Vec<_>>(), vec![1, 2, 3, 4]);

        let next = store.scan_after(Some(&first[3].key), 4).await.unwrap();
        assert_eq!(next.iter().map(|r| r.key.id).collect::<Vec<_>>(), vec![5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn test_apply_returns_priors() {
        let store = MemoryShardStore::new(ShardId(1));
        store.seed(vec![record(1)]);
        let batch = WriteBatch::new()
            .put(record(1).with_version(2))
            .put(record(2))
            .delete(RecordKey::new("orders", 1));
        let priors = store.apply(batch).await.unwrap();
        assert_eq!(priors.len(), 3);
        assert_eq!(priors[0].1.as_ref().map(|r| r.version), Some(1));
        assert!(priors[1].1.is_none());
        assert_eq!(priors[2].1.as_ref().map(|r| r.version), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_fault_injection_window() {
        let store = MemoryShardStore::new(ShardId(2));
        store.fail_applies(1, 2);
        assert!(store.apply(WriteBatch::upserts(vec![record(1)])).await.is_ok());
        let err = store.apply(WriteBatch::upserts(vec![record(2)])).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(store.apply(WriteBatch::upserts(vec![record(2)])).await.is_err());
        assert!(store.apply(WriteBatch::upserts(vec![record(2)])).await.is_ok());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = MemoryShardStore::new(ShardId(3));
        store.set_unreachable(true);
        assert!(matches!(store.ping().await, Err(Error::Connectivity(_))));
        store.set_unreachable(false);
        assert!(store.ping().await.is_ok());
    }
}
