// Sled-backed shard store

use crate::record::{PriorValues, Record, RecordKey, WriteBatch, WriteOp};
use crate::store::{ShardStore, StoreStats};
use async_trait::async_trait;
use shardline_core::{Error, Result, ShardId};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use std::ops::Bound;
use std::path::Path;

const RECORDS_TREE: &str = "records";

/// Shard store persisted in a sled database directory
pub struct SledShardStore {
    shard_id: ShardId,
    db: sled::Db,
    tree: sled::Tree,
}

impl SledShardStore {
    pub fn open(shard_id: ShardId, path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| Error::Storage(format!("Sled error: {}", e)))?;
        Self::from_db(shard_id, db)
    }

    /// Store that lives only as long as the process
    pub fn temporary(shard_id: ShardId) -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| Error::Storage(format!("Sled error: {}", e)))?;
        Self::from_db(shard_id, db)
    }

    fn from_db(shard_id: ShardId, db: sled::Db) -> Result<Self> {
        let tree = db
            .open_tree(RECORDS_TREE)
            .map_err(|e| Error::Storage(format!("Sled open tree error: {}", e)))?;
        Ok(Self { shard_id, db, tree })
    }

    pub async fn flush(&self) -> Result<()> {
        self.tree
            .flush_async()
            .await
            .map_err(|e| Error::Storage(format!("Sled flush error: {}", e)))?;
        Ok(())
    }

    fn decode_value(bytes: &[u8]) -> Result<Record> {
        Record::from_bytes(bytes)
    }
}

#[async_trait]
impl ShardStore for SledShardStore {
    fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    async fn ping(&self) -> Result<()> {
        self.tree
            .first()
            .map_err(|e| Error::Connectivity(format!("Sled read error: {}", e)))?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.tree.len() as u64)
    }

    async fn scan_after(&self, after: Option<&RecordKey>, limit: usize) -> Result<Vec<Record>> {
        let lower = match after {
            Some(key) => Bound::Excluded(key.encode()?),
            None => Bound::Unbounded,
        };
        let mut out = Vec::with_capacity(limit.min(4096));
        for item in self.tree.range::<Vec<u8>, _>((lower, Bound::Unbounded)).take(limit) {
            let (_, value) = item.map_err(|e| Error::Storage(format!("Sled scan error: {}", e)))?;
            out.push(Self::decode_value(&value)?);
        }
        Ok(out)
    }

    async fn get(&self, key: &RecordKey) -> Result<Option<Record>> {
        match self.tree.get(key.encode()?) {
            Ok(Some(value)) => Ok(Some(Self::decode_value(&value)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(format!("Sled get error: {}", e))),
        }
    }

    async fn apply(&self, batch: WriteBatch) -> Result<PriorValues> {
        let mut encoded = Vec::with_capacity(batch.len());
        let mut keys = Vec::with_capacity(batch.len());
        for op in &batch.ops {
            let value = match op {
                WriteOp::Put(record) => Some(record.to_bytes()?),
                WriteOp::Delete(_) => None,
            };
            encoded.push((op.key().encode()?, value));
            keys.push(op.key().clone());
        }

        let priors = self
            .tree
            .transaction(|tx| -> ConflictableTransactionResult<Vec<Option<sled::IVec>>, ()> {
                let mut priors = Vec::with_capacity(encoded.len());
                for (key, value) in &encoded {
                    let prior = match value {
                        Some(value) => tx.insert(key.as_slice(), value.as_slice())?,
                        None => tx.remove(key.as_slice())?,
                    };
                    priors.push(prior);
                }
                Ok(priors)
            })
            .map_err(|e: TransactionError<()>| {
                Error::Storage(format!("Sled transaction error: {:?}", e))
            })?;

        keys.into_iter()
            .zip(priors)
            .map(|(key, prior)| {
                let prior = prior.map(|bytes| Self::decode_value(&bytes)).transpose()?;
                Ok((key, prior))
            })
            .collect()
    }

    async fn stats(&self) -> Result<StoreStats> {
        let size_bytes = self
            .db
            .size_on_disk()
            .map_err(|e| Error::Storage(format!("Sled size error: {}", e)))?;
        Ok(StoreStats {
            record_count: self.tree.len() as u64,
            size_bytes,
            replication_lag: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sled_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledShardStore::open(ShardId(0), dir.path()).unwrap();
            let batch = WriteBatch::upserts(
                (1..=5)
                    .map(|i| Record::new(RecordKey::new("menu_items", i)).with_field("price", json!(i)))
                    .collect(),
            );
            store.apply(batch).await.unwrap();
            store.flush().await.unwrap();
        }

        let store = SledShardStore::open(ShardId(0), dir.path()).unwrap();
        assert_eq!(store.count().await.unwrap(), 5);
        let page = store
            .scan_after(Some(&RecordKey::new("menu_items", 2)), 10)
            .await
            .unwrap();
        assert_eq!(page.iter().map(|r| r.key.id).collect::<Vec<_>>(), vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_sled_apply_reports_priors() {
        let store = SledShardStore::temporary(ShardId(1)).unwrap();
        let key = RecordKey::new("orders", 9);
        store
            .apply(WriteBatch::new().put(Record::new(key.clone())))
            .await
            .unwrap();
        let priors = store
            .apply(WriteBatch::new().delete(key.clone()))
            .await
            .unwrap();
        assert_eq!(priors.len(), 1);
        assert_eq!(priors[0].1.as_ref().map(|r| r.key.clone()), Some(key.clone()));
        assert!(store.get(&key).await.unwrap().is_none());
    }
}
