// Durable migration checkpoints so a restart can tell which migrations were
// interrupted and where their copy cursor stood. Cutover redirects live in a
// second tree of the same database.

use crate::migration::{MigrationProgress, MigrationState};
use crate::sharding::RouteSink;
use chrono::Utc;
use shardline_core::{Error, FailureClass, MigrationId, Result, ShardId};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const CHECKPOINT_TREE: &str = "migrations";
const ROUTE_TREE: &str = "routes";

/// Receives migration progress whenever it changes
pub trait CheckpointSink: Send + Sync {
    fn save(&self, progress: &MigrationProgress) -> Result<()>;
}

/// Sled tree of bincode-encoded checkpoints keyed by migration id
pub struct MigrationStore {
    tree: sled::Tree,
    routes: sled::Tree,
    _db: sled::Db,
}

impl MigrationStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())
            .map_err(|e| Error::Storage(format!("Sled error: {}", e)))?;
        Self::from_db(db)
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| Error::Storage(format!("Sled error: {}", e)))?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        let tree = db
            .open_tree(CHECKPOINT_TREE)
            .map_err(|e| Error::Storage(format!("Sled open tree error: {}", e)))?;
        let routes = db
            .open_tree(ROUTE_TREE)
            .map_err(|e| Error::Storage(format!("Sled open tree error: {}", e)))?;
        Ok(Self {
            tree,
            routes,
            _db: db,
        })
    }

    /// Redirects installed by completed cutovers, home shard to serving shard
    pub fn load_routes(&self) -> Result<HashMap<ShardId, ShardId>> {
        let mut out = HashMap::new();
        for item in self.routes.iter() {
            let (key, value) = item.map_err(|e| Error::Storage(format!("Sled scan error: {}", e)))?;
            match (decode_shard(&key), decode_shard(&value)) {
                (Some(from), Some(to)) => {
                    out.insert(from, to);
                }
                _ => warn!("Skipping malformed route entry"),
            }
        }
        Ok(out)
    }

    pub fn load(&self, id: &MigrationId) -> Result<Option<MigrationProgress>> {
        match self.tree.get(id.as_str().as_bytes()) {
            Ok(Some(bytes)) => Ok(Some(Self::decode(&bytes)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(Error::Storage(format!("Sled get error: {}", e))),
        }
    }

    pub fn list(&self) -> Result<Vec<MigrationProgress>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_, bytes) = item.map_err(|e| Error::Storage(format!("Sled scan error: {}", e)))?;
            match Self::decode(&bytes) {
                Ok(progress) => out.push(progress),
                Err(e) => warn!("Skipping unreadable checkpoint: {}", e),
            }
        }
        Ok(out)
    }

    pub fn remove(&self, id: &MigrationId) -> Result<bool> {
        self.tree
            .remove(id.as_str().as_bytes())
            .map(|prior| prior.is_some())
            .map_err(|e| Error::Storage(format!("Sled remove error: {}", e)))
    }

    /// Drop terminal checkpoints last updated more than `ttl` ago
    pub fn evict_terminal(&self, ttl: Duration) -> Result<usize> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::Validation(format!("ttl out of range: {}", e)))?;
        let cutoff = Utc::now() - ttl;
        let mut evicted = 0;
        for progress in self.list()? {
            if progress.state.is_terminal() && progress.updated_at <= cutoff {
                if self.remove(&progress.id)? {
                    evicted += 1;
                }
            }
        }
        Ok(evicted)
    }

    /// Mark checkpoints left non-terminal by a previous process as failed.
    /// Their cursors are kept so an operator can resume from them.
    pub fn recover_interrupted(&self) -> Result<Vec<MigrationProgress>> {
        self.recover_interrupted_where(|_| true)
    }

    /// As `recover_interrupted`, limited to ids accepted by `filter`
    pub fn recover_interrupted_where<F>(&self, filter: F) -> Result<Vec<MigrationProgress>>
    where
        F: Fn(&MigrationId) -> bool,
    {
        let mut recovered = Vec::new();
        for mut progress in self.list()? {
            if progress.state.is_terminal() || !filter(&progress.id) {
                continue;
            }
            warn!(
                "Migration {} was interrupted while {}; marking failed",
                progress.id, progress.state
            );
            progress.state = MigrationState::Failed;
            progress.failure = Some(FailureClass::Interrupted);
            progress.message = Some("process stopped before the migration finished".to_string());
            progress.estimated_remaining_secs = None;
            progress.updated_at = Utc::now();
            self.save(&progress)?;
            recovered.push(progress);
        }
        if !recovered.is_empty() {
            info!("Recovered {} interrupted migrations", recovered.len());
        }
        Ok(recovered)
    }

    pub fn flush(&self) -> Result<()> {
        self.tree
            .flush()
            .map_err(|e| Error::Storage(format!("Sled flush error: {}", e)))?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<MigrationProgress> {
        bincode::deserialize(bytes)
            .map_err(|e| Error::Serialization(format!("checkpoint decode error: {}", e)))
    }
}

fn decode_shard(bytes: &[u8]) -> Option<ShardId> {
    let raw: [u8; 4] = bytes.try_into().ok()?;
    Some(ShardId(u32::from_be_bytes(raw)))
}

impl RouteSink for MigrationStore {
    /// Replace the stored route table in one batch and flush it
    fn save_routes(&self, routes: &HashMap<ShardId, ShardId>) -> Result<()> {
        let mut batch = sled::Batch::default();
        for item in self.routes.iter() {
            let (key, _) = item.map_err(|e| Error::Storage(format!("Sled scan error: {}", e)))?;
            batch.remove(key);
        }
        for (from, to) in routes {
            batch.insert(from.0.to_be_bytes().to_vec(), to.0.to_be_bytes().to_vec());
        }
        self.routes
            .apply_batch(batch)
            .map_err(|e| Error::Storage(format!("Sled batch error: {}", e)))?;
        self.routes
            .flush()
            .map_err(|e| Error::Storage(format!("Sled flush error: {}", e)))?;
        Ok(())
    }
}

impl CheckpointSink for MigrationStore {
    fn save(&self, progress: &MigrationProgress) -> Result<()> {
        let bytes = bincode::serialize(progress)
            .map_err(|e| Error::Serialization(format!("checkpoint encode error: {}", e)))?;
        self.tree
            .insert(progress.id.as_str().as_bytes(), bytes)
            .map_err(|e| Error::Storage(format!("Sled insert error: {}", e)))?;
        Ok(())
    }
}
