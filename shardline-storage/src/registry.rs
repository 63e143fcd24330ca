// Registry of migrations by id, enforcing one live migration per shard pair

use crate::migration::{MigrationProgress, ShardMigration};
use dashmap::DashMap;
use parking_lot::Mutex;
use shardline_core::{Error, MigrationId, Result, ShardId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

struct RegistryEntry {
    migration: Arc<ShardMigration>,
    finished_at: Option<Instant>,
}

/// Unordered pair key: a->b and b->a contend for the same slot
fn pair_key(a: ShardId, b: ShardId) -> (ShardId, ShardId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct MigrationRegistry {
    migrations: DashMap<MigrationId, RegistryEntry>,
    active_pairs: Mutex<HashMap<(ShardId, ShardId), MigrationId>>,
    ttl: Duration,
}

impl MigrationRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            migrations: DashMap::new(),
            active_pairs: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Register a migration, failing with `Conflict` if its pair is busy
    pub fn register(&self, migration: Arc<ShardMigration>) -> Result<()> {
        let config = migration.config();
        let key = pair_key(config.source, config.target);
        let mut active = self.active_pairs.lock();

        if let Some(existing) = active.get(&key) {
            let still_live = self
                .migrations
                .get(existing)
                .map(|entry| !entry.migration.state().is_terminal())
                .unwrap_or(false);
            if still_live {
                return Err(Error::Conflict(format!(
                    "migration {} is already active between {} and {}",
                    existing, key.0, key.1
                )));
            }
        }

        let id = migration.id().clone();
        active.insert(key, id.clone());
        self.migrations.insert(
            id.clone(),
            RegistryEntry {
                migration,
                finished_at: None,
            },
        );
        debug!("Registered migration {}", id);
        Ok(())
    }

    /// Free the pair slot once a migration is terminal
    pub fn release(&self, id: &MigrationId) {
        let Some(mut entry) = self.migrations.get_mut(id) else {
            return;
        };
        let config = entry.migration.config();
        let key = pair_key(config.source, config.target);
        entry.finished_at.get_or_insert_with(Instant::now);
        drop(entry);

        let mut active = self.active_pairs.lock();
        if active.get(&key) == Some(id) {
            active.remove(&key);
        }
    }

    /// Drop a migration that never got to run
    pub fn remove(&self, id: &MigrationId) -> Option<Arc<ShardMigration>> {
        let (_, entry) = self.migrations.remove(id)?;
        let config = entry.migration.config();
        let key = pair_key(config.source, config.target);
        let mut active = self.active_pairs.lock();
        if active.get(&key) == Some(id) {
            active.remove(&key);
        }
        Some(entry.migration)
    }

    pub fn get(&self, id: &MigrationId) -> Option<Arc<ShardMigration>> {
        self.migrations.get(id).map(|entry| entry.migration.clone())
    }

    pub fn active_for(&self, a: ShardId, b: ShardId) -> Option<MigrationId> {
        self.active_pairs.lock().get(&pair_key(a, b)).cloned()
    }

    pub fn list(&self) -> Vec<MigrationProgress> {
        let mut out: Vec<MigrationProgress> = self
            .migrations
            .iter()
            .map(|entry| entry.migration.progress())
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.migrations
            .iter()
            .filter(|entry| !entry.migration.state().is_terminal())
            .count()
    }

    /// Remove terminal migrations released more than the TTL ago
    pub fn evict_expired(&self) -> usize {
        let ttl = self.ttl;
        let before = self.migrations.len();
        self.migrations.retain(|_, entry| match entry.finished_at {
            Some(finished) => finished.elapsed() < ttl || !entry.migration.state().is_terminal(),
            None => true,
        });
        let evicted = before.saturating_sub(self.migrations.len());
        if evicted > 0 {
            info!("Evicted {} finished migrations from the registry", evicted);
        }
        evicted
    }
}
