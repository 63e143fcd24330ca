// Dual-write window: application writes land on both shards while a
// migration copies data. The leader shard is written first and is
// authoritative; the follower receives exactly what the leader committed.

use crate::journal::UndoJournal;
use crate::record::WriteBatch;
use crate::sharding::ShardHandle;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardline_core::{Error, Result, ShardId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DualWriteStats {
    pub writes: u64,
    pub leader_rejections: u64,
    pub follower_errors: u64,
}

/// Result of a mirrored write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DualWriteOutcome {
    pub follower_applied: bool,
}

pub struct DualWriteCoordinator {
    leader: Arc<ShardHandle>,
    follower: Arc<ShardHandle>,
    /// Shard whose prior values go into the undo journal
    target: ShardId,
    gate: Arc<Mutex<()>>,
    journal: Arc<UndoJournal>,
    active: AtomicBool,
    stats: RwLock<DualWriteStats>,
}

impl DualWriteCoordinator {
    pub fn new(
        leader: Arc<ShardHandle>,
        follower: Arc<ShardHandle>,
        target: ShardId,
        gate: Arc<Mutex<()>>,
        journal: Arc<UndoJournal>,
    ) -> Self {
        Self {
            leader,
            follower,
            target,
            gate,
            journal,
            active: AtomicBool::new(false),
            stats: RwLock::new(DualWriteStats::default()),
        }
    }

    pub fn leader(&self) -> ShardId {
        self.leader.id()
    }

    pub fn follower(&self) -> ShardId {
        self.follower.id()
    }

    pub fn activate(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            info!(
                "Dual-write active: leader {} -> follower {}",
                self.leader.id(),
                self.follower.id()
            );
        }
    }

    pub fn deactivate(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            info!(
                "Dual-write closed: leader {} / follower {}",
                self.leader.id(),
                self.follower.id()
            );
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> DualWriteStats {
        self.stats.read().clone()
    }

    /// Apply `batch` to the leader, then mirror it to the follower.
    /// A leader failure is returned and the follower is never touched.
    /// A follower failure is counted and reported in the outcome; verification
    /// catches the divergence before cutover.
    pub async fn write(&self, batch: WriteBatch) -> Result<DualWriteOutcome> {
        if batch.is_empty() {
            return Ok(DualWriteOutcome { follower_applied: true });
        }

        let _gate = self.gate.lock().await;
        if !self.is_active() {
            return Err(Error::InvalidState(
                "dual-write window is not open".to_string(),
            ));
        }

        let leader_priors = match self.write_to(&self.leader, batch.clone()).await {
            Ok(priors) => priors,
            Err(e) => {
                self.stats.write().leader_rejections += 1;
                warn!("Leader {} rejected dual write: {}", self.leader.id(), e);
                return Err(e);
            }
        };
        if self.leader.id() == self.target {
            self.journal.record(leader_priors);
        }

        let follower_applied = match self.write_to(&self.follower, batch).await {
            Ok(priors) => {
                if self.follower.id() == self.target {
                    self.journal.record(priors);
                }
                true
            }
            Err(e) => {
                self.stats.write().follower_errors += 1;
                warn!(
                    "Follower {} missed a dual write, divergence left for verification: {}",
                    self.follower.id(),
                    e
                );
                false
            }
        };

        self.stats.write().writes += 1;
        debug!("Dual write committed (follower applied: {})", follower_applied);
        Ok(DualWriteOutcome { follower_applied })
    }

    async fn write_to(
        &self,
        shard: &ShardHandle,
        batch: WriteBatch,
    ) -> Result<crate::record::PriorValues> {
        let conn = shard.acquire().await?;
        conn.apply(batch).await
    }
}
