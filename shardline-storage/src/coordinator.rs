// Migration orchestrator: validates requests, hands migrations to a bounded
// worker pool and answers progress queries

use crate::checkpoint::{CheckpointSink, MigrationStore};
use crate::dual_write::DualWriteCoordinator;
use crate::migration::{MigrationConfig, MigrationProgress, MigrationState, ShardMigration};
use crate::registry::MigrationRegistry;
use crate::sharding::{CutoverHandler, ShardRouter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shardline_core::config::MigrationDefaults;
use shardline_core::{Error, MigrationId, Result, ShardId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Start request; unset options fall back to configured defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    pub source: ShardId,
    pub target: ShardId,
    pub batch_size: Option<usize>,
    pub verify_all: Option<bool>,
    pub rollback_on_error: Option<bool>,
    pub dual_write_leader: Option<ShardId>,
    pub sample_size: Option<usize>,
    pub timeout: Option<Duration>,
}

impl MigrationRequest {
    pub fn new(source: ShardId, target: ShardId) -> Self {
        Self {
            source,
            target,
            batch_size: None,
            verify_all: None,
            rollback_on_error: None,
            dual_write_leader: None,
            sample_size: None,
            timeout: None,
        }
    }

    fn into_config(self, defaults: &MigrationDefaults) -> MigrationConfig {
        let mut config = MigrationConfig::from_defaults(self.source, self.target, defaults);
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(verify_all) = self.verify_all {
            config.verify_all = verify_all;
        }
        if let Some(rollback) = self.rollback_on_error {
            config.rollback_on_error = rollback;
        }
        if let Some(leader) = self.dual_write_leader {
            config.dual_write_leader = leader;
        }
        if let Some(sample_size) = self.sample_size {
            config.sample_size = sample_size;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = timeout;
        }
        config
    }
}

pub struct MigrationCoordinator {
    router: Arc<ShardRouter>,
    registry: Arc<MigrationRegistry>,
    store: Option<Arc<MigrationStore>>,
    defaults: MigrationDefaults,
    queue: mpsc::UnboundedSender<Arc<ShardMigration>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MigrationCoordinator {
    /// Spawn the worker pool and the registry janitor. Needs a tokio runtime.
    pub fn start(
        router: Arc<ShardRouter>,
        defaults: MigrationDefaults,
        store: Option<Arc<MigrationStore>>,
    ) -> Arc<Self> {
        let registry = Arc::new(MigrationRegistry::new(defaults.registry_ttl()));
        let (queue, rx) = mpsc::unbounded_channel::<Arc<ShardMigration>>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = defaults.max_concurrent_migrations.max(1);
        let mut tasks = Vec::with_capacity(workers + 1);

        for worker in 0..workers {
            let rx = rx.clone();
            let registry = registry.clone();
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(migration) = next else {
                        break;
                    };
                    let id = migration.id().clone();
                    debug!("Worker {} picked up {}", worker, id);
                    let runner = migration.clone();
                    if let Err(e) = tokio::spawn(async move { runner.run().await }).await {
                        error!("Migration {} driver task died: {}", id, e);
                        migration.abandon(&format!("driver task died: {}", e));
                    }
                    registry.release(&id);
                    if let Some(store) = &store {
                        if let Err(e) = store.flush() {
                            warn!("Failed to flush checkpoints for {}: {}", id, e);
                        }
                    }
                }
            }));
        }

        let ttl = defaults.registry_ttl();
        let janitor_registry = registry.clone();
        let janitor_store = store.clone();
        tasks.push(tokio::spawn(async move {
            let period = (ttl / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                janitor_registry.evict_expired();
                if let Some(store) = &janitor_store {
                    if let Err(e) = store.evict_terminal(ttl) {
                        warn!("Checkpoint eviction failed: {}", e);
                    }
                }
            }
        }));

        info!("Migration coordinator started with {} workers", workers);
        Arc::new(Self {
            router,
            registry,
            store,
            defaults,
            queue,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn registry(&self) -> &Arc<MigrationRegistry> {
        &self.registry
    }

    pub fn defaults(&self) -> &MigrationDefaults {
        &self.defaults
    }

    /// Validate and enqueue a migration; returns its id without waiting for it
    pub fn start_migration(&self, request: MigrationRequest) -> Result<MigrationId> {
        if request.source == request.target {
            return Err(Error::Validation(format!(
                "source and target are both {}",
                request.source
            )));
        }
        let source = self
            .router
            .get(request.source)
            .map_err(|_| Error::Validation(format!("unknown source shard {}", request.source)))?;
        let target = self
            .router
            .get(request.target)
            .map_err(|_| Error::Validation(format!("unknown target shard {}", request.target)))?;

        let config = request.into_config(&self.defaults);
        config.validate()?;
        if let Some(active) = self.registry.active_for(config.source, config.target) {
            if self
                .registry
                .get(&active)
                .map(|m| !m.state().is_terminal())
                .unwrap_or(false)
            {
                return Err(Error::Conflict(format!(
                    "migration {} is already active between {} and {}",
                    active, config.source, config.target
                )));
            }
        }

        let id = MigrationId::generate(config.source, config.target);
        let cutover: Arc<dyn CutoverHandler> = self.router.clone();
        let mut migration = ShardMigration::new(id.clone(), config, source, target, cutover)?;
        if let Some(store) = &self.store {
            let sink: Arc<dyn CheckpointSink> = store.clone();
            migration = migration.with_checkpoints(sink);
        }
        let migration = Arc::new(migration);

        self.registry.register(migration.clone())?;
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&migration.progress()) {
                warn!("Failed to persist initial checkpoint for {}: {}", id, e);
            }
        }

        if self.queue.send(migration).is_err() {
            self.registry.remove(&id);
            return Err(Error::InvalidState(
                "migration coordinator is shut down".to_string(),
            ));
        }
        info!("Queued migration {}", id);
        Ok(id)
    }

    pub fn get(&self, id: &MigrationId) -> Result<Arc<ShardMigration>> {
        self.registry
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("migration {}", id)))
    }

    /// Live progress, falling back to the persisted checkpoint
    pub fn progress(&self, id: &MigrationId) -> Result<MigrationProgress> {
        if let Some(migration) = self.registry.get(id) {
            return Ok(migration.progress());
        }
        if let Some(store) = &self.store {
            if let Some(progress) = store.load(id)? {
                return Ok(progress);
            }
        }
        Err(Error::NotFound(format!("migration {}", id)))
    }

    pub fn state(&self, id: &MigrationId) -> Result<MigrationState> {
        self.progress(id).map(|p| p.state)
    }

    pub fn cancel(&self, id: &MigrationId) -> Result<()> {
        match self.registry.get(id) {
            Some(migration) => migration.cancel(),
            None => match self.progress(id) {
                Ok(progress) => Err(Error::InvalidState(format!(
                    "migration {} already finished as {}",
                    id, progress.state
                ))),
                Err(e) => Err(e),
            },
        }
    }

    /// Writer for application traffic while `id` is in its dual-write window
    pub fn dual_writer(&self, id: &MigrationId) -> Result<Arc<DualWriteCoordinator>> {
        Ok(self.get(id)?.dual_writer())
    }

    pub async fn wait(&self, id: &MigrationId) -> Result<MigrationProgress> {
        let migration = self.get(id)?;
        migration.wait().await;
        Ok(migration.progress())
    }

    /// Every known migration: live ones first, then persisted-only ones
    pub fn list(&self) -> Result<Vec<MigrationProgress>> {
        let mut out = self.registry.list();
        if let Some(store) = &self.store {
            for progress in store.list()? {
                if self.registry.get(&progress.id).is_none() {
                    out.push(progress);
                }
            }
        }
        Ok(out)
    }

    /// Mark migrations a previous process left unfinished as failed.
    /// Migrations owned by this coordinator are left alone.
    pub fn recover_interrupted(&self) -> Result<Vec<MigrationProgress>> {
        match &self.store {
            Some(store) => store.recover_interrupted_where(|id| self.registry.get(id).is_none()),
            None => Ok(Vec::new()),
        }
    }

    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Migration coordinator stopped");
    }
}
