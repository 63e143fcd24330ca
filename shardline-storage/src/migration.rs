// Live shard migration: copy a shard's records to another shard in key order
// while dual-write keeps both sides current, verify, then cut routing over.
//
// pending -> initializing -> dual_write_setup -> copying -> verifying -> cutover -> completed
// cancelling -> cancelled, rolling_back -> rolled_back, failed from any live state

use crate::checkpoint::CheckpointSink;
use crate::dual_write::DualWriteCoordinator;
use crate::journal::UndoJournal;
use crate::record::{PriorValues, Record, RecordKey, WriteBatch};
use crate::retry::RetryPolicy;
use crate::sharding::{CutoverHandler, ShardHandle};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardline_core::config::{MigrationDefaults, MAX_MIGRATION_TIMEOUT_SECS};
use shardline_core::{Error, FailureClass, MigrationId, Result, ShardId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    Initializing,
    DualWriteSetup,
    Copying,
    Verifying,
    Cutover,
    Completed,
    Cancelling,
    Cancelled,
    RollingBack,
    RolledBack,
    Failed,
}

impl MigrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MigrationState::Completed
                | MigrationState::Cancelled
                | MigrationState::RolledBack
                | MigrationState::Failed
        )
    }

    /// Cutover is irreversible, so cancellation stops being honored there
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            MigrationState::Pending
                | MigrationState::Initializing
                | MigrationState::DualWriteSetup
                | MigrationState::Copying
                | MigrationState::Verifying
        )
    }

    pub fn can_transition_to(&self, next: MigrationState) -> bool {
        use MigrationState::*;
        match (*self, next) {
            (current, Failed) => !current.is_terminal(),
            (Pending, Initializing)
            | (Initializing, DualWriteSetup)
            | (DualWriteSetup, Copying)
            | (Copying, Verifying)
            | (Verifying, Cutover)
            | (Cutover, Completed) => true,
            (current, Cancelling) => current.is_cancellable(),
            (Cancelling, Cancelled) => true,
            (Initializing | DualWriteSetup | Copying | Verifying, RollingBack) => true,
            (RollingBack, RolledBack) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationState::Pending => "pending",
            MigrationState::Initializing => "initializing",
            MigrationState::DualWriteSetup => "dual_write_setup",
            MigrationState::Copying => "copying",
            MigrationState::Verifying => "verifying",
            MigrationState::Cutover => "cutover",
            MigrationState::Completed => "completed",
            MigrationState::Cancelling => "cancelling",
            MigrationState::Cancelled => "cancelled",
            MigrationState::RollingBack => "rolling_back",
            MigrationState::RolledBack => "rolled_back",
            MigrationState::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable settings of one migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    pub source: ShardId,
    pub target: ShardId,
    pub batch_size: usize,
    pub dual_write_leader: ShardId,
    pub verify_all: bool,
    pub rollback_on_error: bool,
    /// Records compared when `verify_all` is off
    pub sample_size: usize,
    pub retry: RetryPolicy,
    pub timeout: Duration,
}

impl MigrationConfig {
    pub fn new(source: ShardId, target: ShardId) -> Self {
        Self::from_defaults(source, target, &MigrationDefaults::default())
    }

    pub fn from_defaults(source: ShardId, target: ShardId, defaults: &MigrationDefaults) -> Self {
        Self {
            source,
            target,
            batch_size: defaults.batch_size,
            dual_write_leader: source,
            verify_all: defaults.verify_all,
            rollback_on_error: defaults.rollback_on_error,
            sample_size: defaults.sample_size,
            retry: RetryPolicy::from_defaults(defaults),
            timeout: defaults.timeout(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_verify_all(mut self, verify_all: bool) -> Self {
        self.verify_all = verify_all;
        self
    }

    pub fn with_rollback_on_error(mut self, rollback: bool) -> Self {
        self.rollback_on_error = rollback;
        self
    }

    pub fn with_dual_write_leader(mut self, leader: ShardId) -> Self {
        self.dual_write_leader = leader;
        self
    }

    pub fn with_sample_size(mut self, sample_size: usize) -> Self {
        self.sample_size = sample_size;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source == self.target {
            return Err(Error::Validation(format!(
                "source and target are both {}",
                self.source
            )));
        }
        if self.batch_size == 0 {
            return Err(Error::Validation("batch_size must be > 0".to_string()));
        }
        if self.dual_write_leader != self.source && self.dual_write_leader != self.target {
            return Err(Error::Validation(format!(
                "dual-write leader {} is neither source nor target",
                self.dual_write_leader
            )));
        }
        if !self.verify_all && self.sample_size == 0 {
            return Err(Error::Validation(
                "sample_size must be > 0 when verify_all is off".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Validation("retry.max_attempts must be > 0".to_string()));
        }
        if self.timeout.is_zero() || self.timeout > Duration::from_secs(MAX_MIGRATION_TIMEOUT_SECS) {
            return Err(Error::Validation(format!(
                "timeout must be > 0 and at most {}s",
                MAX_MIGRATION_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}

/// Point-in-time view of a migration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub id: MigrationId,
    pub source: ShardId,
    pub target: ShardId,
    pub state: MigrationState,
    pub percent_complete: f64,
    pub total_records: u64,
    pub migrated_records: u64,
    pub verified_records: u64,
    pub failed_records: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: f64,
    pub estimated_remaining_secs: Option<f64>,
    pub cursor: Option<RecordKey>,
    pub failure: Option<FailureClass>,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationProgress {
    /// Records per second over the elapsed time
    pub fn rate(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.migrated_records as f64 / self.elapsed_secs
        } else {
            0.0
        }
    }
}

struct ProgressState {
    state: MigrationState,
    total: u64,
    migrated: u64,
    verified: u64,
    failed: u64,
    started: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    frozen_elapsed: Option<Duration>,
    cursor: Option<RecordKey>,
    failure: Option<FailureClass>,
    message: Option<String>,
    updated_at: DateTime<Utc>,
}

impl ProgressState {
    fn elapsed(&self) -> Duration {
        self.frozen_elapsed
            .or_else(|| self.started.map(|s| s.elapsed()))
            .unwrap_or_default()
    }
}

pub struct ShardMigration {
    id: MigrationId,
    config: MigrationConfig,
    source: Arc<ShardHandle>,
    target: Arc<ShardHandle>,
    cutover: Arc<dyn CutoverHandler>,
    checkpoints: Option<Arc<dyn CheckpointSink>>,
    progress: RwLock<ProgressState>,
    /// Serializes copy batches, verification pages, rollback and dual writes
    gate: Arc<Mutex<()>>,
    journal: Arc<UndoJournal>,
    dual_writer: Arc<DualWriteCoordinator>,
    started: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    state_tx: watch::Sender<MigrationState>,
}

impl ShardMigration {
    pub fn new(
        id: MigrationId,
        config: MigrationConfig,
        source: Arc<ShardHandle>,
        target: Arc<ShardHandle>,
        cutover: Arc<dyn CutoverHandler>,
    ) -> Result<Self> {
        config.validate()?;
        if source.id() != config.source || target.id() != config.target {
            return Err(Error::Validation(format!(
                "handles {} -> {} do not match configured {} -> {}",
                source.id(),
                target.id(),
                config.source,
                config.target
            )));
        }

        let gate = Arc::new(Mutex::new(()));
        let journal = Arc::new(UndoJournal::new());
        let (leader, follower) = if config.dual_write_leader == config.source {
            (source.clone(), target.clone())
        } else {
            (target.clone(), source.clone())
        };
        let dual_writer = Arc::new(DualWriteCoordinator::new(
            leader,
            follower,
            config.target,
            gate.clone(),
            journal.clone(),
        ));

        let now = Utc::now();
        Ok(Self {
            id,
            config,
            source,
            target,
            cutover,
            checkpoints: None,
            progress: RwLock::new(ProgressState {
                state: MigrationState::Pending,
                total: 0,
                migrated: 0,
                verified: 0,
                failed: 0,
                started: None,
                started_at: None,
                frozen_elapsed: None,
                cursor: None,
                failure: None,
                message: None,
                updated_at: now,
            }),
            gate,
            journal,
            dual_writer,
            started: AtomicBool::new(false),
            cancel_tx: watch::channel(false).0,
            state_tx: watch::channel(MigrationState::Pending).0,
        })
    }

    pub fn with_checkpoints(mut self, sink: Arc<dyn CheckpointSink>) -> Self {
        self.checkpoints = Some(sink);
        self
    }

    /// Resume copying after `cursor`, counting `migrated` records as done.
    /// Only batches copied by this run are covered by rollback.
    pub fn with_cursor(self, cursor: RecordKey, migrated: u64) -> Self {
        {
            let mut p = self.progress.write();
            p.cursor = Some(cursor);
            p.migrated = migrated;
        }
        self
    }

    pub fn id(&self) -> &MigrationId {
        &self.id
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn state(&self) -> MigrationState {
        self.progress.read().state
    }

    /// Writer applications use during the dual-write window
    pub fn dual_writer(&self) -> Arc<DualWriteCoordinator> {
        self.dual_writer.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MigrationState> {
        self.state_tx.subscribe()
    }

    pub fn progress(&self) -> MigrationProgress {
        let p = self.progress.read();
        let elapsed = p.elapsed().as_secs_f64();
        let percent_complete = match p.state {
            MigrationState::Completed => 100.0,
            _ if p.total == 0 => 0.0,
            _ => (p.migrated as f64 / p.total as f64 * 100.0).min(100.0),
        };
        let estimated_remaining_secs = match p.state {
            MigrationState::Completed => Some(0.0),
            MigrationState::Copying if p.migrated > 0 && elapsed > 0.0 => {
                let rate = p.migrated as f64 / elapsed;
                Some(p.total.saturating_sub(p.migrated) as f64 / rate)
            }
            _ => None,
        };
        MigrationProgress {
            id: self.id.clone(),
            source: self.config.source,
            target: self.config.target,
            state: p.state,
            percent_complete,
            total_records: p.total,
            migrated_records: p.migrated,
            verified_records: p.verified,
            failed_records: p.failed,
            started_at: p.started_at,
            elapsed_secs: elapsed,
            estimated_remaining_secs,
            cursor: p.cursor.clone(),
            failure: p.failure,
            message: p.message.clone(),
            updated_at: p.updated_at,
        }
    }

    /// Request cancellation; honored at the next batch boundary
    pub fn cancel(&self) -> Result<()> {
        {
            let mut p = self.progress.write();
            if p.state == MigrationState::Cancelling {
                return Ok(());
            }
            if !p.state.can_transition_to(MigrationState::Cancelling) {
                return Err(Error::InvalidState(format!(
                    "migration {} cannot be cancelled while {}",
                    self.id, p.state
                )));
            }
            p.state = MigrationState::Cancelling;
            p.updated_at = Utc::now();
        }
        self.persist();
        self.cancel_tx.send_replace(true);
        self.state_tx.send_replace(MigrationState::Cancelling);
        info!(migration = %self.id, "Cancellation requested");
        Ok(())
    }

    /// Mark a migration whose driver died without reaching a terminal state
    pub fn abandon(&self, reason: &str) {
        if self.state().is_terminal() {
            return;
        }
        self.dual_writer.deactivate();
        self.finish(MigrationState::Failed, FailureClass::Interrupted, reason.to_string());
    }

    /// Wait until the migration reaches a terminal state
    pub async fn wait(&self) -> MigrationState {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Drive the migration to a terminal state. Later calls only wait.
    pub async fn run(&self) -> MigrationState {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.wait().await;
        }
        let outcome = match Instant::now().checked_add(self.config.timeout) {
            Some(deadline) => self.execute(deadline).await,
            None => Err(Error::Validation(format!(
                "timeout {:?} is out of range",
                self.config.timeout
            ))),
        };
        if let Err(e) = outcome {
            self.handle_failure(e).await;
        }
        let state = self.state();
        info!(migration = %self.id, "Migration finished: {}", state);
        state
    }

    async fn execute(&self, deadline: Instant) -> Result<()> {
        self.check_interrupts(deadline)?;
        self.transition(MigrationState::Initializing)?;
        self.initialize().await?;

        self.check_interrupts(deadline)?;
        self.transition(MigrationState::DualWriteSetup)?;
        self.dual_writer.activate();

        self.check_interrupts(deadline)?;
        self.transition(MigrationState::Copying)?;
        self.copy_all(deadline).await?;

        self.check_interrupts(deadline)?;
        self.transition(MigrationState::Verifying)?;
        self.verify(deadline).await?;

        self.check_interrupts(deadline)?;
        self.transition(MigrationState::Cutover)?;
        self.cutover
            .switch_route(self.config.source, self.config.target)
            .await
            .map_err(|e| match e {
                Error::Cutover(_) => e,
                other => Error::Cutover(other.to_string()),
            })?;
        self.dual_writer.deactivate();
        self.transition(MigrationState::Completed)
    }

    async fn initialize(&self) -> Result<()> {
        let retry = &self.config.retry;
        retry.run("ping source", || self.ping(&self.source)).await?;
        retry.run("ping target", || self.ping(&self.target)).await?;
        let total = retry.run("count source", || self.count(&self.source)).await?;
        {
            let mut p = self.progress.write();
            p.total = total.max(p.migrated);
            p.updated_at = Utc::now();
        }
        info!(
            migration = %self.id,
            "Migrating {} records from {} to {} in batches of {}",
            total, self.config.source, self.config.target, self.config.batch_size
        );
        Ok(())
    }

    async fn copy_all(&self, deadline: Instant) -> Result<()> {
        loop {
            self.check_interrupts(deadline)?;
            if self.copy_batch().await? == 0 {
                break;
            }
        }
        let mut p = self.progress.write();
        p.total = p.total.max(p.migrated);
        Ok(())
    }

    /// Copy the next batch after the cursor. The cursor only advances once the
    /// target has committed the batch.
    async fn copy_batch(&self) -> Result<usize> {
        let cursor = self.progress.read().cursor.clone();
        let batch_size = self.config.batch_size;
        let retry = &self.config.retry;

        let _gate = self.gate.lock().await;
        let records = retry
            .run("scan source batch", || self.scan(&self.source, cursor.as_ref(), batch_size))
            .await?;
        let Some(last_key) = records.last().map(|r| r.key.clone()) else {
            return Ok(0);
        };
        let count = records.len();
        let batch = WriteBatch::upserts(records);

        match retry
            .run("write target batch", || self.apply(&self.target, batch.clone()))
            .await
        {
            Ok(priors) => {
                self.journal.record(priors);
                {
                    let mut p = self.progress.write();
                    p.migrated += count as u64;
                    p.cursor = Some(last_key);
                    p.updated_at = Utc::now();
                }
                self.persist();
                debug!(migration = %self.id, "Copied batch of {}", count);
                Ok(count)
            }
            Err(e) => {
                self.progress.write().failed += count as u64;
                Err(e)
            }
        }
    }

    async fn verify(&self, deadline: Instant) -> Result<()> {
        let (checked, mismatched) = if self.config.verify_all {
            self.verify_all(deadline).await?
        } else {
            self.verify_sample(deadline).await?
        };

        if mismatched > 0 {
            self.progress.write().failed += mismatched;
            return Err(Error::VerificationMismatch { mismatched, checked });
        }
        info!(migration = %self.id, "Verified {} records", checked);
        Ok(())
    }

    async fn verify_all(&self, deadline: Instant) -> Result<(u64, u64)> {
        let retry = &self.config.retry;
        let batch_size = self.config.batch_size;
        let mut cursor: Option<RecordKey> = None;
        let (mut checked, mut mismatched) = (0u64, 0u64);

        loop {
            self.check_interrupts(deadline)?;
            let _gate = self.gate.lock().await;
            let page = retry
                .run("scan source for verification", || {
                    self.scan(&self.source, cursor.as_ref(), batch_size)
                })
                .await?;
            let Some(last_key) = page.last().map(|r| r.key.clone()) else {
                break;
            };
            let (ok, bad) = self.compare(&page).await?;
            checked += page.len() as u64;
            mismatched += bad;
            self.progress.write().verified += ok;
            cursor = Some(last_key);
        }
        Ok((checked, mismatched))
    }

    async fn verify_sample(&self, deadline: Instant) -> Result<(u64, u64)> {
        let retry = &self.config.retry;
        let batch_size = self.config.batch_size;
        let total = retry.run("count source", || self.count(&self.source)).await? as usize;
        if total == 0 {
            return Ok((0, 0));
        }

        let wanted = self.config.sample_size.min(total);
        let mut positions = {
            let mut rng = rand::thread_rng();
            rand::seq::index::sample(&mut rng, total, wanted).into_vec()
        };
        positions.sort_unstable();
        let mut positions = positions.into_iter().peekable();

        let mut cursor: Option<RecordKey> = None;
        let mut offset = 0usize;
        let (mut checked, mut mismatched) = (0u64, 0u64);

        while positions.peek().is_some() {
            self.check_interrupts(deadline)?;
            let _gate = self.gate.lock().await;
            let page = retry
                .run("scan source for verification", || {
                    self.scan(&self.source, cursor.as_ref(), batch_size)
                })
                .await?;
            let Some(last_key) = page.last().map(|r| r.key.clone()) else {
                break;
            };

            let end = offset + page.len();
            let mut sampled = Vec::new();
            while let Some(&pos) = positions.peek() {
                if pos >= end {
                    break;
                }
                sampled.push(page[pos - offset].clone());
                positions.next();
            }

            if !sampled.is_empty() {
                let (ok, bad) = self.compare(&sampled).await?;
                checked += sampled.len() as u64;
                mismatched += bad;
                self.progress.write().verified += ok;
            }
            offset = end;
            cursor = Some(last_key);
        }
        Ok((checked, mismatched))
    }

    /// Compare source records with the target's copies by checksum
    async fn compare(&self, records: &[Record]) -> Result<(u64, u64)> {
        let keys: Vec<RecordKey> = records.iter().map(|r| r.key.clone()).collect();
        let copies = self
            .config
            .retry
            .run("read target for verification", || self.get_many(&self.target, &keys))
            .await?;

        let (mut ok, mut bad) = (0u64, 0u64);
        for (record, copy) in records.iter().zip(copies) {
            let matches = match copy {
                Some(copy) => copy.checksum()? == record.checksum()?,
                None => false,
            };
            if matches {
                ok += 1;
            } else {
                bad += 1;
                debug!(migration = %self.id, "Verification mismatch at {}", record.key);
            }
        }
        Ok((ok, bad))
    }

    async fn handle_failure(&self, err: Error) {
        let current = self.state();
        self.dual_writer.deactivate();

        if current == MigrationState::Cancelling || matches!(err, Error::Cancelled(_)) {
            self.finish(
                MigrationState::Cancelled,
                FailureClass::Cancelled,
                "cancelled by operator".to_string(),
            );
            return;
        }

        let class = err.failure_class();
        error!(migration = %self.id, "Migration failed while {}: {}", current, err);

        let rollback_applies = self.config.rollback_on_error
            && !matches!(
                err,
                Error::VerificationMismatch { .. }
                    | Error::Cutover(_)
                    | Error::Validation(_)
                    | Error::InvalidState(_)
            )
            && current.can_transition_to(MigrationState::RollingBack);

        if !rollback_applies {
            self.finish(MigrationState::Failed, class, err.to_string());
            return;
        }

        if let Err(e) = self.transition(MigrationState::RollingBack) {
            self.finish(MigrationState::Failed, class, format!("{}; {}", err, e));
            return;
        }
        match self.rollback().await {
            Ok(()) => self.finish(MigrationState::RolledBack, class, err.to_string()),
            Err(rollback_err) => {
                error!(migration = %self.id, "Rollback failed: {}", rollback_err);
                self.finish(
                    MigrationState::Failed,
                    class,
                    format!("{}; rollback failed: {}", err, rollback_err),
                );
            }
        }
    }

    /// Undo every write this migration made to the target
    async fn rollback(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        let batches = self.journal.restore_batches(self.config.batch_size);
        let restored: usize = batches.iter().map(|b| b.len()).sum();
        for batch in batches {
            self.config
                .retry
                .run("restore target batch", || self.apply(&self.target, batch.clone()))
                .await?;
        }
        self.journal.clear();
        info!(migration = %self.id, "Rolled back {} keys on {}", restored, self.config.target);
        Ok(())
    }

    fn check_interrupts(&self, deadline: Instant) -> Result<()> {
        if *self.cancel_tx.borrow() || self.state() == MigrationState::Cancelling {
            return Err(Error::Cancelled(format!("migration {} cancelled", self.id)));
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "migration {} exceeded {:?}",
                self.id, self.config.timeout
            )));
        }
        Ok(())
    }

    fn transition(&self, next: MigrationState) -> Result<()> {
        self.transition_inner(next, None)
    }

    fn finish(&self, next: MigrationState, class: FailureClass, message: String) {
        if let Err(e) = self.transition_inner(next, Some((class, message))) {
            error!(migration = %self.id, "Could not record terminal state {}: {}", next, e);
        }
    }

    fn transition_inner(
        &self,
        next: MigrationState,
        failure: Option<(FailureClass, String)>,
    ) -> Result<()> {
        let previous = {
            let mut p = self.progress.write();
            let current = p.state;
            if current == MigrationState::Cancelling
                && !matches!(next, MigrationState::Cancelled | MigrationState::Failed)
            {
                return Err(Error::Cancelled(format!("migration {} cancelled", self.id)));
            }
            if !current.can_transition_to(next) {
                return Err(Error::InvalidState(format!(
                    "migration {} cannot move from {} to {}",
                    self.id, current, next
                )));
            }
            if next == MigrationState::Initializing {
                p.started = Some(Instant::now());
                p.started_at = Some(Utc::now());
            }
            if next.is_terminal() {
                p.frozen_elapsed = Some(p.elapsed());
            }
            if let Some((class, message)) = failure {
                p.failure = Some(class);
                p.message = Some(message);
            }
            p.state = next;
            p.updated_at = Utc::now();
            current
        };
        self.persist();
        info!(migration = %self.id, "State {} -> {}", previous, next);
        self.state_tx.send_replace(next);
        Ok(())
    }

    fn persist(&self) {
        if let Some(sink) = &self.checkpoints {
            if let Err(e) = sink.save(&self.progress()) {
                warn!(migration = %self.id, "Failed to persist checkpoint: {}", e);
            }
        }
    }

    async fn ping(&self, shard: &ShardHandle) -> Result<()> {
        let conn = shard.acquire().await?;
        conn.ping().await
    }

    async fn count(&self, shard: &ShardHandle) -> Result<u64> {
        let conn = shard.acquire().await?;
        conn.count().await
    }

    async fn scan(
        &self,
        shard: &ShardHandle,
        after: Option<&RecordKey>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let conn = shard.acquire().await?;
        conn.scan_after(after, limit).await
    }

    async fn get_many(&self, shard: &ShardHandle, keys: &[RecordKey]) -> Result<Vec<Option<Record>>> {
        let conn = shard.acquire().await?;
        conn.get_many(keys).await
    }

    async fn apply(&self, shard: &ShardHandle, batch: WriteBatch) -> Result<PriorValues> {
        let conn = shard.acquire().await?;
        conn.apply(batch).await
    }
}
