// Undo journal for the target shard of a migration

use crate::record::{PriorValues, Record, RecordKey, WriteBatch, WriteOp};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Keeps the value each target key held before the migration first touched it.
/// Replaying it restores the target to its pre-migration contents.
#[derive(Default)]
pub struct UndoJournal {
    entries: Mutex<HashMap<RecordKey, Option<Record>>>,
}

impl UndoJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record priors of a committed batch; only the first prior per key is kept
    pub fn record(&self, priors: PriorValues) {
        let mut entries = self.entries.lock();
        for (key, prior) in priors {
            entries.entry(key).or_insert(prior);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Restore batches of at most `batch_size` ops, in key order
    pub fn restore_batches(&self, batch_size: usize) -> Vec<WriteBatch> {
        let entries = self.entries.lock();
        let mut ops: Vec<WriteOp> = entries
            .iter()
            .map(|(key, prior)| match prior {
                Some(record) => WriteOp::Put(record.clone()),
                None => WriteOp::Delete(key.clone()),
            })
            .collect();
        ops.sort_by(|a, b| a.key().cmp(b.key()));
        ops.chunks(batch_size.max(1))
            .map(|chunk| WriteBatch { ops: chunk.to_vec() })
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_prior_wins() {
        let journal = UndoJournal::new();
        let key = RecordKey::new("orders", 1);
        journal.record(vec![(key.clone(), None)]);
        journal.record(vec![(key.clone(), Some(Record::new(key.clone())))]);

        let batches = journal.restore_batches(10);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].ops, vec![WriteOp::Delete(key)]);
    }

    #[test]
    fn test_restore_batches_are_chunked() {
        let journal = UndoJournal::new();
        journal.record((0..25).map(|i| (RecordKey::new("orders", i), None)).collect());
        let batches = journal.restore_batches(10);
        assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), vec![10, 10, 5]);
    }
}
