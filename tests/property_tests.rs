use proptest::prelude::*;
use serde_json::json;
use shardline_core::{MigrationId, ShardId};
use shardline_storage::*;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn rows(n: u64) -> Vec<Record> {
    (1..=n)
        .map(|id| Record::new(RecordKey::new("items", id * 3)).with_field("sku", json!(format!("sku-{}", id))))
        .collect()
}

fn migration(
    records: u64,
    batch_size: usize,
) -> (Arc<ShardRouter>, Arc<MemoryShardStore>, Arc<MemoryShardStore>, MigrationConfig) {
    let router = Arc::new(ShardRouter::new(4, Duration::from_secs(5)));
    let source = Arc::new(MemoryShardStore::new(ShardId(10)));
    let target = Arc::new(MemoryShardStore::new(ShardId(11)));
    source.seed(rows(records));
    router.register(ShardInfo::new(ShardId(10), "mem"), source.clone()).unwrap();
    router.register(ShardInfo::new(ShardId(11), "mem"), target.clone()).unwrap();
    let config = MigrationConfig::new(ShardId(10), ShardId(11))
        .with_batch_size(batch_size)
        .with_retry(RetryPolicy::immediate(2));
    (router, source, target, config)
}

fn build(router: &Arc<ShardRouter>, config: MigrationConfig) -> ShardMigration {
    let cutover: Arc<dyn CutoverHandler> = router.clone();
    ShardMigration::new(
        MigrationId::generate(config.source, config.target),
        config,
        router.get(ShardId(10)).unwrap(),
        router.get(ShardId(11)).unwrap(),
        cutover,
    )
    .unwrap()
}

proptest! {
    #[test]
    fn test_jump_hash_stays_in_range(key in any::<u64>(), buckets in 1u32..10_000) {
        prop_assert!(jump_consistent_hash(key, buckets) < buckets);
    }

    #[test]
    fn test_jump_hash_only_moves_to_new_bucket(key in any::<u64>(), buckets in 1u32..1_000) {
        let before = jump_consistent_hash(key, buckets);
        let after = jump_consistent_hash(key, buckets + 1);
        prop_assert!(after == before || after == buckets);
    }

    #[test]
    fn test_tenant_routing_is_stable(tenant in "[a-z0-9-]{1,24}") {
        let router = ShardRouter::new(1, Duration::from_secs(1));
        for id in 0..5 {
            router
                .register(ShardInfo::new(ShardId(id), "mem"), Arc::new(MemoryShardStore::new(ShardId(id))))
                .unwrap();
        }
        prop_assert_eq!(router.home_shard(&tenant).unwrap(), router.home_shard(&tenant).unwrap());
        prop_assert_eq!(tenant_hash(&tenant), tenant_hash(&tenant));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_copy_matches_source_for_any_batch_size(records in 0u64..300, batch_size in 1usize..64) {
        let (router, source, target, config) = migration(records, batch_size);
        let migration = build(&router, config);
        let state = runtime().block_on(migration.run());

        prop_assert_eq!(state, MigrationState::Completed);
        prop_assert_eq!(migration.progress().migrated_records, records);
        prop_assert_eq!(target.snapshot(), source.snapshot());
    }

    #[test]
    fn test_resumed_copy_converges(records in 1u64..300, done in 0u64..300, batch_size in 1usize..64) {
        let done = done.min(records);
        let (router, source, target, config) = migration(records, batch_size);
        let copied: Vec<Record> = source.snapshot().into_iter().take(done as usize).collect();
        let cursor = copied.last().map(|r| r.key.clone());
        target.seed(copied);

        let mut migration = build(&router, config);
        if let Some(cursor) = cursor {
            migration = migration.with_cursor(cursor, done);
        }
        let state = runtime().block_on(migration.run());

        prop_assert_eq!(state, MigrationState::Completed);
        let progress = migration.progress();
        prop_assert_eq!(progress.migrated_records, records);
        prop_assert_eq!(progress.total_records, records);
        prop_assert_eq!(target.snapshot(), source.snapshot());
    }
}
