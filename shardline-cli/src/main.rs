// Shardline command line: run shard migrations, check shard health and
// inspect migration checkpoints

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use shardline_core::{MigrationId, ShardId, ShardlineConfig};
use shardline_storage::{
    MetricsExporter, MigrationCoordinator, MigrationProgress, MigrationRequest, MigrationState,
    MigrationStore, Record, RecordKey, RouteSink, ShardHealthChecker, ShardInfo, ShardRouter, ShardStore,
    SledShardStore, WriteBatch,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "shardline")]
#[command(about = "Online shard migration and health tooling", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, TOML or YAML)
    #[arg(long, short, global = true)]
    config: Option<String>,

    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Move every record from one shard to another
    Migrate {
        #[arg(long)]
        source: u32,

        #[arg(long)]
        target: u32,

        #[arg(long)]
        batch_size: Option<usize>,

        /// Verify a random sample instead of every record
        #[arg(long)]
        sample: Option<usize>,

        /// Leave the target as is when the migration fails
        #[arg(long)]
        no_rollback: bool,

        /// Shard written first during the dual-write window
        #[arg(long)]
        leader: Option<u32>,

        /// Seconds between progress lines
        #[arg(long)]
        status_interval: Option<u64>,
    },

    /// Probe every configured shard once
    Health {
        /// Print Prometheus text format instead of JSON
        #[arg(long)]
        prometheus: bool,
    },

    /// Show persisted migration checkpoints
    Status {
        /// Only this migration
        #[arg(long)]
        id: Option<String>,
    },

    /// Load synthetic records into a shard
    Seed {
        #[arg(long)]
        shard: u32,

        #[arg(long, default_value = "orders")]
        table: String,

        #[arg(long, default_value = "10000")]
        count: u64,

        #[arg(long, default_value = "1")]
        start_id: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ShardlineConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => ShardlineConfig::default(),
    };
    config.apply_env();
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.instance.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .init();

    let ok = match cli.command {
        Commands::Migrate {
            source,
            target,
            batch_size,
            sample,
            no_rollback,
            leader,
            status_interval,
        } => {
            let mut request = MigrationRequest::new(ShardId(source), ShardId(target));
            request.batch_size = batch_size;
            if let Some(sample) = sample {
                request.verify_all = Some(false);
                request.sample_size = Some(sample);
            }
            if no_rollback {
                request.rollback_on_error = Some(false);
            }
            request.dual_write_leader = leader.map(ShardId);
            let interval = status_interval.unwrap_or(config.migration.status_interval_secs);
            run_migration(&config, request, Duration::from_secs(interval.max(1))).await?
        }
        Commands::Health { prometheus } => {
            check_health(&config, prometheus).await?;
            true
        }
        Commands::Status { id } => {
            show_status(&config, id)?;
            true
        }
        Commands::Seed {
            shard,
            table,
            count,
            start_id,
        } => {
            seed_shard(&config, ShardId(shard), &table, start_id, count).await?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Open every configured shard. With `routes`, redirects from earlier
/// cutovers are restored and new ones are persisted there.
fn build_router(
    config: &ShardlineConfig,
    routes: Option<Arc<MigrationStore>>,
) -> anyhow::Result<(Arc<ShardRouter>, Vec<Arc<SledShardStore>>)> {
    let pool = &config.connection_pool;
    let mut router = ShardRouter::new(pool.max_connections, pool.acquire_timeout());
    if let Some(routes) = &routes {
        router.restore_routes(routes.load_routes()?);
        let sink: Arc<dyn RouteSink> = routes.clone();
        router = router.with_route_sink(sink);
    }
    let router = Arc::new(router);

    let mut stores = Vec::with_capacity(config.shards.len());
    for endpoint in &config.shards {
        let id = ShardId(endpoint.id);
        let store = Arc::new(
            SledShardStore::open(id, &endpoint.path)
                .with_context(|| format!("opening {} at {}", id, endpoint.path))?,
        );
        let mut info = ShardInfo::new(id, endpoint.path.clone());
        info.region = endpoint.region.clone();
        let max = endpoint.max_connections.unwrap_or(pool.max_connections);
        router.register_with_pool(info, store.clone(), max)?;
        stores.push(store);
    }
    Ok((router, stores))
}

fn checkpoint_store(config: &ShardlineConfig) -> anyhow::Result<Arc<MigrationStore>> {
    let path = Path::new(&config.instance.data_dir).join("migrations");
    let store = MigrationStore::open(&path)
        .with_context(|| format!("opening checkpoints at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn progress_line(progress: &MigrationProgress) -> String {
    let rate = progress.rate();
    let eta = progress
        .estimated_remaining_secs
        .map(|secs| format!(", ETA {}m{:02}s", secs as u64 / 60, secs as u64 % 60))
        .unwrap_or_default();
    format!(
        "{} | {:.1}% | {}/{} records | {:.1} rec/s{}",
        progress.state,
        progress.percent_complete,
        progress.migrated_records,
        progress.total_records,
        rate,
        eta
    )
}

async fn run_migration(
    config: &ShardlineConfig,
    request: MigrationRequest,
    status_interval: Duration,
) -> anyhow::Result<bool> {
    let checkpoints = checkpoint_store(config)?;
    let (router, stores) = build_router(config, Some(checkpoints.clone()))?;
    let coordinator = MigrationCoordinator::start(router, config.migration.clone(), Some(checkpoints));

    for stale in coordinator.recover_interrupted()? {
        warn!(
            "Migration {} was left unfinished (cursor {:?})",
            stale.id,
            stale.cursor.as_ref().map(|c| c.to_string())
        );
    }

    info!("Migrating {} -> {}", request.source, request.target);
    let id = coordinator.start_migration(request)?;
    let migration = coordinator.get(&id)?;

    let mut ticker = tokio::time::interval(status_interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    let final_state = loop {
        tokio::select! {
            _ = ticker.tick() => {
                info!("{}", progress_line(&migration.progress()));
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupt received, cancelling {}", id);
                if let Err(e) = coordinator.cancel(&id) {
                    warn!("Cancel rejected: {}", e);
                }
            }
            state = migration.wait() => break state,
        }
    };

    let progress = migration.progress();
    println!("{}", serde_json::to_string_pretty(&progress)?);
    coordinator.shutdown();
    for store in &stores {
        if let Err(e) = store.flush().await {
            warn!("Flush of {} failed: {}", store.shard_id(), e);
        }
    }

    if final_state == MigrationState::Completed {
        info!("Migration {} completed in {:.1}s", id, progress.elapsed_secs);
        Ok(true)
    } else {
        error!(
            "Migration {} ended as {} ({})",
            id,
            final_state,
            progress.message.as_deref().unwrap_or("no details")
        );
        Ok(false)
    }
}

async fn check_health(config: &ShardlineConfig, prometheus: bool) -> anyhow::Result<()> {
    let (router, _stores) = build_router(config, None)?;
    let checker = ShardHealthChecker::from_config(router, &config.health);
    let shards = checker.check_all().await;

    if prometheus {
        let exporter = MetricsExporter::new()?;
        exporter.update_shards(&shards);
        print!("{}", exporter.render()?);
        return Ok(());
    }
    let report = json!({
        "summary": checker.summary(),
        "shards": shards,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn show_status(config: &ShardlineConfig, id: Option<String>) -> anyhow::Result<()> {
    let store = checkpoint_store(config)?;
    match id {
        Some(id) => {
            let id = MigrationId(id);
            match store.load(&id)? {
                Some(progress) => println!("{}", serde_json::to_string_pretty(&progress)?),
                None => anyhow::bail!("no checkpoint for {}", id),
            }
        }
        None => {
            let mut all = store.list()?;
            all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            if all.is_empty() {
                println!("No migrations recorded");
            }
            for progress in &all {
                println!("{}  {}", progress.id, progress_line(progress));
            }
            let mut routes: Vec<_> = store.load_routes()?.into_iter().collect();
            routes.sort();
            for (from, to) in routes {
                println!("route  {} -> {}", from, to);
            }
        }
    }
    Ok(())
}

async fn seed_shard(
    config: &ShardlineConfig,
    shard: ShardId,
    table: &str,
    start_id: u64,
    count: u64,
) -> anyhow::Result<()> {
    let endpoint = config
        .shard(shard.0)
        .with_context(|| format!("{} is not configured", shard))?;
    let store = SledShardStore::open(shard, &endpoint.path)?;
    let batch_size = config.migration.batch_size as u64;
    let now = Utc::now().to_rfc3339();

    let mut written = 0;
    while written < count {
        let n = batch_size.min(count - written);
        let records = (0..n)
            .map(|i| {
                let id = start_id + written + i;
                Record::new(RecordKey::new(table, id))
                    .with_field("tenant", json!(format!("tenant-{}", id % 16)))
                    .with_field("amount_cents", json!(id * 10))
                    .with_field("created_at", json!(now))
            })
            .collect();
        store.apply(WriteBatch::upserts(records)).await?;
        written += n;
    }
    store.flush().await?;
    info!("Seeded {} records into {} ({})", count, shard, table);
    Ok(())
}
