use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use chime_cluster::{ClusterTopologyAware, LocalCluster, ShardConsumer};
use chime_core::{ChimeConfig, Clock, HashSharding, Shard, ShardSpace, SystemClock};
use chime_store::{Datastore, MemoryStore, SqliteStore};
use chime_worker::{HttpCallbackTransport, Intake, Processor, Shuffler};

#[derive(Parser)]
#[command(name = "chime-node", about = "Sharded callback-job scheduler node")]
struct Args {
    /// Config file path (default: $CHIME_CONFIG, then ~/.chime/chime.toml)
    #[arg(long)]
    config: Option<String>,

    /// Run on an in-memory store instead of SQLite; nothing survives a
    /// restart.
    #[arg(long)]
    ephemeral: bool,
}

/// Everything one node runs for its owned shard slice.
struct WorkerNode {
    intake: Arc<Intake>,
    processor: Arc<Processor>,
}

#[async_trait::async_trait]
impl ShardConsumer for WorkerNode {
    async fn close(&self) {
        self.intake.close();
        self.processor.close();
    }
}

fn build_node(
    store: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
    transport: Arc<HttpCallbackTransport>,
    shards: Vec<Shard>,
    poll_interval: Duration,
    batch_size: usize,
    replay_limit: usize,
) -> Arc<WorkerNode> {
    let intake = Arc::new(Intake::new(
        store.clone(),
        clock.clone(),
        Some(shards.clone()),
        poll_interval,
        replay_limit,
    ));
    let processor = Arc::new(Processor::new(
        store,
        transport,
        clock,
        Shuffler::entropy(),
        Some(shards),
        batch_size,
    ));
    tokio::spawn({
        let intake = intake.clone();
        async move {
            if let Err(e) = intake.run().await {
                error!("intake stopped: {e}");
            }
        }
    });
    tokio::spawn({
        let processor = processor.clone();
        async move {
            if let Err(e) = processor.run().await {
                error!("processor stopped: {e}");
            }
        }
    });
    Arc::new(WorkerNode { intake, processor })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chime=info".into()),
        )
        .init();

    let args = Args::parse();

    // config: explicit path > CHIME_CONFIG env > ~/.chime/chime.toml
    let config_path = args
        .config
        .or_else(|| std::env::var("CHIME_CONFIG").ok());
    let config = ChimeConfig::load(config_path.as_deref())?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let space = ShardSpace::new(config.sharding.space_version, config.sharding.shard_count);
    let sharding = Arc::new(HashSharding::new(space));
    let poll_interval = Duration::from_millis(config.worker.poll_interval_ms);

    let store: Arc<dyn Datastore> = if args.ephemeral {
        info!("using in-memory store (--ephemeral)");
        Arc::new(MemoryStore::new(
            clock.clone(),
            sharding,
            config.worker.replay_limit,
        ))
    } else {
        let db_path = &config.database.path;
        ensure_parent_dir(db_path);
        info!(path = %db_path, "opening SQLite database");
        Arc::new(SqliteStore::open(
            db_path,
            clock.clone(),
            sharding,
            poll_interval,
        )?)
    };

    let transport = Arc::new(HttpCallbackTransport::new(
        config.callback.endpoint.clone(),
        Duration::from_millis(config.callback.timeout_ms),
    )?);
    info!(endpoint = %config.callback.endpoint, "callback transport ready");

    // Single-process deployment: this node is the whole cluster. The
    // topology wrapper still runs so the shard plumbing is exercised the
    // same way it is under a multi-node coordination backend.
    let cluster = LocalCluster::new(space);
    let session = Arc::new(cluster.join(config.node.id.clone())?);
    info!(node = %config.node.id, shards = space.count, "joined cluster");

    let bound = {
        let store = store.clone();
        let clock = clock.clone();
        let transport = transport.clone();
        let batch_size = config.worker.batch_size;
        let replay_limit = config.worker.replay_limit;
        ClusterTopologyAware::bind(session, move |shards| {
            let node = build_node(
                store.clone(),
                clock.clone(),
                transport.clone(),
                shards,
                poll_interval,
                batch_size,
                replay_limit,
            );
            async move { Ok(node) }
        })
        .await?
    };

    info!("chime node running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    bound.close().await?;
    store.close().await?;
    Ok(())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
