//! Whole-pipeline test: schedule, intake, claim, callback, completion —
//! across a rebalancing cluster of worker nodes over one shared store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use chime_cluster::{ClusterTopologyAware, LocalCluster, ShardConsumer};
use chime_core::{
    CallbackStatus, Clock, HashSharding, JobId, ManualClock, ScheduledAt, Shard, ShardSpace,
};
use chime_store::{Datastore, MemoryStore, ScheduleRequest};
use chime_worker::{CallbackTransport, Intake, Processor, Shuffler};

struct CountingTransport {
    hits: Mutex<HashMap<JobId, usize>>,
}

impl CountingTransport {
    fn new() -> Self {
        Self {
            hits: Mutex::new(HashMap::new()),
        }
    }

    fn count(&self, id: &JobId) -> usize {
        *self.hits.lock().unwrap().get(id).unwrap_or(&0)
    }
}

#[async_trait]
impl CallbackTransport for CountingTransport {
    async fn invoke(&self, id: &JobId) -> CallbackStatus {
        tokio::time::sleep(Duration::from_millis(2)).await;
        *self.hits.lock().unwrap().entry(id.clone()).or_insert(0) += 1;
        CallbackStatus::ok(200)
    }
}

/// What one node runs for its owned shard slice: an intake pump feeding the
/// queue and a processor draining it.
struct WorkerNode {
    intake: Arc<Intake>,
    processor: Arc<Processor>,
}

#[async_trait]
impl ShardConsumer for WorkerNode {
    async fn close(&self) {
        self.intake.close();
        self.processor.close();
    }
}

fn build_node(
    store: Arc<MemoryStore>,
    clock: Arc<dyn Clock>,
    transport: Arc<CountingTransport>,
    shards: Vec<Shard>,
    seed: u64,
) -> Arc<WorkerNode> {
    let intake = Arc::new(Intake::new(
        store.clone(),
        clock.clone(),
        Some(shards.clone()),
        Duration::from_millis(20),
        100,
    ));
    let processor = Arc::new(Processor::new(
        store,
        transport,
        clock,
        Shuffler::seeded(seed),
        Some(shards),
        5,
    ));
    tokio::spawn({
        let intake = intake.clone();
        async move {
            if let Err(e) = intake.run().await {
                panic!("intake failed: {e}");
            }
        }
    });
    tokio::spawn({
        let processor = processor.clone();
        async move {
            if let Err(e) = processor.run().await {
                panic!("processor failed: {e}");
            }
        }
    });
    Arc::new(WorkerNode { intake, processor })
}

async fn wait_all_complete(store: &Arc<MemoryStore>, ids: &[JobId]) {
    for id in ids {
        let mut done = false;
        for _ in 0..400 {
            if store.completion(id).await.unwrap().is_some() {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done, "job {id} never completed");
    }
}

#[tokio::test]
async fn cluster_executes_every_job_exactly_once_across_a_rebalance() {
    let clock = Arc::new(ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap()));
    let store = Arc::new(MemoryStore::new(
        clock.clone(),
        Arc::new(HashSharding::new(ShardSpace::new(1, 16))),
        1_000,
    ));
    let transport = Arc::new(CountingTransport::new());
    let cluster = LocalCluster::new(ShardSpace::new(1, 16));

    let bind_node = |name: &str, seed: u64| {
        let session = Arc::new(cluster.join(name).unwrap());
        let store = store.clone();
        let clock: Arc<dyn Clock> = clock.clone();
        let transport = transport.clone();
        async move {
            ClusterTopologyAware::bind(session, move |shards| {
                let node = build_node(
                    store.clone(),
                    clock.clone(),
                    transport.clone(),
                    shards,
                    seed,
                );
                async move { Ok(node) }
            })
            .await
            .unwrap()
        }
    };

    let node_a = bind_node("node-a", 1).await;
    let node_b = bind_node("node-b", 2).await;

    let mut ids = Vec::new();
    for i in 0..12 {
        let id = store
            .schedule(
                ScheduleRequest::at(ScheduledAt::now(clock.as_ref()))
                    .with_id(JobId::new(format!("wave1-{i}"))),
            )
            .await
            .unwrap();
        ids.push(id);
    }
    wait_all_complete(&store, &ids).await;

    // Membership churn mid-stream: a third node joins, both survivors rebind
    // to smaller slices, and the next wave still runs exactly once.
    let node_c = bind_node("node-c", 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut wave2 = Vec::new();
    for i in 0..12 {
        let id = store
            .schedule(
                ScheduleRequest::at(ScheduledAt::now(clock.as_ref()))
                    .with_id(JobId::new(format!("wave2-{i}"))),
            )
            .await
            .unwrap();
        wave2.push(id);
    }
    wait_all_complete(&store, &wave2).await;

    for id in ids.iter().chain(&wave2) {
        assert_eq!(transport.count(id), 1, "job {id} not executed exactly once");
    }

    node_a.close().await.unwrap();
    node_b.close().await.unwrap();
    node_c.close().await.unwrap();
    assert_eq!(cluster.member_count(), 0);
}

#[tokio::test]
async fn single_node_cluster_runs_the_whole_shard_space() {
    let clock = Arc::new(ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap()));
    let store = Arc::new(MemoryStore::new(
        clock.clone(),
        Arc::new(HashSharding::new(ShardSpace::new(1, 8))),
        1_000,
    ));
    let transport = Arc::new(CountingTransport::new());
    let cluster = LocalCluster::new(ShardSpace::new(1, 8));
    let session = Arc::new(cluster.join("solo").unwrap());

    let bound = {
        let store = store.clone();
        let clock: Arc<dyn Clock> = clock.clone();
        let transport = transport.clone();
        ClusterTopologyAware::bind(session, move |shards| {
            let node = build_node(store.clone(), clock.clone(), transport.clone(), shards, 7);
            async move { Ok(node) }
        })
        .await
        .unwrap()
    };

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(
            store
                .schedule(
                    ScheduleRequest::at(ScheduledAt::now(clock.as_ref()))
                        .with_id(JobId::new(format!("solo-{i}"))),
                )
                .await
                .unwrap(),
        );
    }
    wait_all_complete(&store, &ids).await;
    for id in &ids {
        assert_eq!(transport.count(id), 1);
    }

    bound.close().await.unwrap();
}
