use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

use chime_core::Shard;

use crate::coordination::CoordinationClient;
use crate::error::{ClusterError, Result};

/// A shard-scoped consumer a topology wrapper can drive: something holding
/// live subscriptions against a fixed shard set, torn down with `close()`.
#[async_trait]
pub trait ShardConsumer: Send + Sync {
    /// Tear down this consumer's subscriptions and stop its loops. Must be
    /// idempotent; the wrapper may race it with a natural shutdown.
    async fn close(&self);
}

type ConsumerFactory<C> =
    Arc<dyn Fn(Vec<Shard>) -> BoxFuture<'static, Result<Arc<C>>> + Send + Sync>;

/// Binds a shard-scoped consumer to a coordination session.
///
/// On every ownership change the current consumer is closed before its
/// replacement is built, so at no instant does one node hold two active
/// subscriptions to the same shard — and since ownership sets across nodes
/// are disjoint, no shard has more than one active subscription cluster-wide.
pub struct ClusterTopologyAware<C: ShardConsumer + 'static> {
    coordination: Arc<dyn CoordinationClient>,
    current: Arc<Mutex<Option<Arc<C>>>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<C: ShardConsumer + 'static> ClusterTopologyAware<C> {
    /// Acquire the binding: build a consumer for the session's current shard
    /// set and start following ownership changes.
    ///
    /// The coordination session is treated as a scoped resource — if the
    /// initial consumer build fails, the session is released before the
    /// error propagates.
    pub async fn bind<F, Fut>(
        coordination: Arc<dyn CoordinationClient>,
        factory: F,
    ) -> Result<Self>
    where
        F: Fn(Vec<Shard>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<C>>> + Send + 'static,
    {
        let factory: ConsumerFactory<C> = Arc::new(move |shards| Box::pin(factory(shards)));

        let mut ownership = coordination.watch_ownership();
        let initial = ownership.borrow_and_update().clone();
        let consumer = match factory(initial.clone()).await {
            Ok(consumer) => consumer,
            Err(e) => {
                let _ = coordination.close().await;
                return Err(e);
            }
        };
        info!(node = coordination.node_id(), shards = initial.len(), "consumer bound to shard set");

        let current = Arc::new(Mutex::new(Some(consumer)));
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let task = {
            let current = Arc::clone(&current);
            let factory = Arc::clone(&factory);
            let node = coordination.node_id().to_string();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = ownership.changed() => {
                            if changed.is_err() {
                                // Coordination service went away; nothing
                                // left to follow.
                                break;
                            }
                        }
                        _ = stop_rx.changed() => {
                            if *stop_rx.borrow() {
                                break;
                            }
                        }
                    }

                    let shards = ownership.borrow_and_update().clone();
                    let mut slot = current.lock().await;
                    // Old subscriptions must be gone before the new shard
                    // set goes live.
                    if let Some(old) = slot.take() {
                        old.close().await;
                    }
                    match factory(shards.clone()).await {
                        Ok(next) => {
                            info!(node = %node, shards = shards.len(), "consumer rebound after rebalance");
                            *slot = Some(next);
                        }
                        Err(e) => {
                            // Leave the slot empty; the next churn event
                            // retries the build.
                            error!(node = %node, "consumer rebuild failed: {e}");
                        }
                    }
                }
            })
        };

        Ok(Self {
            coordination,
            current,
            stop_tx,
            task: Mutex::new(Some(task)),
        })
    }

    /// The consumer currently bound, if a build is not in flight or failed.
    pub async fn consumer(&self) -> Option<Arc<C>> {
        self.current.lock().await.clone()
    }

    /// Stop following ownership changes, close the live consumer, and
    /// release the coordination session.
    pub async fn close(&self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        if let Some(task) = self.task.lock().await.take() {
            if task.await.is_err() {
                return Err(ClusterError::ConsumerBuild(
                    "topology task panicked".to_string(),
                ));
            }
        }
        if let Some(consumer) = self.current.lock().await.take() {
            consumer.close().await;
        }
        self.coordination.close().await
    }
}
