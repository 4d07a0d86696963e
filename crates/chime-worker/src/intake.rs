use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use chime_cluster::ShardConsumer;
use chime_core::{Clock, JobDefinition, Shard};
use chime_store::{BacklogQuery, Datastore, StoreError};

use crate::error::{Result, WorkerError};

/// Moves registered jobs into the queue as their instant arrives.
///
/// Startup order matters: the due backlog is drained through the paged query
/// *before* any watch subscription opens, keeping cold-start replay under the
/// store's bound. After that the pump follows the store's registration watch
/// when the backend has one, and otherwise polls the backlog on a fixed
/// cadence. Either way, `queue_jobs` being idempotent-once absorbs the
/// duplicate signals both paths can produce.
pub struct Intake {
    store: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
    shards: Option<Vec<Shard>>,
    poll_interval: Duration,
    page_size: usize,
    closed_tx: watch::Sender<bool>,
}

impl Intake {
    pub fn new(
        store: Arc<dyn Datastore>,
        clock: Arc<dyn Clock>,
        shards: Option<Vec<Shard>>,
        poll_interval: Duration,
        page_size: usize,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            store,
            clock,
            shards,
            poll_interval,
            page_size,
            closed_tx,
        }
    }

    /// Drive the pump until `close()`.
    pub async fn run(&self) -> Result<()> {
        if *self.closed_tx.subscribe().borrow() {
            return Ok(());
        }
        self.drain_due_backlog().await?;
        if self.store.capabilities().watch_registered {
            self.run_watch().await
        } else {
            self.run_poll().await
        }
    }

    /// Queue everything already due, in pages. Jobs another pump queued in
    /// the meantime come back from the query as already-queued; that is a
    /// skip, not a failure.
    async fn drain_due_backlog(&self) -> Result<()> {
        let mut offset = 0;
        loop {
            let page = self
                .store
                .get_jobs_scheduled_before(
                    BacklogQuery {
                        offset,
                        milliseconds_from_now: 0,
                        limit: self.page_size,
                    },
                    self.shards.as_deref(),
                )
                .await?;
            let drained = page.len();
            for job in &page {
                self.queue_tolerantly(job).await?;
            }
            if drained < self.page_size {
                return Ok(());
            }
            offset += drained;
        }
    }

    async fn run_watch(&self) -> Result<()> {
        let mut stream = self
            .store
            .listen_to_newly_registered_jobs(self.shards.as_deref())
            .await?;
        let mut closed_rx = self.closed_tx.subscribe();

        loop {
            tokio::select! {
                batch = stream.next() => match batch {
                    None => return Ok(()),
                    Some(Err(StoreError::Cancelled)) if self.is_closed(&closed_rx) => {
                        return Ok(());
                    }
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(jobs)) => {
                        for job in jobs {
                            self.dispatch(job).await?;
                        }
                    }
                },
                _ = closed_rx.changed() => {
                    if *closed_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn run_poll(&self) -> Result<()> {
        let mut closed_rx = self.closed_tx.subscribe();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.drain_due_backlog().await?,
                _ = closed_rx.changed() => {
                    if *closed_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Queue a job now if due, otherwise park a timer task for it.
    async fn dispatch(&self, job: JobDefinition) -> Result<()> {
        let delay = job.scheduled_at.signed_duration_since(self.clock.now());
        match delay.to_std() {
            // Negative delay: already due.
            Err(_) => self.queue_tolerantly(&job).await,
            Ok(delay) => {
                let mut closed_rx = self.closed_tx.subscribe();
                if *closed_rx.borrow() {
                    return Ok(());
                }
                debug!(job_id = %job.id, delay_ms = delay.as_millis() as u64, "job parked until due");
                let store = Arc::clone(&self.store);
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = closed_rx.changed() => return,
                    }
                    if let Err(e) = queue_tolerantly_on(store.as_ref(), &job).await {
                        error!(job_id = %job.id, "failed to queue due job: {e}");
                    }
                });
                Ok(())
            }
        }
    }

    async fn queue_tolerantly(&self, job: &JobDefinition) -> Result<()> {
        queue_tolerantly_on(self.store.as_ref(), job).await
    }

    fn is_closed(&self, closed_rx: &watch::Receiver<bool>) -> bool {
        *closed_rx.borrow()
    }

    /// Stop the pump and its parked timers. Idempotent.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

/// `AlreadyQueued` means another signal got there first; `JobNotFound` means
/// the job was cancelled between registration and its instant. Both are
/// normal outcomes for a duplicate-tolerant pump.
async fn queue_tolerantly_on(store: &dyn Datastore, job: &JobDefinition) -> Result<()> {
    match store.queue_jobs(std::slice::from_ref(job)).await {
        Ok(()) => Ok(()),
        Err(StoreError::AlreadyQueued { id }) => {
            debug!(job_id = %id, "already queued, skipping");
            Ok(())
        }
        Err(StoreError::JobNotFound { id }) => {
            warn!(job_id = %id, "job vanished before queueing, likely cancelled");
            Ok(())
        }
        Err(e) => Err(WorkerError::Store(e)),
    }
}

#[async_trait]
impl ShardConsumer for Intake {
    async fn close(&self) {
        Intake::close(self);
    }
}
