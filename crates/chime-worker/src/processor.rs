use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::watch;
use tracing::{debug, error, info};

use chime_cluster::ShardConsumer;
use chime_core::{Clock, JobCompletion, JobDefinition, Shard};
use chime_store::{Datastore, StoreError};

use crate::error::{Result, WorkerError};
use crate::shuffle::Shuffler;
use crate::transport::CallbackTransport;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const CLOSED: u8 = 2;

/// The claim–execute–complete engine.
///
/// `idle → running → closed`, strictly forward: `run()` consumes the single
/// idle→running transition and `close()` is terminal — a closed processor is
/// replaced, never restarted. Replacement is what the topology layer does on
/// every rebalance, so restartability would only hide lifecycle bugs.
///
/// One job at a time. The processor takes a batch of claim candidates,
/// shuffles it, and walks it until one claim sticks; executing that job and
/// recording its completion happen before the next candidate or batch is
/// looked at.
pub struct Processor {
    store: Arc<dyn Datastore>,
    transport: Arc<dyn CallbackTransport>,
    clock: Arc<dyn Clock>,
    shuffler: Shuffler,
    shards: Option<Vec<Shard>>,
    batch_size: usize,
    state: AtomicU8,
    closed_tx: watch::Sender<bool>,
}

impl Processor {
    pub fn new(
        store: Arc<dyn Datastore>,
        transport: Arc<dyn CallbackTransport>,
        clock: Arc<dyn Clock>,
        shuffler: Shuffler,
        shards: Option<Vec<Shard>>,
        batch_size: usize,
    ) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            store,
            transport,
            clock,
            shuffler,
            shards,
            batch_size,
            state: AtomicU8::new(IDLE),
            closed_tx,
        }
    }

    /// Drive the claim loop until `close()` or the queue stream ends.
    ///
    /// Fails fast with `AlreadyRunning` / `Closed` when called out of the
    /// idle state. Store errors other than claim conflicts propagate; a
    /// conflict just means another worker won that job.
    pub async fn run(&self) -> Result<()> {
        match self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(RUNNING) => return Err(WorkerError::AlreadyRunning),
            Err(_) => return Err(WorkerError::Closed),
        }

        let mut stream = self
            .store
            .wait_for_next_jobs_in_queue(self.batch_size, self.shards.as_deref())
            .await?;
        let mut closed_rx = self.closed_tx.subscribe();
        // close() may have landed between the CAS and the subscription; the
        // watch would then never fire.
        if self.is_closed() {
            return Ok(());
        }

        loop {
            tokio::select! {
                batch = stream.next() => match batch {
                    None => return Ok(()),
                    Some(Err(StoreError::Cancelled)) if self.is_closed() => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(jobs)) => self.claim_one(jobs).await?,
                },
                _ = closed_rx.changed() => {
                    if *closed_rx.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Walk a shuffled candidate batch until one claim sticks, then execute
    /// that job to completion.
    async fn claim_one(&self, mut jobs: Vec<JobDefinition>) -> Result<()> {
        self.shuffler.shuffle(&mut jobs);
        for job in jobs {
            if self.is_closed() {
                return Ok(());
            }
            match self.store.mark_job_as_running(&job).await {
                Ok(()) => {
                    self.execute(job).await;
                    return Ok(());
                }
                Err(e) if e.is_claim_conflict() => {
                    debug!(job_id = %job.id, "lost claim race, moving on");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn execute(&self, job: JobDefinition) {
        let execution_start = self.clock.now();
        let started = Instant::now();
        let status = self.transport.invoke(&job.id).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let id = job.id.clone();
        let completion = JobCompletion {
            job,
            status,
            execution_start,
            duration_ms,
        };
        // The callback already fired; a failed completion write must not
        // take the processor down with it.
        match self.store.mark_job_as_complete(completion).await {
            Ok(record) => {
                info!(
                    job_id = %id,
                    duration_ms = record.duration_ms,
                    lag_ms = record.execution_lag_ms,
                    success = record.status.is_success(),
                    "job completed"
                );
            }
            Err(e) => {
                error!(job_id = %id, "failed to record completion: {e}");
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CLOSED
    }

    /// Terminal stop. Idempotent; a running `run()` returns `Ok` after the
    /// in-flight job (if any) finishes its completion write.
    pub fn close(&self) {
        self.state.store(CLOSED, Ordering::SeqCst);
        let _ = self.closed_tx.send(true);
    }
}

#[async_trait]
impl ShardConsumer for Processor {
    async fn close(&self) {
        Processor::close(self);
    }
}
