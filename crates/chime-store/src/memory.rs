use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_stream::stream;
use chrono::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, warn};

use chime_core::{
    Clock, CompletionRecord, JobCompletion, JobDefinition, JobId, Shard, ShardingAlgorithm,
};

use crate::error::{Result, StoreError};
use crate::store::{BacklogQuery, Datastore, JobBatchStream, ScheduleRequest, StoreCapabilities};

use async_trait::async_trait;

/// Watch-capable in-memory reference backend.
///
/// All four logical collections live behind one `Mutex`, which is also what
/// makes the queued→running claim a single atomic transition: whoever holds
/// the lock sees and mutates a consistent snapshot. Registration pushes go
/// out over a broadcast channel; queue arrivals wake waiters via `Notify`.
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    registered_tx: broadcast::Sender<JobDefinition>,
    queue_notify: Arc<Notify>,
    closed_tx: watch::Sender<bool>,
    clock: Arc<dyn Clock>,
    sharding: Arc<dyn ShardingAlgorithm>,
    replay_limit: usize,
}

#[derive(Default)]
struct Inner {
    registered: HashMap<JobId, JobDefinition>,
    queued: HashMap<JobId, JobDefinition>,
    running: HashMap<JobId, JobDefinition>,
    complete: HashMap<JobId, CompletionRecord>,
    closed: bool,
}

impl Inner {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn knows(&self, id: &JobId) -> bool {
        self.registered.contains_key(id)
            || self.queued.contains_key(id)
            || self.running.contains_key(id)
            || self.complete.contains_key(id)
    }
}

impl MemoryStore {
    pub fn new(
        clock: Arc<dyn Clock>,
        sharding: Arc<dyn ShardingAlgorithm>,
        replay_limit: usize,
    ) -> Self {
        let (registered_tx, _) = broadcast::channel(256);
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            registered_tx,
            queue_notify: Arc::new(Notify::new()),
            closed_tx,
            clock,
            sharding,
            replay_limit,
        }
    }
}

#[async_trait]
impl Datastore for MemoryStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            watch_registered: true,
        }
    }

    async fn schedule(&self, request: ScheduleRequest) -> Result<JobId> {
        let id = request.id.unwrap_or_else(JobId::generate);
        let job = JobDefinition {
            shards: self.sharding.shards_for(&id),
            id: id.clone(),
            scheduled_at: request.scheduled_at.instant(),
            args: request.args,
        };

        {
            let mut inner = self.inner.lock().unwrap();
            inner.ensure_open()?;
            if inner.knows(&id) {
                return Err(StoreError::AlreadyScheduled { id });
            }
            inner.registered.insert(id.clone(), job.clone());
        }

        debug!(job_id = %id, scheduled_at = %job.scheduled_at, "job registered");
        // No receivers is fine — nobody is watching yet.
        let _ = self.registered_tx.send(job);
        Ok(id)
    }

    async fn cancel(&self, id: &JobId) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_open()?;
        if inner.registered.remove(id).is_some() {
            debug!(job_id = %id, "registered job cancelled");
            return Ok(());
        }
        if inner.queued.remove(id).is_some() {
            debug!(job_id = %id, "queued job cancelled");
            self.queue_notify.notify_waiters();
            return Ok(());
        }
        if inner.running.contains_key(id) {
            return Err(StoreError::JobRunning { id: id.clone() });
        }
        if inner.complete.contains_key(id) {
            return Err(StoreError::AlreadyComplete { id: id.clone() });
        }
        Err(StoreError::JobNotFound { id: id.clone() })
    }

    async fn listen_to_newly_registered_jobs(
        &self,
        shards: Option<&[Shard]>,
    ) -> Result<JobBatchStream> {
        // Subscribe before snapshotting so nothing slips between the two;
        // jobs registered in that window show up twice, which the
        // idempotent-once queue absorbs.
        let mut rx = self.registered_tx.subscribe();
        let filter: Option<Vec<Shard>> = shards.map(<[Shard]>::to_vec);

        let replay: Vec<JobDefinition> = {
            let inner = self.inner.lock().unwrap();
            inner.ensure_open()?;
            inner
                .registered
                .values()
                .filter(|j| j.in_shards(filter.as_deref()))
                .cloned()
                .collect()
        };
        if replay.len() > self.replay_limit {
            return Err(StoreError::TooManyPreviousJobs {
                count: replay.len(),
                limit: self.replay_limit,
            });
        }

        let mut closed_rx = self.closed_tx.subscribe();
        let stream = stream! {
            if !replay.is_empty() {
                yield Ok(replay);
            }
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(job) => {
                            if job.in_shards(filter.as_deref()) {
                                yield Ok(vec![job]);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed pushes re-surface through the poll path.
                            warn!(skipped, "registration watch lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            yield Err(StoreError::Cancelled);
                            break;
                        }
                    },
                    _ = closed_rx.changed() => {
                        if *closed_rx.borrow() {
                            yield Err(StoreError::Cancelled);
                            break;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn get_jobs_scheduled_before(
        &self,
        query: BacklogQuery,
        shards: Option<&[Shard]>,
    ) -> Result<Vec<JobDefinition>> {
        let cutoff = self.clock.now() + Duration::milliseconds(query.milliseconds_from_now);
        let inner = self.inner.lock().unwrap();
        inner.ensure_open()?;

        let mut due: Vec<JobDefinition> = inner
            .registered
            .values()
            .chain(inner.queued.values())
            .filter(|j| j.in_shards(shards) && j.scheduled_at <= cutoff)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.scheduled_at
                .cmp(&b.scheduled_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(due.into_iter().skip(query.offset).take(query.limit).collect())
    }

    async fn wait_for_next_jobs_in_queue(
        &self,
        limit: usize,
        shards: Option<&[Shard]>,
    ) -> Result<JobBatchStream> {
        self.inner.lock().unwrap().ensure_open()?;

        let inner = Arc::clone(&self.inner);
        let notify = Arc::clone(&self.queue_notify);
        let mut closed_rx = self.closed_tx.subscribe();
        let filter: Option<Vec<Shard>> = shards.map(<[Shard]>::to_vec);

        let stream = stream! {
            loop {
                // Arm the wakeup before snapshotting so a queue change between
                // the snapshot and the await is never lost.
                let notified = notify.notified();

                let (closed, batch) = {
                    let inner = inner.lock().unwrap();
                    let mut batch: Vec<JobDefinition> = inner
                        .queued
                        .values()
                        .filter(|j| j.in_shards(filter.as_deref()))
                        .cloned()
                        .collect();
                    batch.sort_by(|a, b| {
                        a.scheduled_at
                            .cmp(&b.scheduled_at)
                            .then_with(|| a.id.cmp(&b.id))
                    });
                    batch.truncate(limit);
                    (inner.closed, batch)
                };
                if closed {
                    yield Err(StoreError::Cancelled);
                    break;
                }
                if !batch.is_empty() {
                    yield Ok(batch);
                }

                tokio::select! {
                    _ = notified => {}
                    _ = closed_rx.changed() => {
                        if *closed_rx.borrow() {
                            yield Err(StoreError::Cancelled);
                            break;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn queue_jobs(&self, jobs: &[JobDefinition]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_open()?;

        // Validate the whole batch before mutating anything.
        for job in jobs {
            if inner.queued.contains_key(&job.id)
                || inner.running.contains_key(&job.id)
                || inner.complete.contains_key(&job.id)
            {
                return Err(StoreError::AlreadyQueued {
                    id: job.id.clone(),
                });
            }
            if !inner.registered.contains_key(&job.id) {
                return Err(StoreError::JobNotFound {
                    id: job.id.clone(),
                });
            }
        }
        for job in jobs {
            let job = inner.registered.remove(&job.id).unwrap();
            inner.queued.insert(job.id.clone(), job);
        }
        drop(inner);
        self.queue_notify.notify_waiters();
        Ok(())
    }

    async fn mark_job_as_running(&self, job: &JobDefinition) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_open()?;

        if let Some(claimed) = inner.queued.remove(&job.id) {
            inner.running.insert(claimed.id.clone(), claimed);
            drop(inner);
            self.queue_notify.notify_waiters();
            return Ok(());
        }
        if inner.running.contains_key(&job.id) || inner.complete.contains_key(&job.id) {
            return Err(StoreError::AlreadyTaken {
                id: job.id.clone(),
            });
        }
        if inner.registered.contains_key(&job.id) {
            return Err(StoreError::NotQueued {
                id: job.id.clone(),
            });
        }
        Err(StoreError::JobNotFound {
            id: job.id.clone(),
        })
    }

    async fn mark_job_as_complete(&self, completion: JobCompletion) -> Result<CompletionRecord> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_open()?;

        let id = completion.job.id.clone();
        if inner.running.remove(&id).is_none() {
            return Err(StoreError::NotRunning { id });
        }
        let record = CompletionRecord::from_completion(completion, self.clock.now());
        inner.complete.insert(id.clone(), record.clone());
        debug!(job_id = %id, duration_ms = record.duration_ms, lag_ms = record.execution_lag_ms, "job completed");
        Ok(record)
    }

    async fn completion(&self, id: &JobId) -> Result<Option<CompletionRecord>> {
        let inner = self.inner.lock().unwrap();
        inner.ensure_open()?;
        Ok(inner.complete.get(id).cloned())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
        }
        let _ = self.closed_tx.send(true);
        self.queue_notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ScheduleRequest;
    use chime_core::{CallbackStatus, HashSharding, ManualClock, ScheduledAt, ShardSpace};
    use futures_util::StreamExt;

    fn store_at(iso: &str) -> (Arc<MemoryStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(iso.parse().unwrap()));
        let store = Arc::new(MemoryStore::new(
            clock.clone(),
            Arc::new(HashSharding::new(ShardSpace::new(1, 4))),
            100,
        ));
        (store, clock)
    }

    async fn schedule_due(store: &MemoryStore, clock: &ManualClock, id: &str) -> JobDefinition {
        let job_id = store
            .schedule(
                ScheduleRequest::at(ScheduledAt::now(clock)).with_id(JobId::new(id)),
            )
            .await
            .unwrap();
        store
            .get_jobs_scheduled_before(
                BacklogQuery {
                    offset: 0,
                    milliseconds_from_now: 0,
                    limit: 100,
                },
                None,
            )
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.id == job_id)
            .unwrap()
    }

    #[tokio::test]
    async fn rescheduling_a_live_id_is_rejected() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let request =
            ScheduleRequest::at(ScheduledAt::now(clock.as_ref())).with_id(JobId::new("dup"));
        store.schedule(request.clone()).await.unwrap();
        let err = store.schedule(request).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyScheduled { .. }));
    }

    #[tokio::test]
    async fn queueing_is_idempotent_once() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let job = schedule_due(&store, &clock, "j1").await;

        store.queue_jobs(&[job.clone()]).await.unwrap();
        let err = store.queue_jobs(&[job.clone()]).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyQueued { .. }));

        // The job is in the queue exactly once.
        let mut stream = store.wait_for_next_jobs_in_queue(10, None).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch.iter().filter(|j| j.id == job.id).count(), 1);
    }

    #[tokio::test]
    async fn concurrent_claims_admit_exactly_one_winner() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let job = schedule_due(&store, &clock, "contested").await;
        store.queue_jobs(&[job.clone()]).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let job = job.clone();
            handles.push(tokio::spawn(
                async move { store.mark_job_as_running(&job).await },
            ));
        }

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => winners += 1,
                Err(e) => assert!(e.is_claim_conflict(), "unexpected error: {e}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn claim_fails_outside_the_queue() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");

        // Never registered.
        let ghost = JobDefinition {
            id: JobId::new("ghost"),
            scheduled_at: clock.now(),
            args: serde_json::Value::Null,
            shards: vec![Shard(0)],
        };
        assert!(matches!(
            store.mark_job_as_running(&ghost).await.unwrap_err(),
            StoreError::JobNotFound { .. }
        ));

        // Registered but not queued.
        let job = schedule_due(&store, &clock, "early").await;
        assert!(matches!(
            store.mark_job_as_running(&job).await.unwrap_err(),
            StoreError::NotQueued { .. }
        ));

        // Already complete.
        store.queue_jobs(&[job.clone()]).await.unwrap();
        store.mark_job_as_running(&job).await.unwrap();
        store
            .mark_job_as_complete(JobCompletion {
                job: job.clone(),
                status: CallbackStatus::ok(200),
                execution_start: clock.now(),
                duration_ms: 5,
            })
            .await
            .unwrap();
        let err = store.mark_job_as_running(&job).await.unwrap_err();
        assert!(err.is_claim_conflict());
    }

    #[tokio::test]
    async fn backlog_query_is_bounded_and_ascending() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        // Register jobs at now-5m … now+5m in shuffled insertion order.
        for minutes in [3i64, -5, 0, -2, 5, -4, 1] {
            let at = ScheduledAt::from_datetime(clock.now() + Duration::minutes(minutes));
            store
                .schedule(
                    ScheduleRequest::at(at).with_id(JobId::new(format!("m{minutes}"))),
                )
                .await
                .unwrap();
        }

        let due = store
            .get_jobs_scheduled_before(
                BacklogQuery {
                    offset: 0,
                    milliseconds_from_now: 0,
                    limit: 3,
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(due.len(), 3);
        assert!(due.windows(2).all(|w| w[0].scheduled_at <= w[1].scheduled_at));
        // Only jobs at or before the cutoff qualify.
        assert!(due.iter().all(|j| j.scheduled_at <= clock.now()));
    }

    #[tokio::test]
    async fn cancel_policies_per_state() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");

        let registered = schedule_due(&store, &clock, "r").await;
        store.cancel(&registered.id).await.unwrap();
        assert!(matches!(
            store.cancel(&registered.id).await.unwrap_err(),
            StoreError::JobNotFound { .. }
        ));

        let queued = schedule_due(&store, &clock, "q").await;
        store.queue_jobs(&[queued.clone()]).await.unwrap();
        store.cancel(&queued.id).await.unwrap();

        let running = schedule_due(&store, &clock, "x").await;
        store.queue_jobs(&[running.clone()]).await.unwrap();
        store.mark_job_as_running(&running).await.unwrap();
        assert!(matches!(
            store.cancel(&running.id).await.unwrap_err(),
            StoreError::JobRunning { .. }
        ));
    }

    #[tokio::test]
    async fn close_rejects_pending_waits_and_later_operations() {
        let (store, _clock) = store_at("2026-03-01T12:00:00Z");
        let mut stream = store.wait_for_next_jobs_in_queue(5, None).await.unwrap();

        let waiter = tokio::spawn(async move { stream.next().await });
        // Give the waiter time to park on the empty queue.
        tokio::task::yield_now().await;
        store.close().await.unwrap();

        let item = waiter.await.unwrap().unwrap();
        assert!(matches!(item, Err(StoreError::Cancelled)));

        let err = store
            .schedule(ScheduleRequest::at(ScheduledAt::from_datetime(
                "2026-03-01T12:00:00Z".parse().unwrap(),
            )))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[tokio::test]
    async fn watch_replays_backlog_and_pushes_new_registrations() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let first = schedule_due(&store, &clock, "first").await;

        let mut stream = store.listen_to_newly_registered_jobs(None).await.unwrap();
        let replay = stream.next().await.unwrap().unwrap();
        assert!(replay.iter().any(|j| j.id == first.id));

        let second_id = store
            .schedule(
                ScheduleRequest::at(ScheduledAt::now(clock.as_ref()))
                    .with_id(JobId::new("second")),
            )
            .await
            .unwrap();
        let pushed = stream.next().await.unwrap().unwrap();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].id, second_id);
    }

    #[tokio::test]
    async fn watch_subscription_enforces_the_replay_bound() {
        let clock = Arc::new(ManualClock::new("2026-03-01T12:00:00Z".parse().unwrap()));
        let store = MemoryStore::new(
            clock.clone(),
            Arc::new(HashSharding::new(ShardSpace::new(1, 4))),
            2,
        );
        for i in 0..3 {
            store
                .schedule(
                    ScheduleRequest::at(ScheduledAt::now(clock.as_ref()))
                        .with_id(JobId::new(format!("backlog-{i}"))),
                )
                .await
                .unwrap();
        }
        let err = store
            .listen_to_newly_registered_jobs(None)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StoreError::TooManyPreviousJobs { count: 3, limit: 2 }
        ));
    }
}
