use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::Connection;
use tokio::sync::watch;
use tracing::debug;

use chime_core::{
    CallbackStatus, Clock, CompletionRecord, JobCompletion, JobDefinition, JobId, Shard,
    ShardingAlgorithm,
};

use crate::db::init_db;
use crate::error::{Result, StoreError};
use crate::store::{BacklogQuery, Datastore, JobBatchStream, ScheduleRequest, StoreCapabilities};

/// Poll-only SQLite backend.
///
/// One connection behind a `Mutex`; the claim transaction is a single
/// conditional UPDATE, so SQLite's row-level atomicity is the only mutual
/// exclusion needed. There is no native change notification: watch
/// subscriptions fail with `WatchUnsupported` and the queue wait is a poll
/// loop underneath.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    closed_tx: watch::Sender<bool>,
    clock: Arc<dyn Clock>,
    sharding: Arc<dyn ShardingAlgorithm>,
    poll_interval: StdDuration,
}

impl SqliteStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(
        conn: Connection,
        clock: Arc<dyn Clock>,
        sharding: Arc<dyn ShardingAlgorithm>,
        poll_interval: StdDuration,
    ) -> Result<Self> {
        init_db(&conn)?;
        let (closed_tx, _) = watch::channel(false);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            closed_tx,
            clock,
            sharding,
            poll_interval,
        })
    }

    /// Open (creating if needed) the database file at `path`.
    pub fn open(
        path: &str,
        clock: Arc<dyn Clock>,
        sharding: Arc<dyn ShardingAlgorithm>,
        poll_interval: StdDuration,
    ) -> Result<Self> {
        Self::new(Connection::open(path)?, clock, sharding, poll_interval)
    }

    /// Private in-memory database, for tests and ephemeral runs.
    pub fn open_in_memory(
        clock: Arc<dyn Clock>,
        sharding: Arc<dyn ShardingAlgorithm>,
        poll_interval: StdDuration,
    ) -> Result<Self> {
        Self::new(Connection::open_in_memory()?, clock, sharding, poll_interval)
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed_tx.borrow() {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// The job's lifecycle location, or `None` when the id is unknown.
    fn state_of(conn: &Connection, id: &JobId) -> Result<Option<String>> {
        let state = conn
            .query_row(
                "SELECT state FROM jobs WHERE id = ?1",
                [id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Database(other)),
            })?;
        if state.is_some() {
            return Ok(state);
        }
        let completed: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM completions WHERE job_id = ?1)",
            [id.as_str()],
            |row| row.get(0),
        )?;
        Ok(completed.then(|| "complete".to_string()))
    }
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobDefinition> {
    let id: String = row.get(0)?;
    let scheduled_at: String = row.get(1)?;
    let args: String = row.get(2)?;
    let shards: String = row.get(3)?;

    let text_err = |idx, e: Box<dyn std::error::Error + Send + Sync>| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e)
    };
    Ok(JobDefinition {
        id: JobId::new(id),
        scheduled_at: DateTime::parse_from_rfc3339(&scheduled_at)
            .map_err(|e| text_err(1, Box::new(e)))?
            .with_timezone(&Utc),
        args: serde_json::from_str(&args).map_err(|e| text_err(2, Box::new(e)))?,
        shards: serde_json::from_str(&shards).map_err(|e| text_err(3, Box::new(e)))?,
    })
}

const JOB_COLUMNS: &str = "id, scheduled_at, args, shards";

/// Fixed-width RFC 3339 (millisecond precision, `Z` suffix) so the TEXT
/// column compares lexicographically in chronological order.
fn encode_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl Datastore for SqliteStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities {
            watch_registered: false,
        }
    }

    async fn schedule(&self, request: ScheduleRequest) -> Result<JobId> {
        self.ensure_open()?;
        let id = request.id.unwrap_or_else(JobId::generate);
        let shards = self.sharding.shards_for(&id);

        let conn = self.conn.lock().unwrap();
        if Self::state_of(&conn, &id)?.is_some() {
            return Err(StoreError::AlreadyScheduled { id });
        }
        conn.execute(
            "INSERT INTO jobs (id, scheduled_at, args, shards, state, created_at)
             VALUES (?1, ?2, ?3, ?4, 'registered', ?5)",
            rusqlite::params![
                id.as_str(),
                encode_instant(request.scheduled_at.instant()),
                serde_json::to_string(&request.args)?,
                serde_json::to_string(&shards)?,
                self.clock.now().to_rfc3339(),
            ],
        )?;
        debug!(job_id = %id, "job registered");
        Ok(id)
    }

    async fn cancel(&self, id: &JobId) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            "DELETE FROM jobs WHERE id = ?1 AND state IN ('registered', 'queued')",
            [id.as_str()],
        )?;
        if removed > 0 {
            debug!(job_id = %id, "job cancelled");
            return Ok(());
        }
        match Self::state_of(&conn, id)?.as_deref() {
            Some("running") => Err(StoreError::JobRunning { id: id.clone() }),
            Some("complete") => Err(StoreError::AlreadyComplete { id: id.clone() }),
            _ => Err(StoreError::JobNotFound { id: id.clone() }),
        }
    }

    async fn listen_to_newly_registered_jobs(
        &self,
        _shards: Option<&[Shard]>,
    ) -> Result<JobBatchStream> {
        Err(StoreError::WatchUnsupported)
    }

    async fn get_jobs_scheduled_before(
        &self,
        query: BacklogQuery,
        shards: Option<&[Shard]>,
    ) -> Result<Vec<JobDefinition>> {
        self.ensure_open()?;
        let cutoff = self.clock.now() + Duration::milliseconds(query.milliseconds_from_now);

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE state IN ('registered', 'queued') AND scheduled_at <= ?1
             ORDER BY scheduled_at, id"
        ))?;
        let rows: Vec<JobDefinition> = stmt
            .query_map([encode_instant(cutoff)], row_to_job)?
            .collect::<rusqlite::Result<_>>()?;

        // Shard filtering happens here rather than in SQL — the shard list is
        // an encoded JSON column.
        Ok(rows
            .into_iter()
            .filter(|j| j.in_shards(shards))
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn wait_for_next_jobs_in_queue(
        &self,
        limit: usize,
        shards: Option<&[Shard]>,
    ) -> Result<JobBatchStream> {
        self.ensure_open()?;
        let conn = Arc::clone(&self.conn);
        let mut closed_rx = self.closed_tx.subscribe();
        let poll_interval = self.poll_interval;
        let filter: Option<Vec<Shard>> = shards.map(<[Shard]>::to_vec);

        let stream = stream! {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = closed_rx.changed() => {}
                }
                if *closed_rx.borrow() {
                    yield Err(StoreError::Cancelled);
                    break;
                }

                let batch: Result<Vec<JobDefinition>> = (|| {
                    let conn = conn.lock().unwrap();
                    let mut stmt = conn.prepare_cached(&format!(
                        "SELECT {JOB_COLUMNS} FROM jobs
                         WHERE state = 'queued'
                         ORDER BY scheduled_at, id"
                    ))?;
                    let rows: Vec<JobDefinition> = stmt
                        .query_map([], row_to_job)?
                        .collect::<rusqlite::Result<_>>()?;
                    Ok(rows
                        .into_iter()
                        .filter(|j| j.in_shards(filter.as_deref()))
                        .take(limit)
                        .collect())
                })();
                match batch {
                    Ok(batch) if batch.is_empty() => {}
                    Ok(batch) => yield Ok(batch),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn queue_jobs(&self, jobs: &[JobDefinition]) -> Result<()> {
        self.ensure_open()?;
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for job in jobs {
            let moved = tx.execute(
                "UPDATE jobs SET state = 'queued' WHERE id = ?1 AND state = 'registered'",
                [job.id.as_str()],
            )?;
            if moved == 0 {
                let err = match Self::state_of(&tx, &job.id)?.as_deref() {
                    Some("queued") | Some("running") | Some("complete") => {
                        StoreError::AlreadyQueued {
                            id: job.id.clone(),
                        }
                    }
                    _ => StoreError::JobNotFound {
                        id: job.id.clone(),
                    },
                };
                // Roll the whole batch back — queue_jobs is all or nothing.
                tx.rollback()?;
                return Err(err);
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn mark_job_as_running(&self, job: &JobDefinition) -> Result<()> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        // The atomic claim: assert-and-transition in one statement. Zero rows
        // changed means the precondition failed and we classify why.
        let claimed = conn.execute(
            "UPDATE jobs SET state = 'running' WHERE id = ?1 AND state = 'queued'",
            [job.id.as_str()],
        )?;
        if claimed > 0 {
            return Ok(());
        }
        match Self::state_of(&conn, &job.id)?.as_deref() {
            Some("running") | Some("complete") => Err(StoreError::AlreadyTaken {
                id: job.id.clone(),
            }),
            Some("registered") => Err(StoreError::NotQueued {
                id: job.id.clone(),
            }),
            _ => Err(StoreError::JobNotFound {
                id: job.id.clone(),
            }),
        }
    }

    async fn mark_job_as_complete(&self, completion: JobCompletion) -> Result<CompletionRecord> {
        self.ensure_open()?;
        let record = CompletionRecord::from_completion(completion, self.clock.now());
        let id = record.job.id.clone();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM jobs WHERE id = ?1 AND state = 'running'",
            [id.as_str()],
        )?;
        if removed == 0 {
            tx.rollback()?;
            return Err(StoreError::NotRunning { id });
        }
        tx.execute(
            "INSERT INTO completions
             (job_id, job, http_status, detail, execution_start,
              duration_ms, execution_lag_ms, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                id.as_str(),
                serde_json::to_string(&record.job)?,
                record.status.http_status,
                record.status.detail,
                record.execution_start.to_rfc3339(),
                record.duration_ms,
                record.execution_lag_ms,
                record.completed_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        debug!(job_id = %id, duration_ms = record.duration_ms, "job completed");
        Ok(record)
    }

    async fn completion(&self, id: &JobId) -> Result<Option<CompletionRecord>> {
        self.ensure_open()?;
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT job, http_status, detail, execution_start,
                        duration_ms, execution_lag_ms, completed_at
                 FROM completions WHERE job_id = ?1",
                [id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<u16>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StoreError::Database(other)),
            })?;

        let Some((job, http_status, detail, start, duration_ms, lag_ms, completed_at)) = row
        else {
            return Ok(None);
        };
        Ok(Some(CompletionRecord {
            job: serde_json::from_str(&job)?,
            status: CallbackStatus {
                http_status,
                detail,
            },
            execution_start: DateTime::parse_from_rfc3339(&start)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?
                .with_timezone(&Utc),
            duration_ms,
            execution_lag_ms: lag_ms,
            completed_at: DateTime::parse_from_rfc3339(&completed_at)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?
                .with_timezone(&Utc),
        }))
    }

    async fn close(&self) -> Result<()> {
        let _ = self.closed_tx.send(true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ScheduleRequest;
    use chime_core::{HashSharding, ManualClock, ScheduledAt, ShardSpace};
    use futures_util::StreamExt;

    fn store_at(iso: &str) -> (Arc<SqliteStore>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(iso.parse().unwrap()));
        let store = SqliteStore::new(
            Connection::open_in_memory().unwrap(),
            clock.clone(),
            Arc::new(HashSharding::new(ShardSpace::new(1, 4))),
            StdDuration::from_millis(20),
        )
        .unwrap();
        (Arc::new(store), clock)
    }

    async fn schedule_due(store: &SqliteStore, clock: &ManualClock, id: &str) -> JobDefinition {
        store
            .schedule(ScheduleRequest::at(ScheduledAt::now(clock)).with_id(JobId::new(id)))
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
            .find(|j| j.id.as_str() == id)
            .unwrap()
    }

    #[tokio::test]
    async fn watch_capability_is_absent() {
        let (store, _clock) = store_at("2026-03-01T12:00:00Z");
        assert!(!store.capabilities().watch_registered);
        let err = store
            .listen_to_newly_registered_jobs(None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::WatchUnsupported));
    }

    #[tokio::test]
    async fn rescheduling_a_live_id_is_rejected() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        schedule_due(&store, &clock, "dup").await;
        let err = store
            .schedule(
                ScheduleRequest::at(ScheduledAt::now(clock.as_ref())).with_id(JobId::new("dup")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyScheduled { .. }));
    }

    #[tokio::test]
    async fn queueing_is_idempotent_once() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let job = schedule_due(&store, &clock, "j1").await;
        store.queue_jobs(&[job.clone()]).await.unwrap();
        let err = store.queue_jobs(&[job]).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyQueued { .. }));
    }

    #[tokio::test]
    async fn partial_queue_batches_roll_back() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let a = schedule_due(&store, &clock, "a").await;
        let b = schedule_due(&store, &clock, "b").await;
        store.queue_jobs(&[b.clone()]).await.unwrap();

        // Batch containing one fresh and one already-queued job fails whole.
        let err = store.queue_jobs(&[a.clone(), b]).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyQueued { .. }));
        // `a` must still be claimable only after a clean queue_jobs.
        assert!(matches!(
            store.mark_job_as_running(&a).await.unwrap_err(),
            StoreError::NotQueued { .. }
        ));
        store.queue_jobs(&[a.clone()]).await.unwrap();
        store.mark_job_as_running(&a).await.unwrap();
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
    async fn completion_round_trip() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let job = schedule_due(&store, &clock, "done").await;
        store.queue_jobs(&[job.clone()]).await.unwrap();
        store.mark_job_as_running(&job).await.unwrap();

        let start = clock.now();
        let record = store
            .mark_job_as_complete(JobCompletion {
                job: job.clone(),
                status: CallbackStatus::ok(200),
                execution_start: start,
                duration_ms: 42,
            })
            .await
            .unwrap();
        assert_eq!(record.execution_lag_ms, 0);

        let loaded = store.completion(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.job.id, job.id);
        assert_eq!(loaded.status, CallbackStatus::ok(200));
        assert_eq!(loaded.duration_ms, 42);

        // The terminal state is sticky: no re-claim, no re-queue.
        assert!(store
            .mark_job_as_running(&job)
            .await
            .unwrap_err()
            .is_claim_conflict());
        assert!(matches!(
            store.queue_jobs(&[job]).await.unwrap_err(),
            StoreError::AlreadyQueued { .. }
        ));
    }

    #[tokio::test]
    async fn cancel_rejects_running_and_complete() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let job = schedule_due(&store, &clock, "c").await;
        store.queue_jobs(&[job.clone()]).await.unwrap();
        store.mark_job_as_running(&job).await.unwrap();
        assert!(matches!(
            store.cancel(&job.id).await.unwrap_err(),
            StoreError::JobRunning { .. }
        ));

        store
            .mark_job_as_complete(JobCompletion {
                job: job.clone(),
                status: CallbackStatus::ok(204),
                execution_start: clock.now(),
                duration_ms: 1,
            })
            .await
            .unwrap();
        assert!(matches!(
            store.cancel(&job.id).await.unwrap_err(),
            StoreError::AlreadyComplete { .. }
        ));
    }

    #[tokio::test]
    async fn queue_poll_stream_delivers_and_close_cancels() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let job = schedule_due(&store, &clock, "polled").await;
        store.queue_jobs(&[job.clone()]).await.unwrap();

        let mut stream = store.wait_for_next_jobs_in_queue(5, None).await.unwrap();
        let batch = stream.next().await.unwrap().unwrap();
        assert_eq!(batch[0].id, job.id);

        store.close().await.unwrap();
        let item = stream.next().await.unwrap();
        assert!(matches!(item, Err(StoreError::Cancelled)));
        assert!(matches!(
            store.cancel(&job.id).await.unwrap_err(),
            StoreError::Closed
        ));
    }

    #[tokio::test]
    async fn backlog_respects_shard_filter() {
        let (store, clock) = store_at("2026-03-01T12:00:00Z");
        let jobs: Vec<JobDefinition> = {
            let mut all = Vec::new();
            for i in 0..20 {
                all.push(schedule_due(&store, &clock, &format!("s{i}")).await);
            }
            all
        };
        let shard = jobs[0].shards[0];
        let filtered = store
            .get_jobs_scheduled_before(
                BacklogQuery {
                    offset: 0,
                    milliseconds_from_now: 0,
                    limit: 100,
                },
                Some(&[shard]),
            )
            .await
            .unwrap();
        assert!(!filtered.is_empty());
        assert!(filtered.iter().all(|j| j.shards.contains(&shard)));
        assert!(filtered.len() < jobs.len());
    }
}
