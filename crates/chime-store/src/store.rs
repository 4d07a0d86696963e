use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;

use chime_core::{CompletionRecord, JobCompletion, JobDefinition, JobId, ScheduledAt, Shard};

use crate::error::Result;

/// A live, possibly-infinite sequence of job batches.
pub type JobBatchStream = Pin<Box<dyn Stream<Item = Result<Vec<JobDefinition>>> + Send>>;

/// What a backend can natively do.
///
/// Capability tagging instead of probe-and-catch: callers branch on this
/// before choosing the watch or poll path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
    /// Backend pushes newly registered jobs; when false,
    /// `listen_to_newly_registered_jobs` fails with `WatchUnsupported` and
    /// consumers poll `get_jobs_scheduled_before` instead.
    pub watch_registered: bool,
}

/// Caller input to `schedule`.
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// Caller-supplied id; `None` lets the store mint one.
    pub id: Option<JobId>,
    pub scheduled_at: ScheduledAt,
    /// Opaque payload forwarded to the callback transport.
    pub args: serde_json::Value,
}

impl ScheduleRequest {
    pub fn at(scheduled_at: ScheduledAt) -> Self {
        Self {
            id: None,
            scheduled_at,
            args: serde_json::Value::Null,
        }
    }

    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }
}

/// Window query over not-yet-running jobs.
#[derive(Debug, Clone, Copy)]
pub struct BacklogQuery {
    /// Rows to skip, for paging through a large backlog.
    pub offset: usize,
    /// Look-ahead window relative to the store clock's now; `0` means "due
    /// right now or overdue".
    pub milliseconds_from_now: i64,
    /// Hard cap on returned rows.
    pub limit: usize,
}

/// Storage and queuing contract over job records.
///
/// Lifecycle is the job's storage location, not a caller-visible enum:
/// `registered → queued → running → complete`, with `cancel` valid from the
/// first two states only. The queued→running transition is the single
/// correctness-critical operation — see [`Datastore::mark_job_as_running`].
#[async_trait]
pub trait Datastore: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities;

    /// Create a new `registered` job and return its id.
    ///
    /// Applies the store's sharding algorithm; never partially creates a
    /// record. Re-scheduling a live id fails with `AlreadyScheduled`.
    async fn schedule(&self, request: ScheduleRequest) -> Result<JobId>;

    /// Remove a `registered` or `queued` job.
    ///
    /// Errors with `JobRunning` / `AlreadyComplete` on later states and
    /// `JobNotFound` on unknown ids (documented policy, tested per backend).
    async fn cancel(&self, id: &JobId) -> Result<()>;

    /// Subscribe to newly registered jobs for the given shards.
    ///
    /// The backend may replay jobs already seen at (re)subscription time —
    /// consumers must tolerate duplicates; `queue_jobs` being idempotent-once
    /// is the guard. Fails with `WatchUnsupported` on poll-only backends and
    /// with `TooManyPreviousJobs` when the replay backlog exceeds the safety
    /// bound (pre-filter with [`Datastore::get_jobs_scheduled_before`]).
    async fn listen_to_newly_registered_jobs(
        &self,
        shards: Option<&[Shard]>,
    ) -> Result<JobBatchStream>;

    /// Up to `limit` registered/queued jobs whose instant falls within
    /// `milliseconds_from_now`, ascending by scheduled instant.
    async fn get_jobs_scheduled_before(
        &self,
        query: BacklogQuery,
        shards: Option<&[Shard]>,
    ) -> Result<Vec<JobDefinition>>;

    /// Batches of queued jobs, up to `limit` per emission.
    ///
    /// May be a genuine blocking wait or a poll loop underneath — callers
    /// must not depend on which, and must treat the stream as
    /// order-insensitive: only the claim transaction decides ownership.
    async fn wait_for_next_jobs_in_queue(
        &self,
        limit: usize,
        shards: Option<&[Shard]>,
    ) -> Result<JobBatchStream>;

    /// Move jobs from `registered` to `queued`. Idempotent-once: a second
    /// call for an already-queued job fails with `AlreadyQueued`, guarding
    /// against duplicate enqueue from overlapping watch/poll signals.
    async fn queue_jobs(&self, jobs: &[JobDefinition]) -> Result<()>;

    /// Atomically transition `queued → running` — the mutual-exclusion
    /// primitive.
    ///
    /// One atomic storage transaction asserts the job is queued, removes it
    /// from the queue and creates the running record; a precondition failure
    /// surfaces as the expected `AlreadyTaken`. There is no lease or timeout
    /// on the running record: a worker that dies after claiming leaves the
    /// job `running` until reconciled out of band.
    async fn mark_job_as_running(&self, job: &JobDefinition) -> Result<()>;

    /// Atomically transition `running → complete`, recording callback
    /// status, duration and execution lag. Completion records are
    /// append-only; a completed job is never re-queued.
    async fn mark_job_as_complete(&self, completion: JobCompletion) -> Result<CompletionRecord>;

    /// Terminal record for a completed job, if any.
    async fn completion(&self, id: &JobId) -> Result<Option<CompletionRecord>>;

    /// Release all open watches and connections; pending waits reject with
    /// `Cancelled` and subsequent operations fail with `Closed`.
    async fn close(&self) -> Result<()>;
}
