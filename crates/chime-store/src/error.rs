use chime_core::JobId;
use thiserror::Error;

/// Errors surfaced by datastore backends.
///
/// The variants split into the taxonomy the workers rely on: expected
/// continue-loop signals ([`StoreError::AlreadyTaken`]), capability misses
/// ([`StoreError::WatchUnsupported`], [`StoreError::TooManyPreviousJobs`]),
/// and everything else, which propagates.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A live job already exists under this id; re-scheduling is rejected,
    /// never silently overwritten.
    #[error("Job already scheduled: {id}")]
    AlreadyScheduled { id: JobId },

    /// Second `queue_jobs` for the same job — queueing is idempotent-once.
    #[error("Job already queued: {id}")]
    AlreadyQueued { id: JobId },

    /// Claim conflict: another worker holds (or finished) this job. Expected
    /// under contention; claimants advance to the next candidate.
    #[error("Job already taken by another worker: {id}")]
    AlreadyTaken { id: JobId },

    /// The job is registered but was never queued.
    #[error("Job is not in the queue: {id}")]
    NotQueued { id: JobId },

    /// Completion was recorded for a job that is not running.
    #[error("Job is not running: {id}")]
    NotRunning { id: JobId },

    /// No job with the given id exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    /// Cancel was attempted on a running job. Policy: rejected — there is no
    /// post-completion cancellation pass.
    #[error("Job is currently running and cannot be cancelled: {id}")]
    JobRunning { id: JobId },

    /// Cancel was attempted on a job that already completed.
    #[error("Job already completed: {id}")]
    AlreadyComplete { id: JobId },

    /// This backend has no native change notification; callers fall back to
    /// the poll path.
    #[error("Backend does not support watch subscriptions")]
    WatchUnsupported,

    /// A cold watch subscription would replay more backlog than the safety
    /// bound allows; drain the backlog with `get_jobs_scheduled_before` first.
    #[error("Too many previous jobs to replay: {count} (limit {limit})")]
    TooManyPreviousJobs { count: usize, limit: usize },

    /// The store was closed; all subsequent operations fail.
    #[error("Store is closed")]
    Closed,

    /// A pending wait was aborted by `close()`.
    #[error("Wait cancelled by store shutdown")]
    Cancelled,

    /// A persisted record failed to decode — the store is damaged or was
    /// written by an incompatible version.
    #[error("Corrupt stored record: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True for the one error a claim loop is expected to swallow: the job
    /// went to another worker. Everything else propagates.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, StoreError::AlreadyTaken { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
