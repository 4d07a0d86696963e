use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::shard::Shard;

/// Opaque unique job identifier, stable for the job's lifetime.
///
/// Callers may bring their own id (any non-empty string) or let the system
/// mint one with [`JobId::generate`]. A JobId denotes exactly one job; the
/// stores reject a second `schedule` for a live id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh, time-sortable id (UUIDv7).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The unit the system operates on.
///
/// Created once by the scheduling caller, owned by the datastore for the rest
/// of its lifecycle; workers hold only a transient reference while executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: JobId,
    /// Resolved scheduling instant (UTC).
    pub scheduled_at: DateTime<Utc>,
    /// Opaque caller payload, forwarded untouched to the callback transport.
    pub args: serde_json::Value,
    /// Virtual shards this job maps to, fixed at schedule time.
    pub shards: Vec<Shard>,
}

impl JobDefinition {
    /// True when any of the job's shards is in `owned`.
    ///
    /// `None` means "no shard filter" — every job matches.
    pub fn in_shards(&self, owned: Option<&[Shard]>) -> bool {
        match owned {
            None => true,
            Some(set) => self.shards.iter().any(|s| set.contains(s)),
        }
    }
}

/// Outcome of one callback invocation.
///
/// Transport failures are encoded here (absent status + detail), never raised
/// as worker errors: a dead callback endpoint is a job outcome, not a crash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackStatus {
    /// HTTP status code, absent when no response was received.
    pub http_status: Option<u16>,
    /// Human-readable failure detail, absent on clean responses.
    pub detail: Option<String>,
}

impl CallbackStatus {
    pub fn ok(status: u16) -> Self {
        Self {
            http_status: Some(status),
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            http_status: None,
            detail: Some(detail.into()),
        }
    }

    /// True for a received 2xx response.
    pub fn is_success(&self) -> bool {
        self.http_status.is_some_and(|s| (200..300).contains(&s))
    }
}

/// Input to `mark_job_as_complete` — what the worker observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletion {
    pub job: JobDefinition,
    pub status: CallbackStatus,
    /// Instant the worker started executing, from the injected clock.
    pub execution_start: DateTime<Utc>,
    /// Wall-clock callback duration in milliseconds.
    pub duration_ms: i64,
}

/// Append-only terminal record of one executed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub job: JobDefinition,
    pub status: CallbackStatus,
    pub execution_start: DateTime<Utc>,
    pub duration_ms: i64,
    /// `execution_start − scheduled_at`, in milliseconds. Negative when a job
    /// ran ahead of its instant (possible under manual clocks).
    pub execution_lag_ms: i64,
    pub completed_at: DateTime<Utc>,
}

impl CompletionRecord {
    /// Build the terminal record, computing lag from the job's own window.
    pub fn from_completion(completion: JobCompletion, completed_at: DateTime<Utc>) -> Self {
        let lag = completion
            .execution_start
            .signed_duration_since(completion.job.scheduled_at)
            .num_milliseconds();
        Self {
            execution_lag_ms: lag,
            job: completion.job,
            status: completion.status,
            execution_start: completion.execution_start,
            duration_ms: completion.duration_ms,
            completed_at,
        }
    }
}
