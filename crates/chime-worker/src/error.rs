use thiserror::Error;

use chime_store::StoreError;

/// Errors surfaced by the worker-side engine.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// `run()` was called while the processor is already running.
    #[error("Processor already running")]
    AlreadyRunning,

    /// The processor reached its terminal state; there is no restart.
    #[error("Processor is closed")]
    Closed,

    /// Building the HTTP callback client failed.
    #[error("Transport setup failed: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
