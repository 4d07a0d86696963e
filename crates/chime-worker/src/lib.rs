//! `chime-worker` — the claim–execute–complete engine.
//!
//! # Overview
//!
//! A [`Processor`] waits on the store's queued-job stream for its shard set,
//! shuffles each candidate batch to spread claim contention, claims with the
//! store's atomic queued→running transition, fires the callback transport,
//! and records completion. One job at a time per processor; throughput
//! scales by running more processors on disjoint shard sets, never by
//! sharing a shard set.
//!
//! The [`Intake`] pump feeds the queue: it drains the due backlog and then
//! either follows the store's registration watch or polls, moving jobs to
//! `queued` as their instant arrives.

pub mod error;
pub mod intake;
pub mod processor;
pub mod shuffle;
pub mod transport;

pub use error::{Result, WorkerError};
pub use intake::Intake;
pub use processor::Processor;
pub use shuffle::Shuffler;
pub use transport::{CallbackTransport, HttpCallbackTransport};
