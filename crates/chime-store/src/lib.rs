//! `chime-store` — the datastore contract and its reference backends.
//!
//! # Overview
//!
//! Job records move through four logical collections —
//! `registered → queued → running → complete` — owned entirely by the store.
//! The [`Datastore`] trait splits "watch new registrations" from "poll older
//! backlog" so watch-capable and poll-only backends share one interface;
//! callers check [`StoreCapabilities`] and drain the backlog with
//! [`Datastore::get_jobs_scheduled_before`] before opening a watch, which
//! bounds cold-start replay.
//!
//! The queued→running transition ([`Datastore::mark_job_as_running`]) is the
//! single correctness-critical operation: one atomic storage transaction per
//! claim, no application-level locks.
//!
//! # Backends
//!
//! | Backend | Watch | Queue wait |
//! |---------|-------|-----------|
//! | [`MemoryStore`] | yes (broadcast + replay) | genuine blocking wait |
//! | [`SqliteStore`] | no (`WatchUnsupported`) | poll loop |

pub mod db;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{BacklogQuery, Datastore, JobBatchStream, ScheduleRequest, StoreCapabilities};
