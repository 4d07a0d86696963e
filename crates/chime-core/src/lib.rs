//! `chime-core` — leaf value types shared by every Chime crate.
//!
//! # Overview
//!
//! Chime schedules caller-defined callback jobs across a horizontally
//! partitioned cluster of worker processes. This crate holds the vocabulary
//! the other crates speak:
//!
//! | Type | Role |
//! |------|------|
//! | [`JobId`] / [`JobDefinition`] | The unit the system operates on |
//! | [`ScheduledAt`] | Validated instant, resolvable from a small expression grammar |
//! | [`Shard`] / [`ShardingAlgorithm`] | Deterministic partitioning of the job id space |
//! | [`Clock`] | Injected time source — wall clock in production, manual in tests |
//! | [`ChimeConfig`] | TOML + env configuration for a node |

pub mod clock;
pub mod config;
pub mod error;
pub mod job;
pub mod scheduled_at;
pub mod shard;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ChimeConfig;
pub use error::{CoreError, Result};
pub use job::{CallbackStatus, CompletionRecord, JobCompletion, JobDefinition, JobId};
pub use scheduled_at::ScheduledAt;
pub use shard::{HashSharding, Shard, ShardSpace, ShardingAlgorithm};
