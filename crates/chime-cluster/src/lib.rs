//! `chime-cluster` — cluster membership and shard-ownership plumbing.
//!
//! # Overview
//!
//! The virtual shard space is oversubscribed: far more shards than nodes.
//! A [`CoordinationClient`] session tells a node which shards it currently
//! owns and notifies it on membership churn; [`ClusterTopologyAware`] binds a
//! shard-scoped consumer (a processor, an intake pump) to such a session,
//! tearing the consumer down and rebuilding it on every ownership change so
//! that each shard has at most one active subscription per node at any
//! instant.
//!
//! [`LocalCluster`] is the in-process reference coordination service used by
//! tests and single-process deployments; production backends implement the
//! same trait on top of a real consensus/membership service.

pub mod coordination;
pub mod error;
pub mod local;
pub mod topology;

pub use coordination::CoordinationClient;
pub use error::{ClusterError, Result};
pub use local::{LocalCluster, LocalCoordinator};
pub use topology::{ClusterTopologyAware, ShardConsumer};
