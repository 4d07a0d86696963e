use async_trait::async_trait;
use tokio::sync::watch;

use chime_core::Shard;

use crate::error::Result;

/// A node's membership session in the cluster-wide coordination namespace.
///
/// The session exposes the shard set this node currently owns — derived from
/// a deterministic partition of the virtual shard space across live members —
/// and a change feed fired on membership churn. Ownership is mutated solely
/// by the coordination service's own election mechanism; processors and
/// stores never write to it.
///
/// The session is a scoped resource: acquired on join, released on `close()`.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// This node's stable identifier within the namespace.
    fn node_id(&self) -> &str;

    /// The shard set currently owned by this node.
    fn owned_shards(&self) -> Vec<Shard>;

    /// Change feed: the receiver holds the latest owned shard set and wakes
    /// on every rebalance.
    fn watch_ownership(&self) -> watch::Receiver<Vec<Shard>>;

    /// Leave the namespace, triggering a rebalance among the remaining
    /// members. Idempotent.
    async fn close(&self) -> Result<()>;
}
