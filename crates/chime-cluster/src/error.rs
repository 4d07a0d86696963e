use thiserror::Error;

/// Errors raised by the coordination layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A node with this id is already a member of the cluster namespace.
    #[error("Node already joined: {id}")]
    DuplicateNode { id: String },

    /// The session was closed; ownership queries and waits now fail.
    #[error("Coordination session is closed")]
    Closed,

    /// Building the shard-scoped consumer for a new ownership set failed.
    #[error("Consumer build failed: {0}")]
    ConsumerBuild(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
