use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use chime_core::{Shard, ShardSpace};

use crate::coordination::CoordinationClient;
use crate::error::{ClusterError, Result};

/// In-process reference coordination service.
///
/// Members join under a stable node id and receive a deterministic slice of
/// the shard space: members are sorted by id and shard `i` belongs to
/// `members[i % n]`. Every join or leave rebalances and pushes the new
/// ownership set to each member's watch channel. Cheaply cloneable — clones
/// share the same registry.
#[derive(Clone)]
pub struct LocalCluster {
    registry: Arc<Mutex<Registry>>,
}

#[derive(Debug)]
struct Registry {
    space: ShardSpace,
    members: BTreeMap<String, watch::Sender<Vec<Shard>>>,
}

impl Registry {
    /// Recompute every member's slice and push the changes out.
    fn rebalance(&self) {
        let ids: Vec<&String> = self.members.keys().collect();
        if ids.is_empty() {
            return;
        }
        let mut slices: BTreeMap<&String, Vec<Shard>> =
            ids.iter().map(|id| (*id, Vec::new())).collect();
        for shard in self.space.all_shards() {
            let owner = ids[shard.0 as usize % ids.len()];
            slices.get_mut(owner).unwrap().push(shard);
        }
        for (id, tx) in &self.members {
            let slice = slices.remove(id).unwrap_or_default();
            // send_if_modified keeps quiet members quiet during churn that
            // does not affect their slice.
            tx.send_if_modified(|current| {
                if *current == slice {
                    false
                } else {
                    *current = slice;
                    true
                }
            });
        }
    }
}

impl LocalCluster {
    pub fn new(space: ShardSpace) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                space,
                members: BTreeMap::new(),
            })),
        }
    }

    /// Join the cluster under `node_id`, returning the node's session.
    pub fn join(&self, node_id: impl Into<String>) -> Result<LocalCoordinator> {
        let node_id = node_id.into();
        let mut registry = self.registry.lock().unwrap();
        if registry.members.contains_key(&node_id) {
            return Err(ClusterError::DuplicateNode { id: node_id });
        }
        let (tx, rx) = watch::channel(Vec::new());
        registry.members.insert(node_id.clone(), tx);
        registry.rebalance();
        info!(node = %node_id, members = registry.members.len(), "node joined cluster");

        Ok(LocalCoordinator {
            node_id,
            registry: Arc::clone(&self.registry),
            ownership: rx,
            closed: AtomicBool::new(false),
        })
    }

    /// Current number of live members.
    pub fn member_count(&self) -> usize {
        self.registry.lock().unwrap().members.len()
    }
}

/// One node's session with a [`LocalCluster`].
#[derive(Debug)]
pub struct LocalCoordinator {
    node_id: String,
    registry: Arc<Mutex<Registry>>,
    ownership: watch::Receiver<Vec<Shard>>,
    closed: AtomicBool,
}

impl LocalCoordinator {
    fn leave(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut registry = self.registry.lock().unwrap();
        registry.members.remove(&self.node_id);
        registry.rebalance();
        debug!(node = %self.node_id, "node left cluster");
    }
}

#[async_trait]
impl CoordinationClient for LocalCoordinator {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn owned_shards(&self) -> Vec<Shard> {
        if self.closed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.ownership.borrow().clone()
    }

    fn watch_ownership(&self) -> watch::Receiver<Vec<Shard>> {
        self.ownership.clone()
    }

    async fn close(&self) -> Result<()> {
        self.leave();
        Ok(())
    }
}

// Session release must not depend on the owner remembering to call close().
impl Drop for LocalCoordinator {
    fn drop(&mut self) {
        self.leave();
    }
}
