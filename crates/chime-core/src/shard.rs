use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::job::JobId;

/// A partition identifier in the fixed virtual shard space.
///
/// The space is deliberately oversubscribed: there are far more shards than
/// worker nodes, and the coordination layer assigns each live node several
/// of them. Jobs never move between shards; nodes move between shard sets.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Shard(pub u16);

impl std::fmt::Display for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// The versioned virtual shard space.
///
/// `version` feeds the hash, so changing the shard `count` is a deliberate,
/// coordinated operation (bump the version everywhere at once) rather than an
/// accidental silent rebalance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSpace {
    pub version: u32,
    pub count: u16,
}

impl ShardSpace {
    pub fn new(version: u32, count: u16) -> Self {
        debug_assert!(count > 0, "shard space must have at least one shard");
        Self { version, count }
    }

    /// Every shard in the space, in order.
    pub fn all_shards(&self) -> Vec<Shard> {
        (0..self.count).map(Shard).collect()
    }
}

impl Default for ShardSpace {
    fn default() -> Self {
        Self {
            version: 1,
            count: 16,
        }
    }
}

/// Deterministic mapping from a job id to its shard set.
///
/// Implementations must be pure: the same id always maps to the same shards,
/// across restarts and across nodes, with no coordination.
pub trait ShardingAlgorithm: Send + Sync {
    fn space(&self) -> ShardSpace;

    fn shards_for(&self, id: &JobId) -> Vec<Shard>;
}

/// Reference algorithm: SHA-256 of `version || id`, first eight digest bytes
/// as a big-endian u64, modulo the shard count. Single-shard mapping.
#[derive(Debug, Clone, Copy)]
pub struct HashSharding {
    space: ShardSpace,
}

impl HashSharding {
    pub fn new(space: ShardSpace) -> Self {
        Self { space }
    }
}

impl Default for HashSharding {
    fn default() -> Self {
        Self::new(ShardSpace::default())
    }
}

impl ShardingAlgorithm for HashSharding {
    fn space(&self) -> ShardSpace {
        self.space
    }

    fn shards_for(&self, id: &JobId) -> Vec<Shard> {
        let mut hasher = Sha256::new();
        hasher.update(self.space.version.to_be_bytes());
        hasher.update(id.as_str().as_bytes());
        let digest = hasher.finalize();

        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let bucket = u64::from_be_bytes(prefix) % u64::from(self.space.count);
        vec![Shard(bucket as u16)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_is_deterministic() {
        let algo = HashSharding::new(ShardSpace::new(1, 32));
        let id = JobId::new("job-42");
        assert_eq!(algo.shards_for(&id), algo.shards_for(&id));
    }

    #[test]
    fn mapping_stays_within_the_space() {
        let algo = HashSharding::new(ShardSpace::new(1, 8));
        for i in 0..200 {
            let shards = algo.shards_for(&JobId::new(format!("job-{i}")));
            assert_eq!(shards.len(), 1);
            assert!(shards[0].0 < 8);
        }
    }

    #[test]
    fn distribution_is_roughly_uniform() {
        let algo = HashSharding::new(ShardSpace::new(1, 4));
        let mut counts = [0usize; 4];
        for i in 0..400 {
            let shard = algo.shards_for(&JobId::new(format!("job-{i}")))[0];
            counts[shard.0 as usize] += 1;
        }
        // 100 expected per bucket; allow a generous band.
        for count in counts {
            assert!((40..=180).contains(&count), "skewed distribution: {counts:?}");
        }
    }

    #[test]
    fn version_bump_remaps_on_purpose() {
        let v1 = HashSharding::new(ShardSpace::new(1, 64));
        let v2 = HashSharding::new(ShardSpace::new(2, 64));
        let moved = (0..200)
            .map(|i| JobId::new(format!("job-{i}")))
            .filter(|id| v1.shards_for(id) != v2.shards_for(id))
            .count();
        // Almost all ids should move when the version changes.
        assert!(moved > 150, "only {moved} ids remapped");
    }
}
