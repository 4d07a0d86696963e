use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// Shuffles claim candidates before the claim attempts.
///
/// Workers racing on the same watch/poll snapshot would otherwise all try the
/// same ordinal candidate first, maximizing claim collisions; a per-worker
/// shuffle spreads the contention. The source is pluggable so tests can pin
/// the order.
pub struct Shuffler {
    rng: Mutex<StdRng>,
}

impl Shuffler {
    /// OS-entropy seed — production default.
    pub fn entropy() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fixed seed for deterministic tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn shuffle<T>(&self, items: &mut [T]) {
        items.shuffle(&mut *self.rng.lock().unwrap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_shuffle_is_reproducible() {
        let a = Shuffler::seeded(7);
        let b = Shuffler::seeded(7);
        let mut xs: Vec<u32> = (0..16).collect();
        let mut ys: Vec<u32> = (0..16).collect();
        a.shuffle(&mut xs);
        b.shuffle(&mut ys);
        assert_eq!(xs, ys);
    }

    #[test]
    fn shuffle_permutes_not_mutates() {
        let shuffler = Shuffler::seeded(1);
        let mut xs: Vec<u32> = (0..16).collect();
        shuffler.shuffle(&mut xs);
        let mut sorted = xs.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..16).collect::<Vec<_>>());
    }
}
