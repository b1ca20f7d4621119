//! Cluster map versions
//!
//! A version is an `(epoch, revision)` pair compared lexicographically. The
//! epoch changes on cluster-level discontinuities (failover, rebuild) and
//! always outranks any revision within an older epoch.
//!
//! Two fields cannot be read with one word-sized atomic, so shared versions
//! live in a `VersionCell` that reads and writes the pair under one lock.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// `(epoch, revision)` of a cluster map
///
/// Field order matters: the derived `Ord` compares `epoch` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ConfigVersion {
    pub epoch: u64,
    pub revision: u64,
}

impl ConfigVersion {
    pub const ZERO: ConfigVersion = ConfigVersion {
        epoch: 0,
        revision: 0,
    };

    pub const fn new(epoch: u64, revision: u64) -> Self {
        ConfigVersion { epoch, revision }
    }

    /// Whether `self` is strictly newer than `other`
    #[inline]
    pub fn is_newer_than(&self, other: &ConfigVersion) -> bool {
        self > other
    }
}

impl std::fmt::Display for ConfigVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.epoch, self.revision)
    }
}

/// Shared, tear-free holder of a `ConfigVersion`
#[derive(Debug, Default)]
pub struct VersionCell {
    inner: RwLock<ConfigVersion>,
}

impl VersionCell {
    pub fn new(version: ConfigVersion) -> Self {
        VersionCell {
            inner: RwLock::new(version),
        }
    }

    #[inline]
    pub fn load(&self) -> ConfigVersion {
        *self.inner.read()
    }

    pub fn store(&self, version: ConfigVersion) {
        *self.inner.write() = version;
    }

    /// Replace the stored version only if `candidate` is strictly newer
    ///
    /// Returns true if the cell was updated.
    pub fn advance_if_newer(&self, candidate: ConfigVersion) -> bool {
        let mut current = self.inner.write();
        if candidate > *current {
            *current = candidate;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::cmp::Ordering;
    use std::sync::Arc;

    #[test]
    fn test_epoch_dominates_revision() {
        assert!(ConfigVersion::new(1, 0) > ConfigVersion::new(0, 999));
        assert!(ConfigVersion::new(2, 5) < ConfigVersion::new(3, 1));
        assert!(ConfigVersion::new(2, 5) > ConfigVersion::new(2, 4));
    }

    #[test]
    fn test_total_order() {
        for seed in 0..20u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for _ in 0..200 {
                let a = ConfigVersion::new(rng.gen_range(0..4), rng.gen_range(0..4));
                let b = ConfigVersion::new(rng.gen_range(0..4), rng.gen_range(0..4));

                // INVARIANT: exactly one of <, ==, > holds
                let holds = [a < b, a == b, a > b];
                assert_eq!(holds.iter().filter(|h| **h).count(), 1, "{} vs {}", a, b);

                let expected = a.epoch.cmp(&b.epoch).then(a.revision.cmp(&b.revision));
                assert_eq!(a.cmp(&b), expected);
                if a.epoch != b.epoch {
                    assert_ne!(a.cmp(&b), Ordering::Equal);
                }
            }
        }
    }

    #[test]
    fn test_advance_if_newer() {
        let cell = VersionCell::new(ConfigVersion::new(1, 10));
        assert!(!cell.advance_if_newer(ConfigVersion::new(1, 10)));
        assert!(!cell.advance_if_newer(ConfigVersion::new(0, 50)));
        assert!(cell.advance_if_newer(ConfigVersion::new(1, 11)));
        assert_eq!(cell.load(), ConfigVersion::new(1, 11));
    }

    #[test]
    fn test_concurrent_writers_never_tear() {
        let cell = Arc::new(VersionCell::default());
        let writers: Vec<_> = (1..=4u64)
            .map(|w| {
                let cell = cell.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        // epoch and revision always written as a matched pair
                        cell.store(ConfigVersion::new(w * 1_000_000 + i, w * 1_000_000 + i));
                    }
                })
            })
            .collect();

        for _ in 0..10_000 {
            let v = cell.load();
            assert_eq!(v.epoch, v.revision, "torn read: {}", v);
        }
        for w in writers {
            w.join().unwrap();
        }
    }
}
