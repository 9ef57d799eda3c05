//! Process-wide map from region to its lock.

use std::sync::Arc;

use dashmap::DashMap;

use super::handle::ScopedLockHandle;
use super::rwlock::UpgradableRwLock;
use crate::region::RegionKey;

/// Lazily creates one [`UpgradableRwLock`] per region.
///
/// Locks are never evicted. Removing an idle lock would race with a caller
/// that has just looked it up, and the key space is bounded by the regions
/// the store actually holds.
#[derive(Debug, Default)]
pub struct RegionLockRegistry {
    locks: DashMap<RegionKey, Arc<UpgradableRwLock>>,
}

impl RegionLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the lock for `region`, creating it on first access.
    ///
    /// Concurrent first accesses observe the same lock object.
    pub fn get_or_create(&self, region: &RegionKey) -> Arc<UpgradableRwLock> {
        if let Some(lock) = self.locks.get(region) {
            return Arc::clone(lock.value());
        }

        let entry = self
            .locks
            .entry(region.clone())
            .or_insert_with(|| {
                tracing::trace!(region = %region, "Creating region lock");
                Arc::new(UpgradableRwLock::new())
            });
        Arc::clone(entry.value())
    }

    /// Returns an unlocked handle on the region's lock.
    pub fn handle(&self, region: &RegionKey) -> ScopedLockHandle {
        ScopedLockHandle::new(self.get_or_create(region))
    }

    pub fn contains(&self, region: &RegionKey) -> bool {
        self.locks.contains_key(region)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
