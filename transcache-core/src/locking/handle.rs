//! RAII handle over an [`UpgradableRwLock`].

use std::sync::Arc;

use super::rwlock::UpgradableRwLock;

/// What a handle currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Unlocked,
    Read,
    Write,
}

/// Tracks one caller's hold on a region lock and moves it between modes.
///
/// Transitions are idempotent: asking for the mode already held does
/// nothing. The mode is only updated once a transition has completed, so a
/// cancelled transition never leaves the handle claiming something it does
/// not hold. Whatever is held is released on drop.
#[derive(Debug)]
pub struct ScopedLockHandle {
    lock: Arc<UpgradableRwLock>,
    mode: LockMode,
}

impl ScopedLockHandle {
    /// Creates an unlocked handle bound to `lock`.
    pub fn new(lock: Arc<UpgradableRwLock>) -> Self {
        Self {
            lock,
            mode: LockMode::Unlocked,
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn lock(&self) -> &Arc<UpgradableRwLock> {
        &self.lock
    }

    /// Makes sure a read lock is held, downgrading if currently writing.
    pub async fn ensure_read(&mut self) {
        match self.mode {
            LockMode::Read => {}
            LockMode::Write => {
                self.lock.downgrade_write_to_read();
                self.mode = LockMode::Read;
            }
            LockMode::Unlocked => {
                self.lock.acquire_read().await;
                self.mode = LockMode::Read;
            }
        }
    }

    /// Makes sure the write lock is held, upgrading if currently reading.
    ///
    /// An upgrade gives up the read before queueing for the write lock, so
    /// state observed under the read lock must be re-checked afterwards.
    pub async fn ensure_write(&mut self) {
        match self.mode {
            LockMode::Write => {}
            LockMode::Read => {
                let upgrade = self.lock.upgrade_read_to_write();
                self.mode = LockMode::Unlocked;
                upgrade.await;
                self.mode = LockMode::Write;
            }
            LockMode::Unlocked => {
                self.lock.acquire_write().await;
                self.mode = LockMode::Write;
            }
        }
    }

    /// Releases whatever is held. Safe to call repeatedly.
    pub fn release(&mut self) {
        match self.mode {
            LockMode::Unlocked => return,
            LockMode::Read => self.lock.release_read(),
            LockMode::Write => self.lock.release_write(),
        }
        self.mode = LockMode::Unlocked;
    }

    /// Moves the current hold into a new handle, leaving this one unlocked.
    pub fn take(&mut self) -> ScopedLockHandle {
        let mode = std::mem::replace(&mut self.mode, LockMode::Unlocked);
        ScopedLockHandle {
            lock: Arc::clone(&self.lock),
            mode,
        }
    }
}

impl Drop for ScopedLockHandle {
    fn drop(&mut self) {
        self.release();
    }
}
