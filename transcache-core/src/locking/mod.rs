//! Region locking: the upgradable lock, its RAII handle, and the registry.

pub mod handle;
pub mod registry;
pub mod rwlock;

pub use handle::{LockMode, ScopedLockHandle};
pub use registry::RegionLockRegistry;
pub use rwlock::{LockSnapshot, UpgradableRwLock};
