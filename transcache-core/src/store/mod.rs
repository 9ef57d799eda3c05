//! Region-namespaced artifact store with two-phase writes.
//!
//! Writes go through reserve → populate → commit or rollback. A reserved
//! blob is invisible to `exists` and `read` until committed, and is never
//! subject to expiration. Callers serialize all mutation of a region behind
//! the region's write lock; the store only guards its own bookkeeping.

pub mod file;
pub mod policy;

use std::path::PathBuf;

use async_trait::async_trait;

pub use file::FileArtifactStore;
pub use policy::{ExpirationPolicy, PolicyRecord};

use crate::region::{ArtifactKey, RegionKey};

/// Errors that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No committed artifact {key} in region {region}")]
    NotFound { region: RegionKey, key: ArtifactKey },

    #[error("Invalid artifact key: {key:?}")]
    InvalidKey { key: String },

    #[error("Artifact {key} in region {region} is already reserved or committed")]
    ReservationConflict { region: RegionKey, key: ArtifactKey },

    #[error("No live reservation for {key} in region {region}")]
    NoReservation { region: RegionKey, key: ArtifactKey },

    #[error("Store corruption at {region}/{key}: {reason}")]
    Corruption {
        region: RegionKey,
        key: ArtifactKey,
        reason: String,
    },

    #[error("Policy record error: {reason}")]
    Policy { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Location of a reserved or committed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobHandle {
    pub region: RegionKey,
    pub key: ArtifactKey,
    pub path: PathBuf,
}

/// Outcome of sweeping one region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Committed entries evaluated
    pub examined: usize,
    /// Committed entries removed because the predicate said so
    pub expired: usize,
    /// Unreferenced blobs and temp files removed
    pub orphans: usize,
    /// Committed entries kept
    pub retained: usize,
}

impl SweepReport {
    pub fn removed(&self) -> usize {
        self.expired + self.orphans
    }
}

/// Predicate deciding whether a committed entry is expired.
pub type ExpiryPredicate<'a> = &'a (dyn Fn(&PolicyRecord) -> bool + Send + Sync);

/// Persistent keyed blob storage namespaced by region.
///
/// The backend is swappable; the orchestrator and sweeper only see this
/// trait.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Whether a committed entry exists.
    async fn exists(&self, region: &RegionKey, key: &ArtifactKey) -> Result<bool, StoreError>;

    /// Allocates a writable location that stays invisible until committed.
    ///
    /// # Errors
    /// - `StoreError::ReservationConflict` - Key already reserved or committed
    /// - `StoreError::Io` - Region namespace could not be created
    async fn begin_reserve(
        &self,
        region: &RegionKey,
        key: &ArtifactKey,
    ) -> Result<BlobHandle, StoreError>;

    /// Makes a reserved blob visible under `policy`.
    ///
    /// # Errors
    /// - `StoreError::NoReservation` - Nothing reserved for this key
    /// - `StoreError::Corruption` - Blob missing or policy could not be persisted
    async fn commit(
        &self,
        region: &RegionKey,
        key: &ArtifactKey,
        policy: ExpirationPolicy,
    ) -> Result<BlobHandle, StoreError>;

    /// Discards a reservation and any partial blob.
    ///
    /// # Errors
    /// - `StoreError::NoReservation` - Nothing reserved for this key
    /// - `StoreError::Corruption` - Partial files could not be removed
    async fn rollback(&self, region: &RegionKey, key: &ArtifactKey) -> Result<(), StoreError>;

    /// Looks up a committed entry, refreshing sliding expiration.
    ///
    /// # Errors
    /// - `StoreError::NotFound` - No committed entry
    async fn read(&self, region: &RegionKey, key: &ArtifactKey) -> Result<BlobHandle, StoreError>;

    /// Removes a committed entry. Returns whether anything was removed.
    async fn delete(&self, region: &RegionKey, key: &ArtifactKey) -> Result<bool, StoreError>;

    /// Removes committed entries for which `expired` returns true, plus
    /// orphaned blobs left behind by crashed or corrupted writes.
    async fn sweep(
        &self,
        region: &RegionKey,
        expired: ExpiryPredicate<'_>,
    ) -> Result<SweepReport, StoreError>;

    /// Regions currently holding any data.
    async fn regions(&self) -> Result<Vec<RegionKey>, StoreError>;
}
