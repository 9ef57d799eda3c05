//! Filesystem store: one directory per region, one sidecar per blob.
//!
//! ```text
//! <root>/
//!   .staging/                 fetched sources awaiting conversion
//!   <region>/
//!     <key>                   blob
//!     <key>.policy            JSON PolicyRecord; present only once committed
//!     .tmp-<uuid>             sidecar being written
//! ```

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::fs;
use uuid::Uuid;

use super::{
    ArtifactStore, BlobHandle, ExpirationPolicy, ExpiryPredicate, PolicyRecord, StoreError,
    SweepReport,
};
use crate::region::{ArtifactKey, RegionKey};

const STAGING_DIR: &str = ".staging";
const TEMP_PREFIX: &str = ".tmp-";

/// Directory-per-region [`ArtifactStore`].
///
/// Live reservations are tracked in memory so the orphan sweep can tell an
/// in-progress write from a blob abandoned by a crashed process.
#[derive(Debug)]
pub struct FileArtifactStore {
    root: PathBuf,
    orphan_grace: Duration,
    reservations: Mutex<HashSet<(RegionKey, ArtifactKey)>>,
}

impl FileArtifactStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// Unreferenced blobs younger than `orphan_grace` survive sweeps.
    pub async fn open(root: impl Into<PathBuf>, orphan_grace: Duration) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR)).await?;

        tracing::debug!(root = %root.display(), "Opened artifact store");
        Ok(Self {
            root,
            orphan_grace,
            reservations: Mutex::new(HashSet::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scratch directory for fetched sources, on the same filesystem as the
    /// blobs so staged files can be renamed into place.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Whether a reservation for the key is live in this process.
    pub fn is_reserved(&self, region: &RegionKey, key: &ArtifactKey) -> bool {
        self.reservations
            .lock()
            .contains(&(region.clone(), key.clone()))
    }

    fn region_dir(&self, region: &RegionKey) -> PathBuf {
        self.root.join(region.as_str())
    }

    fn blob_path(&self, region: &RegionKey, key: &ArtifactKey) -> PathBuf {
        self.region_dir(region).join(key.as_str())
    }

    fn sidecar_path(&self, region: &RegionKey, key: &ArtifactKey) -> PathBuf {
        self.region_dir(region)
            .join(format!("{}{}", key.as_str(), ArtifactKey::SIDECAR_SUFFIX))
    }

    fn handle(&self, region: &RegionKey, key: &ArtifactKey) -> BlobHandle {
        BlobHandle {
            region: region.clone(),
            key: key.clone(),
            path: self.blob_path(region, key),
        }
    }

    fn end_reservation(&self, region: &RegionKey, key: &ArtifactKey) -> bool {
        self.reservations
            .lock()
            .remove(&(region.clone(), key.clone()))
    }

    async fn load_record(&self, region: &RegionKey, key: &ArtifactKey) -> Result<PolicyRecord, StoreError> {
        let raw = match fs::read(self.sidecar_path(region, key)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    region: region.clone(),
                    key: key.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        serde_json::from_slice(&raw).map_err(|e| StoreError::Policy {
            reason: format!("{region}/{key}: {e}"),
        })
    }

    /// Writes the sidecar via temp file and rename so readers never see a
    /// partial record.
    async fn save_record(
        &self,
        region: &RegionKey,
        key: &ArtifactKey,
        record: &PolicyRecord,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_vec(record).map_err(|e| StoreError::Policy {
            reason: e.to_string(),
        })?;

        let temp = self
            .region_dir(region)
            .join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        fs::write(&temp, json).await?;

        if let Err(e) = fs::rename(&temp, self.sidecar_path(region, key)).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Releases an in-memory reservation unless disarmed.
struct ReservationGuard<'a> {
    store: &'a FileArtifactStore,
    region: &'a RegionKey,
    key: &'a ArtifactKey,
    armed: bool,
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store.end_reservation(self.region, self.key);
        }
    }
}

/// Removes a file, treating "already gone" as success.
async fn remove_if_present(path: &Path) -> std::io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

async fn file_exists(path: &Path) -> Result<bool, StoreError> {
    Ok(fs::try_exists(path).await?)
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn exists(&self, region: &RegionKey, key: &ArtifactKey) -> Result<bool, StoreError> {
        Ok(file_exists(&self.sidecar_path(region, key)).await?
            && file_exists(&self.blob_path(region, key)).await?)
    }

    async fn begin_reserve(
        &self,
        region: &RegionKey,
        key: &ArtifactKey,
    ) -> Result<BlobHandle, StoreError> {
        let conflict = || StoreError::ReservationConflict {
            region: region.clone(),
            key: key.clone(),
        };

        if !self.reservations.lock().insert((region.clone(), key.clone())) {
            return Err(conflict());
        }
        // Ends the reservation if preparation fails or this future is dropped.
        let mut guard = ReservationGuard {
            store: self,
            region,
            key,
            armed: true,
        };

        if file_exists(&self.sidecar_path(region, key)).await? {
            return Err(conflict());
        }
        fs::create_dir_all(self.region_dir(region)).await?;
        // Leftover from a write that never committed.
        if remove_if_present(&self.blob_path(region, key)).await? {
            tracing::debug!(region = %region, key = %key, "Removed stale uncommitted blob");
        }
        guard.armed = false;

        tracing::trace!(region = %region, key = %key, "Reserved artifact slot");
        Ok(self.handle(region, key))
    }

    async fn commit(
        &self,
        region: &RegionKey,
        key: &ArtifactKey,
        policy: ExpirationPolicy,
    ) -> Result<BlobHandle, StoreError> {
        if !self.is_reserved(region, key) {
            return Err(StoreError::NoReservation {
                region: region.clone(),
                key: key.clone(),
            });
        }

        let corruption = |reason: String| StoreError::Corruption {
            region: region.clone(),
            key: key.clone(),
            reason,
        };

        let outcome = match file_exists(&self.blob_path(region, key)).await {
            Ok(true) => self
                .save_record(region, key, &PolicyRecord::new(policy, Utc::now()))
                .await
                .map_err(|e| corruption(format!("policy sidecar not written: {e}"))),
            Ok(false) => Err(corruption("reserved blob is missing".to_string())),
            Err(e) => Err(corruption(e.to_string())),
        };

        // A failed commit leaves its blob for the orphan sweep.
        self.end_reservation(region, key);

        outcome?;
        tracing::debug!(region = %region, key = %key, ?policy, "Committed artifact");
        Ok(self.handle(region, key))
    }

    async fn rollback(&self, region: &RegionKey, key: &ArtifactKey) -> Result<(), StoreError> {
        if !self.is_reserved(region, key) {
            return Err(StoreError::NoReservation {
                region: region.clone(),
                key: key.clone(),
            });
        }

        let removed = async {
            remove_if_present(&self.blob_path(region, key)).await?;
            remove_if_present(&self.sidecar_path(region, key)).await
        }
        .await;

        self.end_reservation(region, key);

        removed.map_err(|e| StoreError::Corruption {
            region: region.clone(),
            key: key.clone(),
            reason: format!("rollback incomplete: {e}"),
        })?;

        tracing::debug!(region = %region, key = %key, "Rolled back reservation");
        Ok(())
    }

    async fn read(&self, region: &RegionKey, key: &ArtifactKey) -> Result<BlobHandle, StoreError> {
        let mut record = self.load_record(region, key).await?;

        if !file_exists(&self.blob_path(region, key)).await? {
            tracing::warn!(region = %region, key = %key, "Policy sidecar without blob");
            return Err(StoreError::NotFound {
                region: region.clone(),
                key: key.clone(),
            });
        }

        if record.touch(Utc::now())
            && let Err(e) = self.save_record(region, key, &record).await
        {
            tracing::warn!(region = %region, key = %key, "Failed to refresh sliding expiration: {e}");
        }

        Ok(self.handle(region, key))
    }

    async fn delete(&self, region: &RegionKey, key: &ArtifactKey) -> Result<bool, StoreError> {
        // Sidecar first: the entry turns invisible before the blob goes.
        let had_sidecar = remove_if_present(&self.sidecar_path(region, key)).await?;
        let had_blob = remove_if_present(&self.blob_path(region, key)).await?;

        if had_sidecar {
            tracing::debug!(region = %region, key = %key, "Deleted artifact");
        }
        Ok(had_sidecar || had_blob)
    }

    async fn sweep(
        &self,
        region: &RegionKey,
        expired: ExpiryPredicate<'_>,
    ) -> Result<SweepReport, StoreError> {
        let started = Instant::now();
        let dir = self.region_dir(region);
        let mut report = SweepReport::default();

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        let mut committed = Vec::new();
        let mut others = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            match name.strip_suffix(ArtifactKey::SIDECAR_SUFFIX) {
                Some(stem) if !name.starts_with(TEMP_PREFIX) => match ArtifactKey::parse(stem) {
                    Ok(key) => committed.push(key),
                    Err(_) => tracing::warn!(region = %region, file = %name, "Ignoring unexpected sidecar"),
                },
                _ => others.push(entry),
            }
        }

        for key in &committed {
            report.examined += 1;
            let is_expired = match self.load_record(region, key).await {
                Ok(record) => expired(&record),
                Err(StoreError::Policy { reason }) => {
                    tracing::warn!(region = %region, key = %key, "Unreadable policy, retiring entry: {reason}");
                    true
                }
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };

            if is_expired {
                self.delete(region, key).await?;
                report.expired += 1;
            } else {
                report.retained += 1;
            }
        }

        let committed: HashSet<&ArtifactKey> = committed.iter().collect();
        for entry in others {
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }

            if !name.starts_with(TEMP_PREFIX) {
                let Ok(key) = ArtifactKey::parse(&name) else {
                    continue;
                };
                if committed.contains(&key) || self.is_reserved(region, &key) {
                    continue;
                }
            }

            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .unwrap_or_default();
            if age < self.orphan_grace {
                continue;
            }

            if remove_if_present(&entry.path()).await? {
                tracing::debug!(region = %region, file = %name, age_secs = age.as_secs(), "Removed orphan");
                report.orphans += 1;
            }
        }

        // Fails harmlessly while the region still holds anything.
        if report.retained == 0 && fs::remove_dir(&dir).await.is_ok() {
            tracing::trace!(region = %region, "Removed empty region directory");
        }

        tracing::debug!(
            region = %region,
            examined = report.examined,
            expired = report.expired,
            orphans = report.orphans,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Swept region"
        );
        Ok(report)
    }

    async fn regions(&self) -> Result<Vec<RegionKey>, StoreError> {
        let mut regions = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(region) = entry.file_name().to_str().and_then(RegionKey::from_digest) {
                regions.push(region);
            }
        }

        regions.sort();
        Ok(regions)
    }
}
