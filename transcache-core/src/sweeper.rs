//! Background expiration sweeper.
//!
//! Each region is swept under its write lock, so a sweep never touches an
//! entry that is being populated or streamed. Passes are single-flight: a
//! pass that starts while another is running is skipped, not queued.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::locking::RegionLockRegistry;
use crate::store::{ArtifactStore, PolicyRecord, StoreError};

/// Totals for one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    /// Regions visited
    pub regions: usize,
    /// Regions whose sweep failed and were skipped
    pub failed_regions: usize,
    pub examined: usize,
    pub expired: usize,
    pub orphans: usize,
    pub retained: usize,
    pub elapsed: Duration,
}

/// Retires expired artifacts across all regions.
///
/// Clones share the single-flight guard.
#[derive(Clone)]
pub struct Sweeper {
    registry: Arc<RegionLockRegistry>,
    store: Arc<dyn ArtifactStore>,
    single_flight: Arc<Semaphore>,
}

impl Sweeper {
    pub fn new(registry: Arc<RegionLockRegistry>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            registry,
            store,
            single_flight: Arc::new(Semaphore::new(1)),
        }
    }

    /// Runs one pass. Returns `None` if another pass was already running.
    ///
    /// A region whose sweep fails is logged and skipped; the pass carries on.
    ///
    /// # Errors
    /// - `StoreError` - Regions could not be enumerated
    pub async fn run_once(&self) -> Result<Option<SweepSummary>, StoreError> {
        let Ok(_running) = self.single_flight.try_acquire() else {
            tracing::debug!("Sweep already in progress, skipping");
            return Ok(None);
        };

        let started = Instant::now();
        let mut summary = SweepSummary::default();

        for region in self.store.regions().await? {
            let mut handle = self.registry.handle(&region);
            handle.ensure_write().await;

            // Evaluated after the lock is held so a long wait cannot expire
            // entries that were read in the meantime.
            let now = Utc::now();
            let expired = move |record: &PolicyRecord| record.is_expired(now);

            summary.regions += 1;
            match self.store.sweep(&region, &expired).await {
                Ok(report) => {
                    summary.examined += report.examined;
                    summary.expired += report.expired;
                    summary.orphans += report.orphans;
                    summary.retained += report.retained;
                }
                Err(e) => {
                    summary.failed_regions += 1;
                    tracing::warn!(region = %region, "Sweep failed: {e}");
                }
            }
        }

        summary.elapsed = started.elapsed();
        if summary.expired + summary.orphans > 0 {
            tracing::info!(
                regions = summary.regions,
                expired = summary.expired,
                orphans = summary.orphans,
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "Sweep removed artifacts"
            );
        } else {
            tracing::trace!(regions = summary.regions, "Sweep found nothing to remove");
        }
        Ok(Some(summary))
    }

    /// Runs a pass every `interval` on a background task.
    ///
    /// Ticks that fall behind are skipped. The task stops when the returned
    /// handle is dropped.
    pub fn spawn(self, interval: Duration) -> SweeperHandle {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::warn!("Sweep pass failed: {e}");
                }
            }
        });
        SweeperHandle { task }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("regions", &self.registry.len())
            .field("running", &(self.single_flight.available_permits() == 0))
            .finish()
    }
}

/// Owns the background sweep task; aborts it on drop.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_pending;
    use tokio_test::task::spawn;

    use super::*;
    use crate::region::{ArtifactKey, RegionKey};
    use crate::store::{ExpirationPolicy, FileArtifactStore};

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: Arc<RegionLockRegistry>,
        store: Arc<FileArtifactStore>,
        sweeper: Sweeper,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FileArtifactStore::open(dir.path(), Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let registry = Arc::new(RegionLockRegistry::new());
        let sweeper = Sweeper::new(Arc::clone(&registry), Arc::clone(&store) as Arc<dyn ArtifactStore>);
        Fixture {
            _dir: dir,
            registry,
            store,
            sweeper,
        }
    }

    async fn commit(store: &FileArtifactStore, region: &RegionKey, name: &str, policy: ExpirationPolicy) -> ArtifactKey {
        let key = ArtifactKey::parse(name).unwrap();
        let blob = store.begin_reserve(region, &key).await.unwrap();
        tokio::fs::write(&blob.path, name).await.unwrap();
        store.commit(region, &key, policy).await.unwrap();
        key
    }

    fn already_expired() -> ExpirationPolicy {
        ExpirationPolicy::Absolute {
            deadline: Utc::now() - chrono::TimeDelta::seconds(1),
        }
    }

    #[tokio::test]
    async fn test_run_once_removes_only_expired() {
        let fx = fixture().await;
        let region = RegionKey::derive("movie.mkv", "token");
        let stale = commit(&fx.store, &region, "stale.mp4", already_expired()).await;
        let fresh = commit(&fx.store, &region, "fresh.mp4", ExpirationPolicy::default()).await;

        let summary = fx.sweeper.run_once().await.unwrap().unwrap();

        assert_eq!(summary.regions, 1);
        assert_eq!((summary.expired, summary.retained), (1, 1));
        assert!(!fx.store.exists(&region, &stale).await.unwrap());
        assert!(fx.store.exists(&region, &fresh).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_waits_for_readers() {
        let fx = fixture().await;
        let region = RegionKey::derive("movie.mkv", "token");
        let key = commit(&fx.store, &region, "stale.mp4", already_expired()).await;

        let mut reader = fx.registry.handle(&region);
        reader.ensure_read().await;

        let sweeper = fx.sweeper.clone();
        let pass = tokio::spawn(async move { sweeper.run_once().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pass.is_finished());
        assert!(fx.store.exists(&region, &key).await.unwrap());

        reader.release();
        let summary = pass.await.unwrap().unwrap().unwrap();
        assert_eq!(summary.expired, 1);
        assert!(!fx.store.exists(&region, &key).await.unwrap());
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_skipped() {
        let fx = fixture().await;
        let region = RegionKey::derive("movie.mkv", "token");
        commit(&fx.store, &region, "clip.mp4", ExpirationPolicy::default()).await;

        let mut reader = fx.registry.handle(&region);
        reader.ensure_read().await;

        let mut first = spawn(fx.sweeper.run_once());
        assert_pending!(first.poll());

        assert_eq!(fx.sweeper.run_once().await.unwrap(), None);

        drop(first);
        reader.release();
        assert!(fx.sweeper.run_once().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_spawned_sweeper_runs_until_dropped() {
        let fx = fixture().await;
        let region = RegionKey::derive("movie.mkv", "token");
        let key = commit(&fx.store, &region, "stale.mp4", already_expired()).await;

        let handle = fx.sweeper.clone().spawn(Duration::from_millis(10));
        assert!(handle.is_running());

        let mut removed = false;
        for _ in 0..100 {
            if !fx.store.exists(&region, &key).await.unwrap() {
                removed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(removed);

        drop(handle);
        tokio::time::sleep(Duration::from_millis(20)).await;
        // The guard is free again once the task is gone.
        assert!(fx.sweeper.run_once().await.unwrap().is_some());
    }
}
