//! Get-or-convert driver.
//!
//! Per request: read lock, probe the store, upgrade, re-check, then reserve,
//! convert and commit under the write lock, and finally downgrade so the
//! caller streams the artifact under a read lock. Any exit between reserve
//! and commit rolls the reservation back, including the request future being
//! dropped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Semaphore;

use crate::config::{SweeperConfig, TranscacheConfig};
use crate::converter::{Converter, TargetFormat};
use crate::locking::{LockMode, RegionLockRegistry, ScopedLockHandle};
use crate::region::{ArtifactKey, RegionKey};
use crate::source::{MediaSource, SourceFetcher};
use crate::store::{ArtifactStore, BlobHandle, ExpirationPolicy, FileArtifactStore, StoreError};
use crate::sweeper::{Sweeper, SweeperHandle};
use crate::TranscodeError;

/// How a returned artifact came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactOrigin {
    /// Already committed before this request
    Cached,
    /// Produced by the converter for this request
    Converted,
    /// Source already had the target container and was stored as is
    Passthrough,
    /// Local source in the target container, served from its own path
    InPlace,
}

/// A ready artifact. Holds the region's read lock until dropped, so the
/// sweeper cannot remove the file while it is being streamed.
#[derive(Debug)]
pub struct CachedArtifact {
    path: PathBuf,
    origin: ArtifactOrigin,
    hold: Option<ScopedLockHandle>,
}

impl CachedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn origin(&self) -> ArtifactOrigin {
        self.origin
    }

    /// Lock mode held on the artifact's region.
    pub fn lock_mode(&self) -> LockMode {
        self.hold
            .as_ref()
            .map_or(LockMode::Unlocked, ScopedLockHandle::mode)
    }

    /// Opens the artifact for streaming.
    pub async fn open(&self) -> std::io::Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path).await
    }
}

/// Counters since construction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Requests answered from a committed artifact
    pub hits: u64,
    /// Requests that had to populate the store
    pub misses: u64,
    /// Successful converter runs
    pub conversions: u64,
    /// Sources stored or served without conversion
    pub passthroughs: u64,
    /// Population attempts that failed
    pub failures: u64,
    /// Reservations rolled back, including on cancellation
    pub rollbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    conversions: AtomicU64,
    passthroughs: AtomicU64,
    failures: AtomicU64,
    rollbacks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drives cache population for all regions.
pub struct ConversionOrchestrator {
    registry: Arc<RegionLockRegistry>,
    store: Arc<dyn ArtifactStore>,
    fetcher: SourceFetcher,
    converter: Option<Arc<dyn Converter>>,
    policy: ExpirationPolicy,
    conversion_slots: Arc<Semaphore>,
    counters: Arc<Counters>,
    sweeper: Sweeper,
}

impl ConversionOrchestrator {
    /// Creates an orchestrator with no converter and default settings.
    pub fn new(store: Arc<dyn ArtifactStore>, fetcher: SourceFetcher) -> Self {
        let registry = Arc::new(RegionLockRegistry::new());
        Self {
            sweeper: Sweeper::new(Arc::clone(&registry), Arc::clone(&store)),
            registry,
            store,
            fetcher,
            converter: None,
            policy: ExpirationPolicy::default(),
            conversion_slots: Arc::new(Semaphore::new(num_cpus::get().clamp(1, 8))),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Wires a file store, fetcher and process converter from `config`.
    ///
    /// # Errors
    /// - `TranscodeError::Store` - Store root could not be created
    /// - `TranscodeError::NotConfigured` - HTTP client could not be built
    pub async fn from_config(config: &TranscacheConfig) -> Result<Self, TranscodeError> {
        let store = FileArtifactStore::open(&config.store.root, config.store.orphan_grace).await?;
        let fetcher = SourceFetcher::new(&config.fetch, store.staging_dir()).map_err(|e| {
            TranscodeError::NotConfigured {
                reason: e.to_string(),
            }
        })?;

        let mut orchestrator = Self::new(Arc::new(store), fetcher)
            .with_policy(config.store.default_policy)
            .with_max_concurrent(config.converter.max_concurrent);
        if let Some(converter) = config.converter.build() {
            orchestrator = orchestrator.with_converter(Arc::new(converter));
        }
        Ok(orchestrator)
    }

    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = Some(converter);
        self
    }

    /// Policy applied to every committed artifact
    pub fn with_policy(mut self, policy: ExpirationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Caps converter processes running at once across all regions
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.conversion_slots = Arc::new(Semaphore::new(max.max(1)));
        self
    }

    /// Shares a registry with other components, such as a sweeper
    pub fn with_registry(mut self, registry: Arc<RegionLockRegistry>) -> Self {
        self.sweeper = Sweeper::new(Arc::clone(&registry), Arc::clone(&self.store));
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &Arc<RegionLockRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Sweeper sharing this orchestrator's registry and store.
    ///
    /// Every call hands out a clone of the same sweeper, so passes started
    /// through any of them are single-flight.
    pub fn sweeper(&self) -> Sweeper {
        self.sweeper.clone()
    }

    /// Starts the periodic sweeper if `config` enables it.
    pub fn start_sweeper(&self, config: &SweeperConfig) -> Option<SweeperHandle> {
        if !config.enabled {
            tracing::debug!("Background sweeper disabled");
            return None;
        }
        tracing::info!(interval_secs = config.interval.as_secs(), "Starting background sweeper");
        Some(self.sweeper().spawn(config.interval))
    }

    pub fn statistics(&self) -> OrchestratorStats {
        let c = &self.counters;
        OrchestratorStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            conversions: c.conversions.load(Ordering::Relaxed),
            passthroughs: c.passthroughs.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            rollbacks: c.rollbacks.load(Ordering::Relaxed),
        }
    }

    /// Returns the artifact for `source` in `format`, converting at most once
    /// per region no matter how many callers ask concurrently.
    ///
    /// The returned artifact keeps the region read-locked until dropped.
    /// Dropping this future mid-conversion kills the converter and rolls the
    /// reservation back before the write lock is released.
    ///
    /// # Errors
    /// - `TranscodeError::NotFound` - Source missing
    /// - `TranscodeError::NotConfigured` - No usable converter; nothing reserved
    /// - `TranscodeError::TransientIo` - Source fetch failed
    /// - `TranscodeError::ConversionFailed` - Converter failed; rolled back
    /// - `TranscodeError::Cancelled` - Converter killed by a signal; rolled back
    /// - `TranscodeError::Store` - Store failure, including commit corruption
    pub async fn get_or_convert(
        &self,
        region: &RegionKey,
        source: MediaSource,
        format: TargetFormat,
    ) -> Result<CachedArtifact, TranscodeError> {
        let passthrough = source.format() == Some(format);
        let in_place = match &source {
            MediaSource::Local { path } if passthrough => Some(path.clone()),
            _ => None,
        };
        if let Some(path) = in_place {
            return self.serve_in_place(&path).await;
        }

        let key = source.artifact_key(format);
        let mut handle = self.registry.handle(region);

        handle.ensure_read().await;
        if let Some(blob) = self.lookup(region, &key).await? {
            Counters::bump(&self.counters.hits);
            return Ok(Self::artifact(blob, ArtifactOrigin::Cached, handle));
        }

        handle.ensure_write().await;
        // Another writer may have committed while we waited.
        if let Some(blob) = self.lookup(region, &key).await? {
            Counters::bump(&self.counters.hits);
            handle.ensure_read().await;
            return Ok(Self::artifact(blob, ArtifactOrigin::Cached, handle));
        }

        Counters::bump(&self.counters.misses);
        tracing::debug!(region = %region, key = %key, ?source, "Cache miss");

        let converter = if passthrough {
            None
        } else {
            Some(self.usable_converter()?)
        };

        let staged = self.fetcher.stage(source).await.inspect_err(|_| {
            Counters::bump(&self.counters.failures);
        })?;

        let blob = self.store.begin_reserve(region, &key).await?;
        let pending = PendingCommit {
            handle,
            store: Arc::clone(&self.store),
            counters: Arc::clone(&self.counters),
            region: region.clone(),
            key: key.clone(),
            settled: false,
        };

        let populated = match &converter {
            Some(converter) => {
                let _slot = self.conversion_slots.acquire().await.map_err(|_| {
                    TranscodeError::ConversionFailed {
                        reason: "conversion limiter closed".to_string(),
                    }
                })?;
                converter
                    .convert(staged.path(), &blob.path, format)
                    .await
                    .map(|output| {
                        tracing::debug!(
                            key = %key,
                            output_size = output.output_size,
                            elapsed_ms = output.processing_time.as_millis() as u64,
                            "Converter finished"
                        );
                    })
                    .map_err(TranscodeError::from)
            }
            None => staged
                .persist_to(&blob.path)
                .await
                .map(|_| ())
                .map_err(|e| TranscodeError::TransientIo {
                    reason: format!("storing passthrough source: {e}"),
                }),
        };

        if let Err(e) = populated {
            Counters::bump(&self.counters.failures);
            tracing::warn!(region = %region, key = %key, "Population failed, rolling back: {e}");
            pending.rollback().await;
            return Err(e);
        }

        let (blob, mut handle) = pending.commit(self.policy).await.inspect_err(|e| {
            Counters::bump(&self.counters.failures);
            tracing::error!(region = %region, key = %key, "Commit failed; reservation left for the sweeper: {e}");
        })?;

        let origin = if converter.is_some() {
            Counters::bump(&self.counters.conversions);
            ArtifactOrigin::Converted
        } else {
            Counters::bump(&self.counters.passthroughs);
            ArtifactOrigin::Passthrough
        };

        handle.ensure_read().await;
        tracing::info!(region = %region, key = %key, ?origin, "Artifact ready");
        Ok(Self::artifact(blob, origin, handle))
    }

    /// Deletes a committed artifact, as named by [`MediaSource::artifact_key`].
    ///
    /// Waits for the region write lock, so readers streaming the artifact
    /// finish first. Returns whether anything was removed.
    pub async fn invalidate(&self, region: &RegionKey, key: &ArtifactKey) -> Result<bool, TranscodeError> {
        let mut handle = self.registry.handle(region);
        handle.ensure_write().await;

        let removed = self.store.delete(region, key).await?;
        tracing::debug!(region = %region, key = %key, removed, "Invalidated artifact");
        Ok(removed)
    }

    async fn serve_in_place(&self, path: &Path) -> Result<CachedArtifact, TranscodeError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => {
                Counters::bump(&self.counters.passthroughs);
                Ok(CachedArtifact {
                    path: path.to_path_buf(),
                    origin: ArtifactOrigin::InPlace,
                    hold: None,
                })
            }
            Ok(_) => Err(TranscodeError::NotFound {
                resource: path.display().to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TranscodeError::NotFound {
                resource: path.display().to_string(),
            }),
            Err(e) => Err(TranscodeError::TransientIo {
                reason: e.to_string(),
            }),
        }
    }

    async fn lookup(&self, region: &RegionKey, key: &ArtifactKey) -> Result<Option<BlobHandle>, StoreError> {
        if !self.store.exists(region, key).await? {
            return Ok(None);
        }
        match self.store.read(region, key).await {
            Ok(blob) => Ok(Some(blob)),
            Err(StoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn usable_converter(&self) -> Result<Arc<dyn Converter>, TranscodeError> {
        let converter = self
            .converter
            .as_ref()
            .ok_or_else(|| TranscodeError::NotConfigured {
                reason: "no converter configured".to_string(),
            })?;

        if !converter.is_available() {
            return Err(TranscodeError::NotConfigured {
                reason: "converter is not installed or not licensed".to_string(),
            });
        }
        Ok(Arc::clone(converter))
    }

    fn artifact(blob: BlobHandle, origin: ArtifactOrigin, handle: ScopedLockHandle) -> CachedArtifact {
        CachedArtifact {
            path: blob.path,
            origin,
            hold: Some(handle),
        }
    }
}

impl std::fmt::Debug for ConversionOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionOrchestrator")
            .field("regions", &self.registry.len())
            .field("converter", &self.converter.is_some())
            .field("policy", &self.policy)
            .field("stats", &self.statistics())
            .finish()
    }
}

/// A live reservation plus the write lock protecting it.
///
/// Must end in `commit` or `rollback`. If dropped before either, the
/// rollback runs on a spawned task that keeps the write lock until the
/// reservation is gone.
struct PendingCommit {
    handle: ScopedLockHandle,
    store: Arc<dyn ArtifactStore>,
    counters: Arc<Counters>,
    region: RegionKey,
    key: ArtifactKey,
    settled: bool,
}

impl PendingCommit {
    /// Makes the artifact visible and hands back the write-locked handle.
    async fn commit(
        mut self,
        policy: ExpirationPolicy,
    ) -> Result<(BlobHandle, ScopedLockHandle), TranscodeError> {
        let committed = self.store.commit(&self.region, &self.key, policy).await;
        self.settled = true;

        let handle = self.handle.take();
        Ok((committed?, handle))
    }

    async fn rollback(mut self) {
        let result = self.store.rollback(&self.region, &self.key).await;
        self.settled = true;
        Counters::bump(&self.counters.rollbacks);

        if let Err(e) = result {
            tracing::error!(
                region = %self.region,
                key = %self.key,
                "Rollback incomplete; reservation left for the sweeper: {e}"
            );
        }
    }
}

impl Drop for PendingCommit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let handle = self.handle.take();
        let store = Arc::clone(&self.store);
        let counters = Arc::clone(&self.counters);
        let region = self.region.clone();
        let key = self.key.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(region = %region, key = %key, "Request cancelled, rolling back");
                runtime.spawn(async move {
                    match store.rollback(&region, &key).await {
                        Ok(()) => Counters::bump(&counters.rollbacks),
                        Err(e) => tracing::error!(
                            region = %region,
                            key = %key,
                            "Rollback after cancellation failed: {e}"
                        ),
                    }
                    drop(handle);
                });
            }
            Err(_) => tracing::warn!(
                region = %region,
                key = %key,
                "No runtime to roll back on; reservation left for the sweeper"
            ),
        }
    }
}
