//! Transcache Core - region-scoped on-demand transcoding cache
//!
//! Produces a transcoded copy of a media resource at most once per region,
//! serves concurrent readers of cached copies, and never exposes a partially
//! written artifact. Built on an upgradable write-preferring reader-writer
//! lock, a region lock registry, a two-phase artifact store, and an external
//! converter process.

pub mod config;
pub mod converter;
pub mod locking;
pub mod orchestrator;
pub mod region;
pub mod source;
pub mod store;
pub mod sweeper;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::TranscacheConfig;
pub use converter::{ArgumentStyle, Converter, ConverterError, ProcessConverter, TargetFormat};
pub use locking::{LockMode, RegionLockRegistry, ScopedLockHandle, UpgradableRwLock};
pub use orchestrator::{ArtifactOrigin, CachedArtifact, ConversionOrchestrator, OrchestratorStats};
pub use region::{ArtifactKey, RegionKey};
pub use source::{MediaSource, SourceError, SourceFetcher};
pub use store::{ArtifactStore, ExpirationPolicy, FileArtifactStore, StoreError};
pub use sweeper::{SweepSummary, Sweeper, SweeperHandle};

/// Errors surfaced to callers of the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Conversion unavailable: {reason}")]
    NotConfigured { reason: String },

    #[error("Transient I/O failure: {reason}")]
    TransientIo { reason: String },

    #[error("Conversion failed: {reason}")]
    ConversionFailed { reason: String },

    #[error("Conversion was cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl TranscodeError {
    /// Returns a message suitable for showing to the requester.
    pub fn user_message(&self) -> String {
        match self {
            TranscodeError::NotFound { resource } => format!("Resource not found: {resource}"),
            TranscodeError::NotConfigured { .. } => {
                "Conversion is not available on this server".to_string()
            }
            TranscodeError::TransientIo { .. } => {
                "Could not retrieve the source, try again later".to_string()
            }
            TranscodeError::ConversionFailed { .. } => "Conversion failed".to_string(),
            TranscodeError::Cancelled => "Conversion was cancelled".to_string(),
            TranscodeError::Store(StoreError::NotFound { key, .. }) => {
                format!("Artifact {key} not found")
            }
            TranscodeError::Store(_) => "Cache storage error occurred".to_string(),
        }
    }

    /// Checks if this error maps to a "not found" rather than a server fault.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            TranscodeError::NotFound { .. } | TranscodeError::Store(StoreError::NotFound { .. })
        )
    }
}

impl From<ConverterError> for TranscodeError {
    fn from(error: ConverterError) -> Self {
        match error {
            ConverterError::Terminated => TranscodeError::Cancelled,
            other => TranscodeError::ConversionFailed {
                reason: other.to_string(),
            },
        }
    }
}

impl From<SourceError> for TranscodeError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::NotFound { resource } => TranscodeError::NotFound { resource },
            SourceError::InvalidSource { input, .. } => TranscodeError::NotFound { resource: input },
            SourceError::Client { reason } => TranscodeError::NotConfigured { reason },
            other => TranscodeError::TransientIo {
                reason: other.to_string(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, TranscodeError>;
