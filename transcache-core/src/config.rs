//! Centralized configuration for Transcache.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::converter::{ArgumentStyle, ProcessConverter};
use crate::store::ExpirationPolicy;

/// Central configuration for all Transcache components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct TranscacheConfig {
    pub store: StoreConfig,
    pub converter: ConverterConfig,
    pub sweeper: SweeperConfig,
    pub fetch: FetchConfig,
}

/// Artifact store location and retention.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory holding one subdirectory per region
    pub root: PathBuf,
    /// Policy applied to newly committed artifacts
    pub default_policy: ExpirationPolicy,
    /// Minimum age before an unreferenced blob is treated as abandoned
    pub orphan_grace: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("transcache"),
            default_policy: ExpirationPolicy::sliding(Duration::from_secs(24 * 60 * 60)),
            orphan_grace: Duration::from_secs(60 * 60),
        }
    }
}

/// External converter process settings.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    /// Converter executable; `None` disables conversion
    pub program: Option<PathBuf>,
    /// Command line layout
    pub style: ArgumentStyle,
    /// License descriptor handed to positional converters
    pub license: Option<PathBuf>,
    /// Per-conversion time limit
    pub timeout: Duration,
    /// Converter processes allowed at once across all regions
    pub max_concurrent: usize,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: None,
            style: ArgumentStyle::Ffmpeg,
            license: None,
            timeout: Duration::from_secs(300), // 5 minutes
            max_concurrent: num_cpus::get().clamp(1, 8),
        }
    }
}

impl ConverterConfig {
    /// Builds the process converter, if a program is configured.
    pub fn build(&self) -> Option<ProcessConverter> {
        let program = self.program.as_ref()?;
        let mut converter =
            ProcessConverter::new(program.clone(), self.style).with_timeout(self.timeout);
        if let Some(license) = &self.license {
            converter = converter.with_license(license.clone());
        }
        Some(converter)
    }
}

/// Background expiration sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub enabled: bool,
    /// Time between sweep passes
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(10 * 60),
        }
    }
}

/// Remote source download settings.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Whole-request timeout, body included
    pub timeout: Duration,
    pub user_agent: String,
    pub max_redirects: usize,
    /// Honour `HTTP_PROXY` and friends
    pub use_system_proxy: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(120),
            user_agent: format!("transcache/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: 3,
            use_system_proxy: true,
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

impl TranscacheConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Unparseable values are ignored and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        // Store overrides
        if let Ok(dir) = std::env::var("TRANSCACHE_STORE_DIR") {
            config.store.root = PathBuf::from(dir);
        }
        if let Some(window) = env_secs("TRANSCACHE_SLIDING_WINDOW") {
            config.store.default_policy = ExpirationPolicy::sliding(window);
        }

        // Converter overrides
        if let Ok(program) = std::env::var("TRANSCACHE_CONVERTER") {
            config.converter.program = Some(PathBuf::from(program));
        }
        if let Ok(style) = std::env::var("TRANSCACHE_CONVERTER_STYLE") {
            match style.to_ascii_lowercase().as_str() {
                "positional" => config.converter.style = ArgumentStyle::Positional,
                "ffmpeg" => config.converter.style = ArgumentStyle::Ffmpeg,
                other => tracing::warn!("Ignoring unknown TRANSCACHE_CONVERTER_STYLE {other:?}"),
            }
        }
        if let Ok(license) = std::env::var("TRANSCACHE_LICENSE") {
            config.converter.license = Some(PathBuf::from(license));
        }
        if let Some(timeout) = env_secs("TRANSCACHE_CONVERT_TIMEOUT") {
            config.converter.timeout = timeout;
        }
        if let Ok(max) = std::env::var("TRANSCACHE_MAX_CONVERSIONS")
            && let Ok(count) = max.parse::<usize>()
            && count > 0
        {
            config.converter.max_concurrent = count;
        }

        // Sweeper and fetch overrides
        if let Some(interval) = env_secs("TRANSCACHE_SWEEP_INTERVAL") {
            config.sweeper.interval = interval;
        }
        if let Ok(enabled) = std::env::var("TRANSCACHE_SWEEPER") {
            config.sweeper.enabled = enabled.parse().unwrap_or(true);
        }
        if let Some(timeout) = env_secs("TRANSCACHE_FETCH_TIMEOUT") {
            config.fetch.timeout = timeout;
        }

        config
    }

    /// Creates a fast-cadence configuration rooted at `root`.
    pub fn for_testing(root: &Path) -> Self {
        Self {
            store: StoreConfig {
                root: root.to_path_buf(),
                default_policy: ExpirationPolicy::sliding(Duration::from_secs(60)),
                orphan_grace: Duration::from_secs(1),
            },
            converter: ConverterConfig {
                timeout: Duration::from_secs(10),
                max_concurrent: 2,
                ..ConverterConfig::default()
            },
            sweeper: SweeperConfig {
                enabled: true,
                interval: Duration::from_millis(50),
            },
            fetch: FetchConfig {
                timeout: Duration::from_secs(5),
                use_system_proxy: false,
                ..FetchConfig::default()
            },
        }
    }
}
