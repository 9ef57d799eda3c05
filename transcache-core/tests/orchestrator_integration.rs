//! End-to-end behaviour of the orchestrator, store and sweeper together.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;
use transcache_core::config::FetchConfig;
use transcache_core::converter::ConversionOutput;
use transcache_core::{
    ArtifactOrigin, ArtifactStore, ConversionOrchestrator, Converter, ConverterError,
    ExpirationPolicy, FileArtifactStore, MediaSource, RegionKey, SourceFetcher, TargetFormat,
    TranscodeError,
};

/// Copies source to target after an optional delay, counting invocations.
#[derive(Default)]
struct SlowCopyConverter {
    calls: AtomicUsize,
    started: Notify,
    delay: Duration,
}

impl SlowCopyConverter {
    fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Converter for SlowCopyConverter {
    async fn convert(
        &self,
        source: &Path,
        target: &Path,
        _format: TargetFormat,
    ) -> Result<ConversionOutput, ConverterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Partial output exists while "converting".
        tokio::fs::write(target, b"partial").await?;
        self.started.notify_one();
        tokio::time::sleep(self.delay).await;

        let output_size = tokio::fs::copy(source, target).await?;
        Ok(ConversionOutput {
            output_size,
            processing_time: self.delay,
        })
    }

    fn is_available(&self) -> bool {
        true
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<FileArtifactStore>,
    orchestrator: Arc<ConversionOrchestrator>,
}

impl Harness {
    async fn new(converter: Arc<dyn Converter>, policy: ExpirationPolicy) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            FileArtifactStore::open(dir.path().join("store"), Duration::from_secs(3600))
                .await
                .unwrap(),
        );
        let fetch = FetchConfig {
            timeout: Duration::from_secs(5),
            use_system_proxy: false,
            ..FetchConfig::default()
        };
        let fetcher = SourceFetcher::new(&fetch, store.staging_dir()).unwrap();
        let orchestrator = ConversionOrchestrator::new(Arc::clone(&store) as Arc<dyn ArtifactStore>, fetcher)
            .with_converter(converter)
            .with_policy(policy);

        Self {
            dir,
            store,
            orchestrator: Arc::new(orchestrator),
        }
    }

    fn source(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, format!("contents of {name}")).unwrap();
        path
    }

    /// Files in a region directory, sorted.
    fn region_files(&self, region: &RegionKey) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(self.store.root().join(region.as_str())) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }
}

fn fresh_policy() -> ExpirationPolicy {
    ExpirationPolicy::sliding(Duration::from_secs(3600))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_convert_once() {
    let converter = SlowCopyConverter::with_delay(Duration::from_millis(100));
    let harness = Harness::new(Arc::clone(&converter) as Arc<dyn Converter>, fresh_policy()).await;
    let source = harness.source("movie.mkv");
    let region = RegionKey::derive("movie.mkv", "viewer");

    let requests: Vec<_> = (0..8)
        .map(|_| {
            let orchestrator = Arc::clone(&harness.orchestrator);
            let region = region.clone();
            let source = source.clone();
            tokio::spawn(async move {
                let artifact = orchestrator
                    .get_or_convert(&region, MediaSource::local(source), TargetFormat::Mp4)
                    .await
                    .unwrap();
                (artifact.path().to_path_buf(), artifact.origin())
            })
        })
        .collect();

    let mut results = Vec::new();
    for request in requests {
        results.push(request.await.unwrap());
    }

    assert_eq!(converter.calls(), 1);
    assert!(results.windows(2).all(|pair| pair[0].0 == pair[1].0));
    assert_eq!(
        results
            .iter()
            .filter(|(_, origin)| *origin == ArtifactOrigin::Converted)
            .count(),
        1
    );
    assert_eq!(
        std::fs::read_to_string(&results[0].0).unwrap(),
        "contents of movie.mkv"
    );

    let stats = harness.orchestrator.statistics();
    assert_eq!((stats.misses, stats.hits, stats.conversions), (1, 7, 1));
}

#[tokio::test]
async fn test_regions_convert_independently() {
    let converter = SlowCopyConverter::with_delay(Duration::ZERO);
    let harness = Harness::new(Arc::clone(&converter) as Arc<dyn Converter>, fresh_policy()).await;
    let source = harness.source("movie.mkv");

    let alice = harness
        .orchestrator
        .get_or_convert(
            &RegionKey::derive("movie.mkv", "alice"),
            MediaSource::local(&source),
            TargetFormat::Mp4,
        )
        .await
        .unwrap();
    let bob = harness
        .orchestrator
        .get_or_convert(
            &RegionKey::derive("movie.mkv", "bob"),
            MediaSource::local(&source),
            TargetFormat::Mp4,
        )
        .await
        .unwrap();

    assert_ne!(alice.path(), bob.path());
    assert_eq!(converter.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_request_leaves_no_entry() {
    let converter = SlowCopyConverter::with_delay(Duration::from_secs(30));
    let harness = Harness::new(Arc::clone(&converter) as Arc<dyn Converter>, fresh_policy()).await;
    let source = harness.source("movie.mkv");
    let region = RegionKey::derive("movie.mkv", "viewer");
    let key = MediaSource::local(&source).artifact_key(TargetFormat::Mp4);

    let request = {
        let orchestrator = Arc::clone(&harness.orchestrator);
        let region = region.clone();
        let source = source.clone();
        tokio::spawn(async move {
            orchestrator
                .get_or_convert(&region, MediaSource::local(source), TargetFormat::Mp4)
                .await
        })
    };

    converter.started.notified().await;
    assert_eq!(harness.region_files(&region), vec![key.to_string()]);
    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    // The rollback holds the write lock, so this waits for it.
    let lock = harness.orchestrator.registry().get_or_create(&region);
    lock.acquire_write().await;
    assert!(!harness.store.exists(&region, &key).await.unwrap());
    assert!(harness.region_files(&region).is_empty());
    lock.release_write();

    assert_eq!(harness.orchestrator.statistics().rollbacks, 1);
}

#[tokio::test]
async fn test_request_after_cancellation_converts_again() {
    let converter = SlowCopyConverter::with_delay(Duration::from_millis(300));
    let harness = Harness::new(Arc::clone(&converter) as Arc<dyn Converter>, fresh_policy()).await;
    let source = harness.source("movie.mkv");
    let region = RegionKey::derive("movie.mkv", "viewer");

    let cancelled = tokio::time::timeout(
        Duration::from_millis(50),
        harness
            .orchestrator
            .get_or_convert(&region, MediaSource::local(&source), TargetFormat::Mp4),
    )
    .await;
    assert!(cancelled.is_err());

    let artifact = harness
        .orchestrator
        .get_or_convert(&region, MediaSource::local(&source), TargetFormat::Mp4)
        .await
        .unwrap();

    assert_eq!(artifact.origin(), ArtifactOrigin::Converted);
    assert_eq!(converter.calls(), 2);
    assert_eq!(
        tokio::fs::read_to_string(artifact.path()).await.unwrap(),
        "contents of movie.mkv"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sweep_waits_for_in_flight_conversion() {
    let converter = SlowCopyConverter::with_delay(Duration::from_millis(200));
    let harness = Harness::new(Arc::clone(&converter) as Arc<dyn Converter>, fresh_policy()).await;
    let source = harness.source("movie.mkv");
    let region = RegionKey::derive("movie.mkv", "viewer");
    let sweeper = harness.orchestrator.sweeper();

    let request = {
        let orchestrator = Arc::clone(&harness.orchestrator);
        let region = region.clone();
        let source = source.clone();
        tokio::spawn(async move {
            let artifact = orchestrator
                .get_or_convert(&region, MediaSource::local(source), TargetFormat::Mp4)
                .await
                .unwrap();
            artifact.path().to_path_buf()
        })
    };

    converter.started.notified().await;
    let summary = sweeper.run_once().await.unwrap().unwrap();
    let path = request.await.unwrap();

    // The sweep could only run once the conversion had committed.
    assert_eq!(summary.regions, 1);
    assert_eq!((summary.retained, summary.orphans), (1, 0));
    assert_eq!(std::fs::read_to_string(path).unwrap(), "contents of movie.mkv");
}

#[tokio::test]
async fn test_expired_artifact_is_swept_and_rebuilt() {
    let converter = SlowCopyConverter::with_delay(Duration::ZERO);
    let already_expired = ExpirationPolicy::Absolute {
        deadline: chrono::Utc::now() - chrono::TimeDelta::seconds(1),
    };
    let harness = Harness::new(Arc::clone(&converter) as Arc<dyn Converter>, already_expired).await;
    let source = harness.source("movie.mkv");
    let region = RegionKey::derive("movie.mkv", "viewer");

    let artifact = harness
        .orchestrator
        .get_or_convert(&region, MediaSource::local(&source), TargetFormat::Mp4)
        .await
        .unwrap();
    let path = artifact.path().to_path_buf();
    drop(artifact);

    let summary = harness.orchestrator.sweeper().run_once().await.unwrap().unwrap();
    assert_eq!(summary.expired, 1);
    assert!(!path.exists());

    harness
        .orchestrator
        .get_or_convert(&region, MediaSource::local(&source), TargetFormat::Mp4)
        .await
        .unwrap();
    assert_eq!(converter.calls(), 2);
}

#[tokio::test]
async fn test_unavailable_converter_is_not_configured() {
    struct Unlicensed;

    #[async_trait]
    impl Converter for Unlicensed {
        async fn convert(
            &self,
            _source: &Path,
            _target: &Path,
            _format: TargetFormat,
        ) -> Result<ConversionOutput, ConverterError> {
            unreachable!("unavailable converter must not run")
        }

        fn is_available(&self) -> bool {
            false
        }
    }

    let harness = Harness::new(Arc::new(Unlicensed), fresh_policy()).await;
    let source = harness.source("movie.mkv");
    let region = RegionKey::derive("movie.mkv", "viewer");

    let result = harness
        .orchestrator
        .get_or_convert(&region, MediaSource::local(&source), TargetFormat::Mp4)
        .await;

    assert!(matches!(result, Err(TranscodeError::NotConfigured { .. })));
    assert!(harness.region_files(&region).is_empty());
}

#[tokio::test]
async fn test_cached_remote_artifact_is_not_downloaded_again() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let converter = SlowCopyConverter::with_delay(Duration::ZERO);
    let harness = Harness::new(Arc::clone(&converter) as Arc<dyn Converter>, fresh_policy()).await;

    // Answers exactly one request, then stops listening.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut seen = Vec::new();
        while !seen.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            seen.extend_from_slice(&buf[..n]);
        }
        let body = b"remote movie";
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    let url = url::Url::parse(&format!("http://{addr}/library/movie.mkv")).unwrap();
    let region = RegionKey::derive(url.as_str(), "viewer");

    let first = harness
        .orchestrator
        .get_or_convert(&region, MediaSource::remote(url.clone()), TargetFormat::WebM)
        .await
        .unwrap();
    assert_eq!(first.origin(), ArtifactOrigin::Converted);
    assert_eq!(std::fs::read(first.path()).unwrap(), b"remote movie");
    drop(first);

    let second = harness
        .orchestrator
        .get_or_convert(&region, MediaSource::remote(url), TargetFormat::WebM)
        .await
        .unwrap();
    assert_eq!(second.origin(), ArtifactOrigin::Cached);
    assert_eq!(converter.calls(), 1);

    let staged: Vec<_> = std::fs::read_dir(harness.store.staging_dir())
        .unwrap()
        .collect();
    assert!(staged.is_empty());
}

#[cfg(unix)]
mod process {
    use transcache_core::{ArgumentStyle, ProcessConverter};

    use super::*;

    fn script_converter(dir: &Path, body: &str) -> Arc<dyn Converter> {
        let script = dir.join("convert.sh");
        std::fs::write(&script, body).unwrap();
        Arc::new(
            ProcessConverter::new("/bin/sh", ArgumentStyle::Positional)
                .with_leading_args([script])
                .with_timeout(Duration::from_secs(10)),
        )
    }

    #[tokio::test]
    async fn test_process_converter_end_to_end() {
        let scripts = tempfile::tempdir().unwrap();
        let converter = script_converter(
            scripts.path(),
            "{ cat \"$1\"; printf ' [converted]'; } > \"$2\"\n",
        );
        let harness = Harness::new(converter, fresh_policy()).await;
        let source = harness.source("movie.mkv");
        let region = RegionKey::derive("movie.mkv", "viewer");

        let artifact = harness
            .orchestrator
            .get_or_convert(&region, MediaSource::local(&source), TargetFormat::Mp4)
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(artifact.path()).unwrap(),
            "contents of movie.mkv [converted]"
        );
        assert!(artifact.path().to_string_lossy().ends_with(".mp4"));
    }

    #[tokio::test]
    async fn test_killed_converter_is_cancelled_and_rolled_back() {
        let scripts = tempfile::tempdir().unwrap();
        let converter = script_converter(scripts.path(), "printf partial > \"$2\"\nkill -9 $$\n");
        let harness = Harness::new(converter, fresh_policy()).await;
        let source = harness.source("movie.mkv");
        let region = RegionKey::derive("movie.mkv", "viewer");

        let result = harness
            .orchestrator
            .get_or_convert(&region, MediaSource::local(&source), TargetFormat::Mp4)
            .await;

        assert!(matches!(result, Err(TranscodeError::Cancelled)));
        assert!(harness.region_files(&region).is_empty());
        assert_eq!(harness.orchestrator.statistics().rollbacks, 1);
    }

    #[tokio::test]
    async fn test_failing_converter_surfaces_stderr() {
        let scripts = tempfile::tempdir().unwrap();
        let converter = script_converter(scripts.path(), "echo 'unsupported codec' >&2\nexit 2\n");
        let harness = Harness::new(converter, fresh_policy()).await;
        let source = harness.source("movie.mkv");
        let region = RegionKey::derive("movie.mkv", "viewer");

        let error = harness
            .orchestrator
            .get_or_convert(&region, MediaSource::local(&source), TargetFormat::Mp4)
            .await
            .unwrap_err();

        match error {
            TranscodeError::ConversionFailed { reason } => assert!(reason.contains("unsupported codec")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(harness.region_files(&region).is_empty());
    }
}
