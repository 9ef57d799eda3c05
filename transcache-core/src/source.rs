//! Source descriptors and staging.
//!
//! A conversion needs its source as a local file. Local paths are used in
//! place; remote URLs and uploads are streamed into a staging temp file
//! that deletes itself when dropped.

use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use url::Url;

use crate::config::FetchConfig;
use crate::converter::TargetFormat;
use crate::region::ArtifactKey;

/// Errors that can occur while locating or fetching a source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Source not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid source {input:?}: {reason}")]
    InvalidSource { input: String, reason: String },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Request for {url} failed: {reason}")]
    Request { url: String, reason: String },

    #[error("HTTP client setup failed: {reason}")]
    Client { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the bytes to convert come from.
pub enum MediaSource {
    /// File already on this machine
    Local { path: PathBuf },
    /// HTTP(S) resource, downloaded before conversion
    Remote { url: Url },
    /// Client-provided stream; `name` carries its extension.
    ///
    /// The name is the upload's whole identity: two uploads with the same
    /// name in one region share an artifact. Callers that accept distinct
    /// content under one name should make the name unique, for example by
    /// prefixing a content hash.
    Upload {
        name: String,
        body: Box<dyn AsyncRead + Send + Unpin>,
    },
}

impl MediaSource {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local { path: path.into() }
    }

    pub fn remote(url: Url) -> Self {
        Self::Remote { url }
    }

    pub fn upload(name: impl Into<String>, body: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Upload {
            name: name.into(),
            body: Box::new(body),
        }
    }

    /// Interprets `input` as an http(s) URL or else a local path.
    pub fn parse(input: &str) -> Result<Self, SourceError> {
        let lowered = input.to_ascii_lowercase();
        if lowered.starts_with("http://") || lowered.starts_with("https://") {
            let url = Url::parse(input).map_err(|e| SourceError::InvalidSource {
                input: input.to_string(),
                reason: e.to_string(),
            })?;
            return Ok(Self::Remote { url });
        }

        if input.is_empty() {
            return Err(SourceError::InvalidSource {
                input: String::new(),
                reason: "empty path".to_string(),
            });
        }
        Ok(Self::local(input))
    }

    /// Stable identity used to derive artifact keys.
    pub fn identity(&self) -> String {
        match self {
            Self::Local { path } => path.to_string_lossy().into_owned(),
            Self::Remote { url } => url.as_str().to_string(),
            Self::Upload { name, .. } => format!("upload:{name}"),
        }
    }

    /// Store key for this source converted to `format`.
    pub fn artifact_key(&self, format: TargetFormat) -> ArtifactKey {
        ArtifactKey::derive(&self.identity(), format)
    }

    /// File extension of the source, if it has one.
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            Self::Local { path } => path.file_name()?.to_str()?.to_string(),
            Self::Remote { url } => url.path_segments()?.next_back()?.to_string(),
            Self::Upload { name, .. } => name.clone(),
        };
        Path::new(&name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
    }

    /// Container inferred from the extension.
    pub fn format(&self) -> Option<TargetFormat> {
        self.extension()
            .as_deref()
            .and_then(TargetFormat::from_extension)
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local { .. })
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local { path } => f.debug_struct("Local").field("path", path).finish(),
            Self::Remote { url } => f.debug_struct("Remote").field("url", &url.as_str()).finish(),
            Self::Upload { name, .. } => f
                .debug_struct("Upload")
                .field("name", name)
                .finish_non_exhaustive(),
        }
    }
}

/// A source made available as a local file.
#[derive(Debug)]
pub enum StagedSource {
    /// The caller's own file; never modified
    InPlace(PathBuf),
    /// Fetched copy, deleted on drop unless persisted
    Staged(TempPath),
}

impl StagedSource {
    pub fn path(&self) -> &Path {
        match self {
            Self::InPlace(path) => path,
            Self::Staged(temp) => temp,
        }
    }

    /// Places the source bytes at `target`: staged copies are moved,
    /// in-place files are copied.
    pub async fn persist_to(self, target: &Path) -> std::io::Result<u64> {
        match self {
            Self::InPlace(path) => fs::copy(&path, target).await,
            Self::Staged(temp) => {
                let path = temp.keep().map_err(|e| e.error)?;
                if let Err(e) = fs::rename(&path, target).await {
                    let _ = fs::remove_file(&path).await;
                    return Err(e);
                }
                Ok(fs::metadata(target).await?.len())
            }
        }
    }
}

/// Turns [`MediaSource`]s into local files.
#[derive(Debug, Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
    staging_dir: PathBuf,
}

impl SourceFetcher {
    /// Builds a fetcher that stages downloads under `staging_dir`.
    ///
    /// # Errors
    /// - `SourceError::Client` - HTTP client could not be configured
    pub fn new(config: &FetchConfig, staging_dir: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects));
        if !config.use_system_proxy {
            builder = builder.no_proxy();
        }

        let client = builder.build().map_err(|e| SourceError::Client {
            reason: e.to_string(),
        })?;

        Ok(Self {
            client,
            staging_dir: staging_dir.into(),
        })
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Makes `source` available as a local file.
    ///
    /// # Errors
    /// - `SourceError::NotFound` - Local file missing or remote returned 404/410
    /// - `SourceError::HttpStatus` - Any other unsuccessful HTTP status
    /// - `SourceError::Request` - Connection, timeout or body errors
    /// - `SourceError::Io` - Staging file could not be written
    pub async fn stage(&self, source: MediaSource) -> Result<StagedSource, SourceError> {
        let extension = source.extension();
        match source {
            MediaSource::Local { path } => match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(StagedSource::InPlace(path)),
                Ok(_) => Err(SourceError::NotFound {
                    resource: path.display().to_string(),
                }),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SourceError::NotFound {
                    resource: path.display().to_string(),
                }),
                Err(e) => Err(e.into()),
            },
            MediaSource::Remote { url } => self.download(&url, extension.as_deref()).await,
            MediaSource::Upload { name, mut body } => {
                let (mut file, temp) = self.staging_file(extension.as_deref()).await?;
                let copied = tokio::io::copy(&mut body, &mut file).await?;
                file.flush().await?;

                tracing::debug!(name = %name, bytes = copied, "Staged upload");
                Ok(StagedSource::Staged(temp))
            }
        }
    }

    async fn download(&self, url: &Url, extension: Option<&str>) -> Result<StagedSource, SourceError> {
        let request_failed = |e: reqwest::Error| {
            let reason = if e.is_timeout() {
                "request timed out".to_string()
            } else if e.is_connect() {
                "failed to connect".to_string()
            } else {
                e.to_string()
            };
            SourceError::Request {
                url: url.to_string(),
                reason,
            }
        };

        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_failed)?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(SourceError::NotFound {
                resource: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let (mut file, temp) = self.staging_file(extension).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(request_failed)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        tracing::debug!(url = %url, bytes = written, "Downloaded remote source");
        Ok(StagedSource::Staged(temp))
    }

    async fn staging_file(&self, extension: Option<&str>) -> Result<(fs::File, TempPath), SourceError> {
        fs::create_dir_all(&self.staging_dir).await?;

        let suffix = extension.map(|ext| format!(".{ext}")).unwrap_or_default();
        let named = tempfile::Builder::new()
            .prefix("source-")
            .suffix(&suffix)
            .tempfile_in(&self.staging_dir)?;
        let (file, path) = named.into_parts();
        Ok((fs::File::from_std(file), path))
    }
}
