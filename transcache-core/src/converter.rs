//! External converter abstraction
//!
//! The converter is an opaque external process: given a source path and a
//! target path it either produces the target (exit code 0) or fails. The
//! trait keeps the orchestrator independent of which program is used.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

/// Errors that can occur while running the external converter
#[derive(Debug, thiserror::Error)]
pub enum ConverterError {
    #[error("Converter process spawn failed: {reason}")]
    SpawnFailed { reason: String },

    #[error("Converter exited with status {code}: {stderr}")]
    ProcessFailed { code: i32, stderr: String },

    #[error("Converter was terminated before finishing")]
    Terminated,

    #[error("Converter timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Converter produced no output at {path}")]
    EmptyOutput { path: PathBuf },

    #[error("Unsupported target format: {format}")]
    UnsupportedFormat { format: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Output container requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetFormat {
    Mp4,
    WebM,
    Mkv,
}

impl TargetFormat {
    /// Get file extension
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "mp4",
            TargetFormat::WebM => "webm",
            TargetFormat::Mkv => "mkv",
        }
    }

    /// Get MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            TargetFormat::Mp4 => "video/mp4",
            TargetFormat::WebM => "video/webm",
            TargetFormat::Mkv => "video/x-matroska",
        }
    }

    /// Maps a file extension (case-insensitive) to a format
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "mp4" | "m4v" => Some(TargetFormat::Mp4),
            "webm" => Some(TargetFormat::WebM),
            "mkv" => Some(TargetFormat::Mkv),
            _ => None,
        }
    }

    /// Infers the format of a path from its extension
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::from_extension)
    }
}

impl std::str::FromStr for TargetFormat {
    type Err = ConverterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| ConverterError::UnsupportedFormat {
            format: s.to_string(),
        })
    }
}

impl std::fmt::Display for TargetFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.extension())
    }
}

/// Result of a successful conversion
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    /// Size of the produced file in bytes
    pub output_size: u64,
    /// Wall-clock time the converter ran
    pub processing_time: Duration,
}

/// Converts a source file into the requested container.
///
/// Implementations must stop all work when the returned future is dropped.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Converts `source` into `target`.
    ///
    /// # Errors
    /// - `ConverterError::SpawnFailed` - Program could not be started
    /// - `ConverterError::ProcessFailed` - Non-zero exit status
    /// - `ConverterError::Terminated` - Killed by a signal
    /// - `ConverterError::Timeout` - Exceeded the configured limit
    /// - `ConverterError::EmptyOutput` - Exit 0 but nothing written
    async fn convert(
        &self,
        source: &Path,
        target: &Path,
        format: TargetFormat,
    ) -> Result<ConversionOutput, ConverterError>;

    /// Whether the converter is installed and licensed
    fn is_available(&self) -> bool;
}

/// How arguments are laid out on the converter command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ArgumentStyle {
    /// `program [args..] <source> <target> [license]`
    Positional,
    /// `ffmpeg -y -i <source> <codec args> <target>`
    Ffmpeg,
}

/// Runs an external program per conversion.
///
/// Children are killed when the conversion future is dropped or times out.
#[derive(Debug, Clone)]
pub struct ProcessConverter {
    program: PathBuf,
    leading_args: Vec<OsString>,
    style: ArgumentStyle,
    license: Option<PathBuf>,
    timeout: Duration,
}

impl ProcessConverter {
    /// Default conversion time limit
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

    /// Create converter for `program` with the given argument style
    pub fn new(program: impl Into<PathBuf>, style: ArgumentStyle) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            style,
            license: None,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }

    /// Create converter for an ffmpeg binary
    pub fn ffmpeg(program: impl Into<PathBuf>) -> Self {
        Self::new(program, ArgumentStyle::Ffmpeg)
    }

    /// Arguments placed before the source and target paths
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// License descriptor passed to positional converters
    pub fn with_license(mut self, license: impl Into<PathBuf>) -> Self {
        self.license = Some(license.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Builds the argument list for one conversion
    pub fn build_args(&self, source: &Path, target: &Path, format: TargetFormat) -> Vec<OsString> {
        let mut args = self.leading_args.clone();

        match self.style {
            ArgumentStyle::Positional => {
                args.push(source.into());
                args.push(target.into());
                if let Some(license) = &self.license {
                    args.push(license.into());
                }
            }
            ArgumentStyle::Ffmpeg => {
                args.extend(["-y", "-i"].map(OsString::from));
                args.push(source.into());

                let codec_args: &[&str] = match format {
                    TargetFormat::Mp4 => &[
                        "-c:v",
                        "libx264",
                        "-c:a",
                        "aac",
                        "-movflags",
                        "faststart",
                    ],
                    TargetFormat::WebM => &["-c:v", "libvpx-vp9", "-c:a", "libopus"],
                    TargetFormat::Mkv => &["-c:v", "copy", "-c:a", "copy"],
                };
                args.extend(codec_args.iter().map(OsString::from));
                args.push(target.into());
            }
        }

        args
    }

    fn resolve_program(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 {
            return self.program.is_file().then(|| self.program.clone());
        }

        let path_var = std::env::var_os("PATH")?;
        std::env::split_paths(&path_var)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| candidate.is_file())
    }
}

#[async_trait]
impl Converter for ProcessConverter {
    async fn convert(
        &self,
        source: &Path,
        target: &Path,
        format: TargetFormat,
    ) -> Result<ConversionOutput, ConverterError> {
        let started = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(self.build_args(source, target, format))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            program = %self.program.display(),
            source = %source.display(),
            target = %target.display(),
            "Starting converter"
        );

        let child = cmd.spawn().map_err(|e| ConverterError::SpawnFailed {
            reason: format!("{}: {e}", self.program.display()),
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs(),
                    "Converter timed out; killing process"
                );
                ConverterError::Timeout {
                    seconds: self.timeout.as_secs(),
                }
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return match output.status.code() {
                Some(code) => Err(ConverterError::ProcessFailed { code, stderr }),
                None => Err(ConverterError::Terminated),
            };
        }

        let output_size = match tokio::fs::metadata(target).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if output_size == 0 {
            return Err(ConverterError::EmptyOutput {
                path: target.to_path_buf(),
            });
        }

        let processing_time = started.elapsed();
        tracing::info!(
            target = %target.display(),
            output_size,
            elapsed_ms = processing_time.as_millis() as u64,
            "Conversion finished"
        );

        Ok(ConversionOutput {
            output_size,
            processing_time,
        })
    }

    fn is_available(&self) -> bool {
        let licensed = self.license.as_ref().is_none_or(|license| license.is_file());
        licensed && self.resolve_program().is_some()
    }
}
