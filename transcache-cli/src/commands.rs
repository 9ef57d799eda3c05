//! CLI command implementations

use anyhow::{Context, bail};
use clap::Subcommand;
use transcache_core::config::TranscacheConfig;
use transcache_core::{
    ArtifactStore, ConversionOrchestrator, MediaSource, RegionKey, TargetFormat, TranscodeError,
};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Convert a source, or return the cached conversion
    Convert {
        /// Local path, http(s) URL, or "-" to read stdin
        source: String,
        /// Target container
        #[arg(short, long, default_value = "mp4")]
        format: TargetFormat,
        /// Access-scope token separating callers
        #[arg(short, long, default_value = "")]
        token: String,
        /// Name for stdin uploads; its extension gives the source container
        #[arg(long)]
        name: Option<String>,
    },
    /// Run one expiration sweep over every region
    Sweep,
    /// Keep sweeping on the configured interval until interrupted
    Watch,
    /// Delete the cached conversion of a source
    Delete {
        /// Local path or http(s) URL as given to `convert`
        source: String,
        #[arg(short, long, default_value = "mp4")]
        format: TargetFormat,
        #[arg(short, long, default_value = "")]
        token: String,
    },
    /// Print the region and artifact keys a request would use
    RegionKey {
        /// Resource identifier
        resource: String,
        #[arg(short, long, default_value = "")]
        token: String,
        /// Also print the artifact key for this container
        #[arg(short, long)]
        format: Option<TargetFormat>,
    },
    /// List regions currently holding artifacts
    Regions,
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands, config: &TranscacheConfig) -> anyhow::Result<()> {
    match command {
        Commands::Convert {
            source,
            format,
            token,
            name,
        } => convert(config, source, format, token, name).await,
        Commands::Sweep => sweep(config).await,
        Commands::Watch => watch(config).await,
        Commands::Delete {
            source,
            format,
            token,
        } => delete(config, source, format, token).await,
        Commands::RegionKey {
            resource,
            token,
            format,
        } => print_keys(&resource, &token, format),
        Commands::Regions => list_regions(config).await,
    }
}

async fn orchestrator(config: &TranscacheConfig) -> anyhow::Result<ConversionOrchestrator> {
    ConversionOrchestrator::from_config(config)
        .await
        .with_context(|| format!("opening store at {}", config.store.root.display()))
}

async fn convert(
    config: &TranscacheConfig,
    source: String,
    format: TargetFormat,
    token: String,
    name: Option<String>,
) -> anyhow::Result<()> {
    let (resource, media) = if source == "-" {
        let Some(name) = name else {
            bail!("--name is required when reading the source from stdin");
        };
        (name.clone(), MediaSource::upload(name, tokio::io::stdin()))
    } else {
        (source.clone(), MediaSource::parse(&source)?)
    };

    let orchestrator = orchestrator(config).await?;
    let region = RegionKey::derive(&resource, &token);

    match orchestrator.get_or_convert(&region, media, format).await {
        Ok(artifact) => {
            println!("{}", artifact.path().display());
            tracing::info!(
                region = %region,
                origin = ?artifact.origin(),
                mime = format.mime_type(),
                "Artifact available"
            );
            Ok(())
        }
        Err(e) => Err(conversion_failure(e)),
    }
}

/// Requester mistakes get the short message; server faults keep the detail.
fn conversion_failure(error: TranscodeError) -> anyhow::Error {
    if error.is_user_error() {
        return anyhow::anyhow!("{}", error.user_message());
    }
    match error {
        TranscodeError::NotConfigured { .. } => {
            anyhow::anyhow!("{}: {error}", error.user_message())
        }
        other => anyhow::Error::new(other).context("conversion failed"),
    }
}

async fn sweep(config: &TranscacheConfig) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config).await?;

    match orchestrator.sweeper().run_once().await? {
        Some(summary) => println!(
            "Swept {} regions: {} expired, {} orphans removed, {} kept ({} ms)",
            summary.regions,
            summary.expired,
            summary.orphans,
            summary.retained,
            summary.elapsed.as_millis()
        ),
        None => println!("A sweep is already running"),
    }
    Ok(())
}

async fn watch(config: &TranscacheConfig) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config).await?;
    let Some(handle) = orchestrator.start_sweeper(&config.sweeper) else {
        bail!("the sweeper is disabled (TRANSCACHE_SWEEPER=false)");
    };

    println!(
        "Sweeping {} every {}s, press Ctrl-C to stop",
        config.store.root.display(),
        config.sweeper.interval.as_secs()
    );
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;

    drop(handle);
    println!("Sweeper stopped");
    Ok(())
}

async fn delete(
    config: &TranscacheConfig,
    source: String,
    format: TargetFormat,
    token: String,
) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config).await?;
    let media = MediaSource::parse(&source)?;
    let region = RegionKey::derive(&source, &token);

    if orchestrator
        .invalidate(&region, &media.artifact_key(format))
        .await?
    {
        println!("Deleted cached {format} for {source}");
    } else {
        println!("Nothing cached for {source} as {format}");
    }
    Ok(())
}

fn print_keys(resource: &str, token: &str, format: Option<TargetFormat>) -> anyhow::Result<()> {
    println!("region:   {}", RegionKey::derive(resource, token));
    if let Some(format) = format {
        let key = MediaSource::parse(resource)?.artifact_key(format);
        println!("artifact: {key}");
    }
    Ok(())
}

async fn list_regions(config: &TranscacheConfig) -> anyhow::Result<()> {
    let orchestrator = orchestrator(config).await?;
    let regions = orchestrator.store().regions().await?;

    if regions.is_empty() {
        println!("No regions in {}", config.store.root.display());
    }
    for region in regions {
        println!("{region}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_failure_messages() {
        let missing = conversion_failure(TranscodeError::NotFound {
            resource: "movie.mkv".to_string(),
        });
        assert_eq!(missing.to_string(), "Resource not found: movie.mkv");

        let unconfigured = conversion_failure(TranscodeError::NotConfigured {
            reason: "no converter configured".to_string(),
        });
        assert!(unconfigured.to_string().ends_with("no converter configured"));

        let failed = conversion_failure(TranscodeError::ConversionFailed {
            reason: "exit 1".to_string(),
        });
        assert_eq!(failed.to_string(), "conversion failed");
        assert!(failed.downcast_ref::<TranscodeError>().is_some());
    }
}
