//! Transcache CLI - Command-line interface
//!
//! One-shot access to the transcoding cache: convert, sweep, delete, inspect.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use transcache_core::ArgumentStyle;
use transcache_core::config::TranscacheConfig;
use transcache_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "transcache")]
#[command(about = "Region-scoped on-demand transcoding cache")]
struct Cli {
    /// Console log level (full trace always goes to logs/)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Warn, global = true)]
    log_level: CliLogLevel,

    /// Store root directory (overrides TRANSCACHE_STORE_DIR)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    /// Converter executable (overrides TRANSCACHE_CONVERTER)
    #[arg(long, global = true)]
    converter: Option<PathBuf>,

    /// Converter command line layout
    #[arg(long, value_enum, global = true)]
    style: Option<ArgumentStyle>,

    /// License file handed to positional converters
    #[arg(long, global = true)]
    license: Option<PathBuf>,

    #[command(subcommand)]
    command: commands::Commands,
}

impl Cli {
    fn config(&self) -> TranscacheConfig {
        let mut config = TranscacheConfig::from_env();
        if let Some(store) = &self.store {
            config.store.root = store.clone();
        }
        if let Some(converter) = &self.converter {
            config.converter.program = Some(converter.clone());
        }
        if let Some(style) = self.style {
            config.converter.style = style;
        }
        if let Some(license) = &self.license {
            config.converter.license = Some(license.clone());
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(cli.log_level.as_tracing_level(), None) {
        eprintln!("Warning: file logging disabled: {e}");
    }

    let config = cli.config();
    commands::handle_command(cli.command, &config).await
}
