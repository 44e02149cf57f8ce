use std::process::ExitCode;

use anyhow::{anyhow, Result};
use conductor_core::config::{AppConfig, LoadOptions, LogFormat};
use tracing::Level;

/// Logs go to stderr; stdout carries command output.
fn init_logging() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default()).unwrap_or_default();
    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(log_level)
        .with_writer(std::io::stderr);

    let installed = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|error| anyhow!("failed to install log subscriber: {error}"))
}

fn main() -> ExitCode {
    if let Err(error) = init_logging() {
        eprintln!("{error}");
    }
    conductor_cli::run()
}
