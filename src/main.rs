//! throttlebench - CPU degradation benchmark campaigns
//!
//! This is the main entry point for the `tb` binary.

use clap::Parser;
use std::process::ExitCode;
use tb_cli::Cli;
use tracing::error;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose and the configured level
    let logs = cli.log_settings();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logs.level));

    // Logs go to stderr; stdout carries tables and CSV
    let registry = tracing_subscriber::registry().with(filter);
    if logs.json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    match cli.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
