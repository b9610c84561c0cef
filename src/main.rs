//! rae-automation - Scheduled well-production reporting
//!
//! Pulls well observations from the data service, validates and
//! aggregates them, writes a spreadsheet report, and emails it out.
//! Designed to be invoked from cron or a systemd timer; one invocation
//! is one run.
//!
//! # Usage
//!
//! ```bash
//! # Daily snapshot run with ./rae.toml
//! rae-automation
//!
//! # Explicit window, no email
//! rae-automation --from 2026-08-23T00:00:00Z --to 2026-08-24T00:00:00Z --skip-email
//!
//! # Collect from the realtime stream instead of a snapshot
//! rae-automation --stream
//! ```
//!
//! # Environment Variables
//!
//! - `RAE_CONFIG`: Config file path (default: ./rae.toml)
//! - `RAE_USERNAME` / `RAE_PASSWORD`: API credentials (override the file)
//! - `RAE_SMTP_PASSWORD`: SMTP credential (overrides the file)
//! - `RUST_LOG`: Logging level (default: info)

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use rae_automation::config::Settings;
use rae_automation::lockfile::RunLock;
use rae_automation::run::run_once;
use rae_automation::types::RunStatus;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "rae-automation")]
#[command(about = "Well production data reporting pipeline")]
#[command(version)]
struct CliArgs {
    /// Config file path (overrides RAE_CONFIG and ./rae.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Window start (RFC 3339). Requires --to.
    #[arg(long, value_name = "TIMESTAMP")]
    from: Option<String>,

    /// Window end (RFC 3339). Requires --from.
    #[arg(long, value_name = "TIMESTAMP")]
    to: Option<String>,

    /// Collect from the realtime event stream instead of a snapshot
    #[arg(long)]
    stream: bool,

    /// Write the report but do not dispatch email
    #[arg(long)]
    skip_email: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    // Configuration problems are fatal before any network activity.
    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::FAILURE;
        }
    };

    // One run at a time; an overlapping invocation exits without side
    // effects.
    let _lock = match RunLock::acquire(&settings.report.output_dir) {
        Ok(lock) => lock,
        Err(e) => {
            error!(error = %e, "could not acquire run lock");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, finishing current stage");
            signal_token.cancel();
        }
    });

    info!(
        stream = settings.window.stream,
        email = settings.email.enabled,
        "starting pipeline run"
    );
    let state = run_once(&settings, shutdown).await;

    match state.status {
        RunStatus::Failed => ExitCode::FAILURE,
        RunStatus::Success | RunStatus::Partial => ExitCode::SUCCESS,
    }
}

/// Load settings and fold in CLI overrides, re-validating afterwards.
fn load_settings(args: &CliArgs) -> Result<Settings, rae_automation::ConfigError> {
    let mut settings = match &args.config {
        Some(path) => Settings::load_from_file(path)?,
        None => Settings::load()?,
    };

    if args.from.is_some() || args.to.is_some() {
        settings.window.from = args.from.clone();
        settings.window.to = args.to.clone();
    }
    if args.stream {
        settings.window.stream = true;
    }
    if args.skip_email {
        settings.email.enabled = false;
    }

    settings.validate()?;
    Ok(settings)
}
