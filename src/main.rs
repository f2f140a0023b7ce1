//! mediasync: copies a camera-cloud video library into durable object storage.
//!
//! Each run validates the session material, lists the remote catalog page by
//! page, and streams every camera-origin item that the SQLite ledger has not
//! yet seen complete. Transfers run with bounded concurrency; every remote
//! call goes through exponential-backoff retries with jitter.

#![warn(clippy::all)]

mod catalog;
mod cli;
mod clock;
mod config;
mod credentials;
mod notify;
mod pipeline;
mod provider;
mod retry;
mod shutdown;
mod state;
mod store;
mod transfer;
mod types;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Command;
use clock::{Clock, SystemClock};
use config::Config;
use credentials::{CredentialValidator, Validity};
use notify::{LogNotifier, Notifier, WebhookNotifier};
use pipeline::{Pipeline, PipelineConfig, RunMode, RunSummary, SyncError};
use provider::{Provider, SessionMaterial};
use state::{SqliteStateStore, StateStore, SyncStatus};
use store::FsObjectStore;
use types::LogFormat;

/// Some items failed; the run itself completed.
const EXIT_ITEM_FAILURES: u8 = 1;
/// The run stopped early at a stage boundary.
const EXIT_RUN_ABORTED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter()));
    match config.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_current_span(true)
            .with_env_filter(filter)
            .init(),
    }
}

async fn open_state(config: &Config) -> anyhow::Result<Arc<SqliteStateStore>> {
    if let Some(parent) = config.state_db.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Cannot create {}", parent.display()))?;
        }
    }
    let db = SqliteStateStore::open(&config.state_db)
        .await
        .context("Failed to open the state database")?
        .with_stall_threshold(config.stall_threshold);
    tracing::debug!("State database opened at {}", db.path().display());
    Ok(Arc::new(db))
}

fn build_notifier(config: &Config) -> anyhow::Result<Arc<dyn Notifier>> {
    match &config.webhook_url {
        Some(url) => {
            let client = reqwest::Client::builder()
                .timeout(config.request_timeout)
                .build()?;
            Ok(Arc::new(WebhookNotifier::new(
                client,
                url.clone(),
                config.api_retry.clone(),
            )))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

fn build_provider(config: &Config) -> anyhow::Result<Arc<Provider>> {
    let provider = Provider::new(
        config.provider,
        config.api_base_url.as_deref(),
        config.request_timeout,
    )
    .context("Failed to build the provider client")?;
    Ok(Arc::new(provider))
}

async fn run_pipeline(
    config: &Config,
    pipeline_config: PipelineConfig,
    mode: RunMode,
) -> anyhow::Result<ExitCode> {
    let destination = match (mode, &config.destination) {
        (_, Some(dest)) => dest.clone(),
        (RunMode::ListOnly, None) => PathBuf::from("."),
        (RunMode::Sync, None) => anyhow::bail!("--destination is required for sync"),
    };

    let material = SessionMaterial::load(&config.session_file)
        .await
        .context("Failed to load session material")?;
    let state = open_state(config).await?;
    let http = reqwest::Client::builder()
        .connect_timeout(config.request_timeout)
        .build()?;
    let pipeline = Pipeline::new(
        build_provider(config)?,
        state,
        Arc::new(FsObjectStore::new(destination)),
        build_notifier(config)?,
        http,
        Arc::new(SystemClock) as Arc<dyn Clock>,
        pipeline_config,
    );

    let shutdown_token = shutdown::install_signal_handler();
    match pipeline.run(&material, mode, shutdown_token).await {
        Ok(summary) => Ok(exit_code_for(&summary)),
        Err(SyncError::Credentials { validity, reason }) => {
            eprintln!("Credentials {}: {}", validity, reason);
            eprintln!("Refresh {} and rerun.", config.session_file.display());
            Ok(ExitCode::from(EXIT_RUN_ABORTED))
        }
        Err(e) => {
            eprintln!("Run aborted during {}: {}", e.stage(), e);
            if let Some(cursor) = e.cursor() {
                eprintln!("Listing stopped at cursor '{}'", cursor);
            }
            Ok(ExitCode::from(EXIT_RUN_ABORTED))
        }
    }
}

fn exit_code_for(summary: &RunSummary) -> ExitCode {
    if summary.interrupted {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if summary.failed > 0 {
        ExitCode::from(EXIT_ITEM_FAILURES)
    } else {
        ExitCode::SUCCESS
    }
}

/// Run the validate command.
async fn run_validate(config: &Config) -> anyhow::Result<ExitCode> {
    let material = SessionMaterial::load(&config.session_file)
        .await
        .context("Failed to load session material")?;
    let validator = CredentialValidator::new(
        build_provider(config)?,
        credentials::ValidatorConfig {
            stale_after: config.stale_after,
            retry: config.api_retry.clone(),
        },
        Arc::new(SystemClock),
    );
    let report = validator.validate(&material).await;

    println!("Session file: {}", config.session_file.display());
    println!("Cookies:      {}", material.cookie_count());
    println!("Validity:     {}", report.state.validity);
    if report.state.degraded {
        println!("              (only the minimal cookie subset was accepted)");
    }
    match report.age {
        Some(age) => println!("Age:          {} days", age.num_days()),
        None => println!("Age:          unknown (no last_updated in session file)"),
    }
    if let Some(failure) = &report.failure {
        println!("Failure:      {}", failure);
    }

    Ok(match report.state.validity {
        Validity::Valid => ExitCode::SUCCESS,
        Validity::Stale => ExitCode::from(EXIT_ITEM_FAILURES),
        Validity::Expired | Validity::Unknown => ExitCode::from(EXIT_RUN_ABORTED),
    })
}

/// Run the status command.
async fn run_status(config: &Config, args: cli::StatusArgs) -> anyhow::Result<()> {
    if !config.state_db.exists() {
        println!("No state database found at {}", config.state_db.display());
        println!("Run a sync first to create the database.");
        return Ok(());
    }

    let db = open_state(config).await?;
    let summary = db.summary().await?;

    println!("State Database: {}", config.state_db.display());
    println!();
    println!("Items:");
    println!("  Total:       {}", summary.total);
    println!("  Completed:   {}", summary.completed);
    println!("  Pending:     {}", summary.pending);
    println!("  In progress: {}", summary.in_progress);
    println!("  Failed:      {}", summary.failed);
    println!();

    if let Some(started) = &summary.last_sync_started {
        println!(
            "Last sync started:   {}",
            started.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    if let Some(completed) = &summary.last_sync_completed {
        println!(
            "Last sync completed: {}{}",
            completed.format("%Y-%m-%d %H:%M:%S UTC"),
            if summary.last_sync_interrupted {
                " (interrupted)"
            } else {
                ""
            }
        );
    }

    if args.failed && summary.failed > 0 {
        println!();
        println!("Failed items:");
        for record in db.list_by_status(SyncStatus::Failed).await? {
            println!(
                "  {} ({}) - {} attempt(s), {}",
                record.filename.as_deref().unwrap_or("<unnamed>"),
                record.key,
                record.attempt_count,
                record.last_error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}

/// Run the reset-failed command.
async fn run_reset_failed(config: &Config) -> anyhow::Result<()> {
    if !config.state_db.exists() {
        println!("No state database found at {}", config.state_db.display());
        return Ok(());
    }
    let db = open_state(config).await?;
    let count = db.reset_failed().await?;
    if count > 0 {
        println!("Reset {} failed item(s) to pending.", count);
    } else {
        println!("No failed items to reset.");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = cli::Cli::parse();
    let config = Config::from_cli(&cli.global)?;
    init_tracing(&config);
    tracing::debug!(?config, "Configuration loaded");

    match cli.command {
        Command::Sync(args) => {
            let pipeline_config = config.pipeline(&args.listing, Some(&args))?;
            tracing::info!(
                concurrency = pipeline_config.concurrency,
                "Starting mediasync"
            );
            run_pipeline(&config, pipeline_config, RunMode::Sync).await
        }
        Command::List(args) => {
            let pipeline_config = config.pipeline(&args.listing, None)?;
            run_pipeline(&config, pipeline_config, RunMode::ListOnly).await
        }
        Command::Validate => run_validate(&config).await,
        Command::Status(args) => {
            run_status(&config, args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::ResetFailed => {
            run_reset_failed(&config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
