use clap::{Args, Parser, Subcommand};

use crate::types::{LogFormat, LogLevel, ProviderKind};

#[derive(Parser, Debug)]
#[command(
    name = "mediasync",
    version,
    about = "Sync camera-cloud video libraries into durable object storage"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub global: GlobalArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List the catalog and transfer everything not yet stored
    Sync(SyncArgs),

    /// List the catalog and record candidates without transferring
    List(ListArgs),

    /// Probe the session material and report its validity
    Validate,

    /// Show ledger counts and the last run
    Status(StatusArgs),

    /// Move failed items back to pending
    ResetFailed,
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Remote provider to sync from
    #[arg(long, value_enum, default_value = "gopro", global = true)]
    pub provider: ProviderKind,

    /// JSON secret holding the session cookies
    #[arg(
        long,
        env = "MEDIASYNC_SESSION_FILE",
        default_value = "~/.mediasync/session.json",
        global = true
    )]
    pub session_file: String,

    /// SQLite ledger of per-item sync state
    #[arg(
        long,
        env = "MEDIASYNC_STATE_DB",
        default_value = "~/.mediasync/state.db",
        global = true
    )]
    pub state_db: String,

    /// Root directory of the object store
    #[arg(long, env = "MEDIASYNC_DESTINATION", global = true)]
    pub destination: Option<String>,

    /// Override the provider's API base URL
    #[arg(long, global = true)]
    pub api_base_url: Option<String>,

    /// Log level
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Disable progress bar
    #[arg(long, global = true)]
    pub no_progress_bar: bool,

    /// POST alerts as JSON to this URL instead of logging them
    #[arg(long, env = "MEDIASYNC_WEBHOOK_URL", global = true)]
    pub webhook_url: Option<String>,

    /// Total attempts per remote call, including the first
    #[arg(long, default_value_t = 3, global = true)]
    pub max_attempts: u32,

    /// Delay before the first retry, in seconds
    #[arg(long, default_value_t = 2, global = true)]
    pub retry_delay: u64,

    /// Upper bound on any single retry delay, in seconds
    #[arg(long, default_value_t = 60, global = true)]
    pub max_retry_delay: u64,

    /// Per-request timeout for API calls, in seconds
    #[arg(long, default_value_t = 30, global = true)]
    pub request_timeout: u64,

    /// Age in days past which credentials are reported stale
    #[arg(long, default_value_t = 20, global = true)]
    pub stale_after_days: i64,

    /// Hours after which an in-progress claim may be taken over
    #[arg(long, default_value_t = 2, global = true)]
    pub stall_threshold_hours: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ListingArgs {
    /// Stop after this many candidates
    #[arg(long)]
    pub max_items: Option<usize>,

    /// Skip items captured before this ISO date or interval (e.g., 2025-01-02 or 20d)
    #[arg(long)]
    pub captured_after: Option<String>,

    /// Skip items captured after this ISO date or interval
    #[arg(long)]
    pub captured_before: Option<String>,

    /// Items requested per catalog page
    #[arg(long, default_value_t = 100)]
    pub page_size: u32,

    /// Resume listing at a cursor reported by an aborted run
    #[arg(long)]
    pub start_cursor: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub listing: ListingArgs,

    /// Number of concurrent transfers
    #[arg(long, default_value_t = 5)]
    pub concurrency: usize,

    /// Items with a known size below this many bytes go up in one piece
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    pub single_shot_threshold: u64,

    /// Multipart chunk size in bytes (minimum 5 MiB)
    #[arg(long, default_value_t = 100 * 1024 * 1024)]
    pub part_size: usize,

    /// Seconds a transfer may go without reading or writing any bytes
    #[arg(long, default_value_t = 300)]
    pub stream_timeout: u64,

    /// With stale credentials, list but do not transfer
    #[arg(long)]
    pub suppress_transfers_when_stale: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    #[command(flatten)]
    pub listing: ListingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    /// List every failed item with its last error
    #[arg(long)]
    pub failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_sync_defaults() {
        let cli = Cli::try_parse_from(["mediasync", "sync", "--destination", "/data"]).unwrap();
        assert_eq!(cli.global.provider, ProviderKind::GoPro);
        assert_eq!(cli.global.destination.as_deref(), Some("/data"));
        assert_eq!(cli.global.max_attempts, 3);
        match cli.command {
            Command::Sync(args) => {
                assert_eq!(args.concurrency, 5);
                assert_eq!(args.listing.page_size, 100);
                assert!(!args.suppress_transfers_when_stale);
            }
            other => panic!("expected sync, got {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "mediasync",
            "status",
            "--failed",
            "--state-db",
            "/tmp/s.db",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.global.state_db, "/tmp/s.db");
        assert_eq!(cli.global.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Status(StatusArgs { failed: true })));
    }

    #[test]
    fn test_unknown_provider_rejected() {
        assert!(Cli::try_parse_from(["mediasync", "--provider", "dropbox", "validate"]).is_err());
    }
}
