use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::catalog::CatalogFilter;
use crate::cli::{GlobalArgs, ListingArgs, SyncArgs};
use crate::credentials::ValidatorConfig;
use crate::pipeline::PipelineConfig;
use crate::provider::PageToken;
use crate::retry::RetryPolicy;
use crate::transfer::{TransferConfig, MIN_PART_SIZE};
use crate::types::{LogFormat, LogLevel, ProviderKind};

/// Settings shared by every command.
pub struct Config {
    pub session_file: PathBuf,
    pub state_db: PathBuf,
    pub destination: Option<PathBuf>,
    pub api_base_url: Option<String>,
    pub webhook_url: Option<String>,

    pub api_retry: RetryPolicy,
    pub request_timeout: Duration,
    pub stale_after: chrono::Duration,
    pub stall_threshold: Duration,

    pub provider: ProviderKind,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("provider", &self.provider)
            .field("session_file", &self.session_file)
            .field("state_db", &self.state_db)
            .field("destination", &self.destination)
            .field("webhook_url", &self.webhook_url.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Config {
    pub fn from_cli(args: &GlobalArgs) -> anyhow::Result<Self> {
        if args.max_attempts == 0 {
            anyhow::bail!("--max-attempts must be at least 1");
        }
        if args.stale_after_days < 1 {
            anyhow::bail!("--stale-after-days must be at least 1");
        }
        if let Some(url) = &args.webhook_url {
            url::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("Invalid --webhook-url '{}': {}", url, e))?;
        }

        let request_timeout = Duration::from_secs(args.request_timeout.max(1));
        let api_retry = RetryPolicy {
            max_attempts: args.max_attempts,
            base_delay: Duration::from_secs(args.retry_delay),
            max_delay: Duration::from_secs(args.max_retry_delay.max(args.retry_delay)),
            attempt_timeout: Some(request_timeout),
            ..RetryPolicy::default()
        };

        Ok(Self {
            session_file: expand_tilde(&args.session_file),
            state_db: expand_tilde(&args.state_db),
            destination: args.destination.as_deref().map(expand_tilde),
            api_base_url: args.api_base_url.clone(),
            webhook_url: args.webhook_url.clone(),
            api_retry,
            request_timeout,
            stale_after: chrono::Duration::days(args.stale_after_days),
            stall_threshold: Duration::from_secs(args.stall_threshold_hours * 3600),
            provider: args.provider,
            log_level: args.log_level,
            log_format: args.log_format,
            no_progress_bar: args.no_progress_bar,
        })
    }

    /// Pipeline settings for a run. `sync` is `None` for list-only runs.
    pub fn pipeline(
        &self,
        listing: &ListingArgs,
        sync: Option<&SyncArgs>,
    ) -> anyhow::Result<PipelineConfig> {
        if listing.page_size == 0 {
            anyhow::bail!("--page-size must be at least 1");
        }
        let filter = CatalogFilter {
            captured_after: listing
                .captured_after
                .as_deref()
                .map(parse_date_or_interval)
                .transpose()?,
            captured_before: listing
                .captured_before
                .as_deref()
                .map(parse_date_or_interval)
                .transpose()?,
            max_items: listing.max_items,
        };

        let mut config = PipelineConfig {
            page_size: listing.page_size,
            filter,
            start_cursor: listing.start_cursor.clone().map(PageToken::new),
            list_retry: self.api_retry.clone(),
            validator: ValidatorConfig {
                stale_after: self.stale_after,
                retry: self.api_retry.clone(),
            },
            no_progress_bar: self.no_progress_bar,
            ..PipelineConfig::default()
        };

        if let Some(sync) = sync {
            if sync.concurrency == 0 {
                anyhow::bail!("--concurrency must be at least 1");
            }
            let part_size = if sync.part_size < MIN_PART_SIZE {
                tracing::warn!(
                    requested = sync.part_size,
                    minimum = MIN_PART_SIZE,
                    "Part size below the object store minimum, using the minimum"
                );
                MIN_PART_SIZE
            } else {
                sync.part_size
            };
            config.concurrency = sync.concurrency;
            config.suppress_transfers_when_stale = sync.suppress_transfers_when_stale;
            config.transfer = TransferConfig {
                single_shot_threshold: sync.single_shot_threshold,
                part_size,
                api_retry: self.api_retry.clone(),
                stream_retry: self.api_retry.with_attempt_timeout(None),
                idle_timeout: Duration::from_secs(sync.stream_timeout.max(1)),
            };
        }
        Ok(config)
    }
}

/// Parse a human-friendly date spec into a UTC timestamp.
///
/// Accepts a relative interval (`"20d"`, 20 days ago), an ISO date
/// (`"2025-01-02"`, midnight UTC) or an ISO datetime (`"2025-01-02T14:30:00"`).
pub(crate) fn parse_date_or_interval(s: &str) -> anyhow::Result<DateTime<Utc>> {
    if let Some(days_str) = s.strip_suffix('d') {
        if let Ok(days) = days_str.parse::<i64>() {
            return Ok(Utc::now() - chrono::Duration::days(days));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(naive_dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive_dt.and_utc());
        }
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.and_utc());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    anyhow::bail!(
        "Cannot parse '{}' as a date. Expected ISO date (2025-01-02), \
         datetime (2025-01-02T14:30:00), or interval (20d)",
        s
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use chrono::TimeZone;
    use clap::Parser;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["mediasync"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    fn sync_args(cli: &Cli) -> &SyncArgs {
        match &cli.command {
            Command::Sync(args) => args,
            other => panic!("expected sync, got {:?}", other),
        }
    }

    #[test]
    fn test_expand_tilde_with_home() {
        let result = expand_tilde("~/Videos");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(result, home.join("Videos"));
        }
    }

    #[test]
    fn test_expand_tilde_no_prefix() {
        assert_eq!(expand_tilde("/srv/media"), PathBuf::from("/srv/media"));
        assert_eq!(expand_tilde("relative/path"), PathBuf::from("relative/path"));
    }

    #[test]
    fn test_parse_date_iso() {
        let dt = parse_date_or_interval("2025-01-15").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_datetime_iso() {
        let dt = parse_date_or_interval("2025-06-15T14:30:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 6, 15, 14, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_rfc3339_offset() {
        let dt = parse_date_or_interval("2025-06-15T14:30:00+02:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2025, 6, 15, 12, 30, 0).unwrap());
    }

    #[test]
    fn test_parse_interval_days() {
        let before = Utc::now();
        let dt = parse_date_or_interval("10d").unwrap();
        let after = Utc::now();
        assert!(dt >= before - chrono::Duration::days(10) - chrono::Duration::seconds(1));
        assert!(dt <= after - chrono::Duration::days(10) + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_parse_invalid_date() {
        assert!(parse_date_or_interval("not-a-date").is_err());
        assert!(parse_date_or_interval("").is_err());
    }

    #[test]
    fn test_retry_flags_shape_policy() {
        let cli = parse(&["--max-attempts", "5", "--retry-delay", "1", "--request-timeout", "7", "validate"]);
        let config = Config::from_cli(&cli.global).unwrap();
        assert_eq!(config.api_retry.max_attempts, 5);
        assert_eq!(config.api_retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.api_retry.attempt_timeout, Some(Duration::from_secs(7)));
        assert_eq!(config.stall_threshold, Duration::from_secs(2 * 3600));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let cli = parse(&["--max-attempts", "0", "validate"]);
        assert!(Config::from_cli(&cli.global).is_err());
    }

    #[test]
    fn test_bad_webhook_url_rejected() {
        let cli = parse(&["--webhook-url", "not a url", "validate"]);
        assert!(Config::from_cli(&cli.global).is_err());
    }

    #[test]
    fn test_part_size_clamped_to_minimum() {
        let cli = parse(&["sync", "--part-size", "1024"]);
        let config = Config::from_cli(&cli.global).unwrap();
        let args = sync_args(&cli);
        let pipeline = config.pipeline(&args.listing, Some(args)).unwrap();
        assert_eq!(pipeline.transfer.part_size, MIN_PART_SIZE);
    }

    #[test]
    fn test_sync_flags_flow_into_pipeline() {
        let cli = parse(&[
            "sync",
            "--concurrency",
            "8",
            "--max-items",
            "50",
            "--captured-after",
            "2024-01-01",
            "--stream-timeout",
            "60",
            "--suppress-transfers-when-stale",
        ]);
        let config = Config::from_cli(&cli.global).unwrap();
        let args = sync_args(&cli);
        let pipeline = config.pipeline(&args.listing, Some(args)).unwrap();
        assert_eq!(pipeline.concurrency, 8);
        assert_eq!(pipeline.filter.max_items, Some(50));
        assert_eq!(
            pipeline.filter.captured_after,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert!(pipeline.suppress_transfers_when_stale);
        assert_eq!(pipeline.transfer.idle_timeout, Duration::from_secs(60));
        // A pass as a whole is never cut off while it keeps moving.
        assert_eq!(pipeline.transfer.stream_retry.attempt_timeout, None);
        assert_eq!(pipeline.validator.stale_after, chrono::Duration::days(20));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let cli = parse(&["sync", "--concurrency", "0"]);
        let config = Config::from_cli(&cli.global).unwrap();
        let args = sync_args(&cli);
        assert!(config.pipeline(&args.listing, Some(args)).is_err());
    }
}
