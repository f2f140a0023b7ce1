//! Pipeline driver: credentials gate, then a lazy listing feeding a bounded
//! pool of transfers.
//!
//! Per-item failures are recorded and counted; the run carries on. Expired
//! credentials, a listing page that exhausts its retries, and ledger failures
//! end the run with a [`SyncError`] naming the stage.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{future, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::catalog::{CatalogFilter, CatalogLister, ListingError, MediaItem};
use crate::clock::Clock;
use crate::credentials::{CredentialReport, CredentialValidator, ValidatorConfig, Validity};
use crate::notify::{AlertEvent, AlertKind, Notifier, Severity};
use crate::provider::{MediaProvider, PageToken, SessionMaterial};
use crate::retry::{RetryError, RetryPolicy};
use crate::state::{StateError, StateStore, SyncKey, SyncRunStats, SyncStatus};
use crate::store::ObjectStore;
use crate::transfer::{TransferConfig, TransferEngine, TransferOutcome};
use crate::types::Stage;

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub concurrency: usize,
    pub page_size: u32,
    pub filter: CatalogFilter,
    /// Resume listing at this cursor instead of the first page.
    pub start_cursor: Option<PageToken>,
    /// Policy for each listing page fetch.
    pub list_retry: RetryPolicy,
    pub validator: ValidatorConfig,
    pub transfer: TransferConfig,
    /// Stale credentials still list; this also holds back transfers.
    pub suppress_transfers_when_stale: bool,
    pub no_progress_bar: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            page_size: DEFAULT_PAGE_SIZE,
            filter: CatalogFilter::default(),
            start_cursor: None,
            list_retry: RetryPolicy::default(),
            validator: ValidatorConfig::default(),
            transfer: TransferConfig::default(),
            suppress_transfers_when_stale: false,
            no_progress_bar: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// List and transfer.
    Sync,
    /// Record every candidate as pending; transfer nothing.
    ListOnly,
}

/// Counters reported at the end of every run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Candidates produced by the listing.
    pub seen: u64,
    /// Transfers that got past the claim.
    pub attempted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Already completed in the ledger.
    pub skipped: u64,
    /// Claimed by another worker at the time.
    pub in_flight_elsewhere: u64,
    pub bytes: u64,
    pub interrupted: bool,
}

/// A failure that ended the run early.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Credentials {validity}: {reason}")]
    Credentials { validity: Validity, reason: String },

    #[error(transparent)]
    Listing(#[from] ListingError),

    #[error("State tracker failed during {stage}: {source}")]
    State {
        stage: Stage,
        #[source]
        source: StateError,
    },
}

impl SyncError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Credentials { .. } => Stage::Credentials,
            Self::Listing(_) => Stage::Listing,
            Self::State { stage, .. } => *stage,
        }
    }

    /// Where to resume listing, if the run died mid-listing.
    pub fn cursor(&self) -> Option<&PageToken> {
        match self {
            Self::Listing(e) => e.cursor.as_ref(),
            _ => None,
        }
    }
}

enum Admission {
    Transfer,
    AlreadyDone,
    Recorded,
}

pub struct Pipeline<P: ?Sized> {
    provider: Arc<P>,
    state: Arc<dyn StateStore>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    validator: CredentialValidator<P>,
    engine: TransferEngine<P>,
    config: PipelineConfig,
}

impl<P: MediaProvider + ?Sized> Pipeline<P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<P>,
        state: Arc<dyn StateStore>,
        store: Arc<dyn ObjectStore>,
        notifier: Arc<dyn Notifier>,
        http: reqwest::Client,
        clock: Arc<dyn Clock>,
        config: PipelineConfig,
    ) -> Self {
        let validator =
            CredentialValidator::new(provider.clone(), config.validator.clone(), clock.clone());
        let engine = TransferEngine::new(
            provider.clone(),
            state.clone(),
            store,
            http,
            config.transfer.clone(),
        );
        Self {
            provider,
            state,
            notifier,
            clock,
            validator,
            engine,
            config,
        }
    }

    /// One full run under a fresh run id.
    pub async fn run(
        &self,
        material: &SessionMaterial,
        mode: RunMode,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, SyncError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("run", run_id = %run_id);
        self.run_with_id(&run_id, material, mode, shutdown)
            .instrument(span)
            .await
    }

    async fn run_with_id(
        &self,
        run_id: &str,
        material: &SessionMaterial,
        mode: RunMode,
        shutdown: CancellationToken,
    ) -> Result<RunSummary, SyncError> {
        let started = Instant::now();
        tracing::info!(
            provider = self.provider.provider_id(),
            ?mode,
            resume_from = ?self.config.start_cursor.as_ref().map(PageToken::as_str),
            "Starting run"
        );

        let ledger_id = self
            .state
            .start_sync_run(run_id)
            .await
            .map_err(|source| SyncError::State {
                stage: Stage::State,
                source,
            })?;

        let mut summary = RunSummary::default();
        let result = self
            .execute(run_id, material, mode, &shutdown, &mut summary)
            .await;
        summary.interrupted = shutdown.is_cancelled() || result.is_err();

        let stats = SyncRunStats {
            items_seen: summary.seen,
            items_completed: summary.completed,
            items_failed: summary.failed,
            items_skipped: summary.skipped,
            interrupted: summary.interrupted,
        };
        if let Err(e) = self.state.complete_sync_run(ledger_id, &stats).await {
            tracing::warn!(error = %e, "Failed to record run in the ledger");
        }

        log_summary(&summary, started.elapsed());
        match result {
            Ok(()) => Ok(summary),
            Err(e) => {
                tracing::error!(stage = %e.stage(), cursor = ?e.cursor().map(PageToken::as_str), "Run aborted: {}", e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run_id: &str,
        material: &SessionMaterial,
        mode: RunMode,
        shutdown: &CancellationToken,
        summary: &mut RunSummary,
    ) -> Result<(), SyncError> {
        let report = self.gate(run_id, material).await?;
        let auth = match report.auth {
            Some(auth) if report.state.permits_listing() => auth,
            _ => {
                return Err(SyncError::Credentials {
                    validity: report.state.validity,
                    reason: "no authenticated context".to_string(),
                })
            }
        };

        let mode = if mode == RunMode::Sync
            && report.state.validity == Validity::Stale
            && self.config.suppress_transfers_when_stale
        {
            tracing::warn!("Credentials are stale; listing only, transfers held back");
            RunMode::ListOnly
        } else {
            mode
        };

        let pb = create_progress_bar(self.config.no_progress_bar, 0);
        let hint_pb = pb.clone();
        let lister = CatalogLister::new(
            self.provider.clone(),
            self.config.list_retry.clone(),
            self.config.page_size,
        )
        .with_total_hint_callback(move |total| hint_pb.set_length(total));

        let stop = AtomicBool::new(false);
        let fatal: Mutex<Option<SyncError>> = Mutex::new(None);
        let seen = AtomicU64::new(0);
        let skipped = AtomicU64::new(0);

        let (stop_ref, fatal_ref, seen_ref, skipped_ref, pb_ref) =
            (&stop, &fatal, &seen, &skipped, &pb);
        let candidates = lister
            .list_from(&auth, &self.config.filter, self.config.start_cursor.clone())
            .take_while(|_| {
                future::ready(!shutdown.is_cancelled() && !stop_ref.load(Ordering::SeqCst))
            })
            .filter_map(move |result| async move {
                let item = match result {
                    Ok(item) => item,
                    Err(e) => {
                        record_fatal(stop_ref, fatal_ref, SyncError::Listing(e));
                        return None;
                    }
                };
                seen_ref.fetch_add(1, Ordering::SeqCst);
                match self.admit(&item, mode).await {
                    Ok(Admission::Transfer) => Some(item),
                    Ok(Admission::AlreadyDone) => {
                        skipped_ref.fetch_add(1, Ordering::SeqCst);
                        pb_ref.inc(1);
                        None
                    }
                    Ok(Admission::Recorded) => {
                        pb_ref.inc(1);
                        None
                    }
                    Err(source) => {
                        record_fatal(
                            stop_ref,
                            fatal_ref,
                            SyncError::State {
                                stage: Stage::Listing,
                                source,
                            },
                        );
                        None
                    }
                }
            });

        let auth_ref = &auth;
        let transfers = candidates
            .map(move |item| async move {
                let result = self.engine.transfer(&item, auth_ref).await;
                (item, result)
            })
            .buffer_unordered(self.config.concurrency.max(1));
        tokio::pin!(transfers);

        let mut announced_shutdown = false;
        while let Some((item, result)) = transfers.next().await {
            pb.set_message(item.filename.clone());
            match result {
                Ok(TransferOutcome::Completed { bytes, .. }) => {
                    summary.attempted += 1;
                    summary.completed += 1;
                    summary.bytes += bytes;
                }
                Ok(TransferOutcome::AlreadyHandled) => summary.in_flight_elsewhere += 1,
                Ok(TransferOutcome::Failed { stage, error }) => {
                    summary.attempted += 1;
                    summary.failed += 1;
                    pb.suspend(|| {
                        tracing::error!(media_id = %item.id, %stage, "Transfer failed: {}: {}", item.filename, error)
                    });
                }
                Err(source) => {
                    if let StateError::Conflict { .. } = &source {
                        self.alert(
                            run_id,
                            Stage::State,
                            AlertKind::StateConflict,
                            Severity::Critical,
                            format!("Ledger conflict on {}: {}", item.id, source),
                            "Inspect the ledger entry and destination key; this indicates a bug",
                        )
                        .await;
                    }
                    record_fatal(
                        &stop,
                        &fatal,
                        SyncError::State {
                            stage: Stage::Transfer,
                            source,
                        },
                    );
                }
            }
            pb.inc(1);
            if shutdown.is_cancelled() && !announced_shutdown {
                announced_shutdown = true;
                pb.suspend(|| tracing::info!("Shutdown requested, finishing in-flight transfers"));
            }
        }
        pb.finish_and_clear();

        summary.seen = seen.load(Ordering::SeqCst);
        summary.skipped = skipped.load(Ordering::SeqCst);

        let fatal = match fatal.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match fatal {
            Some(SyncError::Listing(e)) => {
                for attempt in e.source.history() {
                    tracing::debug!(
                        attempt = attempt.attempt,
                        timed_out = attempt.timed_out,
                        waited = ?attempt.delay_before,
                        "Listing attempt failed: {}",
                        attempt.error
                    );
                }
                let (kind, action) = if is_auth_failure(&e.source) {
                    (
                        AlertKind::CredentialsExpired,
                        "Refresh the session material, then rerun",
                    )
                } else {
                    (
                        AlertKind::RetryExhausted,
                        "Rerun once the provider is reachable; completed items will be skipped",
                    )
                };
                self.alert(
                    run_id,
                    Stage::Listing,
                    kind,
                    Severity::Critical,
                    e.to_string(),
                    action,
                )
                .await;
                Err(SyncError::Listing(e))
            }
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Validate credentials and raise the matching alert.
    async fn gate(
        &self,
        run_id: &str,
        material: &SessionMaterial,
    ) -> Result<CredentialReport, SyncError> {
        let report = self.validator.validate(material).await;
        let reason = report.failure.clone().unwrap_or_default();
        match report.state.validity {
            Validity::Valid => Ok(report),
            Validity::Stale => {
                let days = report.age.map(|a| a.num_days()).unwrap_or_default();
                self.alert(
                    run_id,
                    Stage::Credentials,
                    AlertKind::CredentialsStale,
                    Severity::Warning,
                    format!("Session material is {} days old", days),
                    "Refresh the session cookies before they expire",
                )
                .await;
                Ok(report)
            }
            Validity::Expired => {
                self.alert(
                    run_id,
                    Stage::Credentials,
                    AlertKind::CredentialsExpired,
                    Severity::Critical,
                    format!("Provider rejected the session: {}", reason),
                    "Refresh the session cookies, then rerun",
                )
                .await;
                Err(SyncError::Credentials {
                    validity: Validity::Expired,
                    reason,
                })
            }
            Validity::Unknown => {
                self.alert(
                    run_id,
                    Stage::Credentials,
                    AlertKind::CredentialsUnverified,
                    Severity::Critical,
                    format!("Could not verify credentials: {}", reason),
                    "Check provider reachability, then rerun",
                )
                .await;
                Err(SyncError::Credentials {
                    validity: Validity::Unknown,
                    reason,
                })
            }
        }
    }

    async fn admit(&self, item: &MediaItem, mode: RunMode) -> Result<Admission, StateError> {
        let key = SyncKey::new(self.provider.provider_id(), &item.id);
        self.state.observe(&key, &item.filename).await?;
        if mode == RunMode::ListOnly {
            return Ok(Admission::Recorded);
        }
        match self.state.get(&key).await? {
            Some(record) if record.status == SyncStatus::Completed => {
                tracing::debug!(media_id = %item.id, "Already completed, skipping");
                Ok(Admission::AlreadyDone)
            }
            _ => Ok(Admission::Transfer),
        }
    }

    async fn alert(
        &self,
        run_id: &str,
        stage: Stage,
        kind: AlertKind,
        severity: Severity,
        summary: String,
        action_required: &str,
    ) {
        let event = AlertEvent {
            run_id: run_id.to_string(),
            stage,
            kind,
            severity,
            summary,
            action_required: action_required.to_string(),
            timestamp: self.clock.now(),
        };
        if let Err(e) = self.notifier.publish(&event).await {
            tracing::warn!(error = %e, kind = ?kind, "Failed to publish alert");
        }
    }
}

/// Keep the first fatal error and stop admitting new items.
fn record_fatal(stop: &AtomicBool, fatal: &Mutex<Option<SyncError>>, error: SyncError) {
    stop.store(true, Ordering::SeqCst);
    if let Ok(mut slot) = fatal.lock() {
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}

fn is_auth_failure(e: &RetryError<crate::provider::ProviderError>) -> bool {
    matches!(e, RetryError::Permanent { error, .. } if error.auth_failure().is_some())
}

fn create_progress_bar(no_progress_bar: bool, total: u64) -> ProgressBar {
    if no_progress_bar || !std::io::stdout().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("=> "));
    }
    pb
}

fn log_summary(summary: &RunSummary, elapsed: Duration) {
    tracing::info!("── Summary ──");
    tracing::info!(
        "  {} attempted, {} completed, {} failed, {} skipped (already done)",
        summary.attempted,
        summary.completed,
        summary.failed,
        summary.skipped
    );
    if summary.in_flight_elsewhere > 0 {
        tracing::info!("  {} claimed by another worker", summary.in_flight_elsewhere);
    }
    tracing::info!("  {} candidates listed, {} bytes stored", summary.seen, summary.bytes);
    if summary.interrupted {
        tracing::info!("  run was interrupted");
    }
    tracing::info!("  elapsed: {}", format_duration(elapsed));
}

fn format_duration(d: Duration) -> String {
    let total_secs = d.as_secs();
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, mins, secs)
    } else if mins > 0 {
        format!("{}m {:02}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::NotifyError;
    use crate::provider::fake::{page, raw, FakeProvider};
    use crate::state::SqliteStateStore;
    use crate::store::fake::HookedStore;
    use crate::store::FsObjectStore;
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<AlertEvent>>,
    }

    impl RecordingNotifier {
        fn kinds(&self) -> Vec<AlertKind> {
            self.events.lock().unwrap().iter().map(|e| e.kind).collect()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn publish(&self, event: &AlertEvent) -> Result<(), NotifyError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn now() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap()
    }

    fn material(age_days: i64) -> SessionMaterial {
        SessionMaterial::from_cookie_header(
            "gp_access_token=t; gp_user_id=u",
            None,
            Some(now() - chrono::Duration::days(age_days)),
        )
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            concurrency: 2,
            list_retry: RetryPolicy::immediate(2),
            validator: ValidatorConfig {
                retry: RetryPolicy::immediate(2),
                ..ValidatorConfig::default()
            },
            transfer: TransferConfig {
                single_shot_threshold: 1024,
                part_size: 4,
                api_retry: RetryPolicy::immediate(2),
                stream_retry: RetryPolicy::immediate(2),
                idle_timeout: Duration::from_secs(5),
            },
            no_progress_bar: true,
            ..PipelineConfig::default()
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: std::path::PathBuf,
        provider: Arc<FakeProvider>,
        state: Arc<SqliteStateStore>,
        notifier: Arc<RecordingNotifier>,
        pipeline: Pipeline<FakeProvider>,
    }

    fn harness(provider: FakeProvider, config: PipelineConfig) -> Harness {
        let state = Arc::new(SqliteStateStore::open_in_memory().unwrap());
        harness_with(provider, config, state, |root| Arc::new(FsObjectStore::new(root)))
    }

    fn harness_with(
        provider: FakeProvider,
        config: PipelineConfig,
        state: Arc<SqliteStateStore>,
        store: impl FnOnce(&std::path::Path) -> Arc<dyn ObjectStore>,
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let provider = Arc::new(provider);
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = Pipeline::new(
            provider.clone(),
            state.clone(),
            store(&root),
            notifier.clone(),
            reqwest::Client::new(),
            Arc::new(ManualClock::new(now())),
            config,
        );
        Harness {
            _dir: dir,
            root,
            provider,
            state,
            notifier,
            pipeline,
        }
    }

    async fn blob_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"video-bytes".to_vec()))
            .mount(&server)
            .await;
        server
    }

    /// Page 1: items 1 and 2 with cursor "p2"; page 2: item 3.
    fn two_page_provider(blob: &str) -> FakeProvider {
        FakeProvider::default()
            .with_page(
                None,
                page(
                    vec![raw("1", "GH000001.MP4", Some(11)), raw("2", "GH000002.MP4", Some(11))],
                    Some("p2"),
                ),
            )
            .with_page(Some("p2"), page(vec![raw("3", "GOPR0003.MP4", None)], None))
            .with_target("1", &format!("{}/v/1", blob))
            .with_target("2", &format!("{}/v/2", blob))
            .with_target("3", &format!("{}/v/3", blob))
    }

    #[tokio::test]
    async fn test_completed_item_is_skipped_end_to_end() {
        let server = blob_server().await;
        let h = harness(two_page_provider(&server.uri()), config());
        let done = SyncKey::new("fake", "2");
        let claim = h.state.try_claim(&done).await.unwrap().unwrap();
        h.state
            .complete(&done, &claim, "fake-videos/2/GH000002.MP4", 11)
            .await
            .unwrap();

        let summary = h
            .pipeline
            .run(&material(1), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.seen, 3);
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.failed, 0);
        assert!(!summary.interrupted);
        assert_eq!(h.provider.resolve_calls.load(Ordering::SeqCst), 2);
        assert!(h.root.join("fake-videos/1/GH000001.MP4").exists());
        assert!(h.root.join("fake-videos/3/GOPR0003.MP4").exists());

        let ledger = h.state.summary().await.unwrap();
        assert_eq!(ledger.completed, 3);
        assert!(ledger.last_sync_completed.is_some());
        assert!(h.notifier.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_transfers_nothing() {
        let server = blob_server().await;
        let h = harness(two_page_provider(&server.uri()), config());
        h.pipeline
            .run(&material(1), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap();
        let again = h
            .pipeline
            .run(&material(1), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.attempted, 0);
        assert_eq!(again.skipped, 3);
        assert_eq!(h.provider.resolve_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_one_bad_item_does_not_block_the_rest() {
        let server = blob_server().await;
        let provider = FakeProvider::default()
            .with_page(
                None,
                page(
                    vec![raw("ok", "GH_OK.MP4", Some(11)), raw("gone", "GH_GONE.MP4", Some(11))],
                    None,
                ),
            )
            .with_target("ok", &format!("{}/v/ok", server.uri()));
        let h = harness(provider, config());
        let summary = h
            .pipeline
            .run(&material(1), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        let failed = h.state.list_by_status(SyncStatus::Failed).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].key.media_id, "gone");
    }

    #[tokio::test]
    async fn test_expired_credentials_stop_before_listing() {
        let provider = FakeProvider {
            accepted_headers: vec!["nothing-matches".into()],
            ..two_page_provider("http://127.0.0.1:1")
        };
        let h = harness(provider, config());
        let err = h
            .pipeline
            .run(&material(1), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Credentials {
                validity: Validity::Expired,
                ..
            }
        ));
        assert_eq!(err.stage(), Stage::Credentials);
        assert_eq!(h.notifier.kinds(), vec![AlertKind::CredentialsExpired]);
        // Only the one-item probe reached the provider.
        assert_eq!(h.provider.list_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.provider.requested_page_sizes.lock().unwrap().as_slice(), &[1]);
        assert_eq!(h.state.summary().await.unwrap().total, 0);
        assert!(h.state.summary().await.unwrap().last_sync_interrupted);
    }

    #[tokio::test]
    async fn test_listing_exhaustion_keeps_earlier_items() {
        let server = blob_server().await;
        // Page "p2" is never served: the fake answers 503.
        let provider = FakeProvider::default()
            .with_page(
                None,
                page(
                    vec![raw("1", "GH000001.MP4", Some(11)), raw("2", "GH000002.MP4", Some(11))],
                    Some("p2"),
                ),
            )
            .with_target("1", &format!("{}/v/1", server.uri()))
            .with_target("2", &format!("{}/v/2", server.uri()));
        let h = harness(provider, config());
        let err = h
            .pipeline
            .run(&material(1), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Listing);
        assert_eq!(err.cursor(), Some(&PageToken::new("p2")));
        assert_eq!(h.notifier.kinds(), vec![AlertKind::RetryExhausted]);
        let ledger = h.state.summary().await.unwrap();
        assert_eq!(ledger.completed, 2);
        assert_eq!(ledger.in_progress, 0);
    }

    #[tokio::test]
    async fn test_resume_from_cursor_skips_earlier_pages() {
        let server = blob_server().await;
        let h = harness(
            two_page_provider(&server.uri()),
            PipelineConfig {
                start_cursor: Some(PageToken::new("p2")),
                ..config()
            },
        );
        let summary = h
            .pipeline
            .run(&material(1), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.seen, 1);
        assert_eq!(summary.completed, 1);
        assert!(h.root.join("fake-videos/3/GOPR0003.MP4").exists());
        assert!(!h.root.join("fake-videos/1/GH000001.MP4").exists());
    }

    #[tokio::test]
    async fn test_stale_credentials_alert_and_proceed() {
        let server = blob_server().await;
        let h = harness(two_page_provider(&server.uri()), config());
        let summary = h
            .pipeline
            .run(&material(30), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.completed, 3);
        assert_eq!(h.notifier.kinds(), vec![AlertKind::CredentialsStale]);
    }

    #[tokio::test]
    async fn test_stale_credentials_can_hold_back_transfers() {
        let h = harness(
            two_page_provider("http://127.0.0.1:1"),
            PipelineConfig {
                suppress_transfers_when_stale: true,
                ..config()
            },
        );
        let summary = h
            .pipeline
            .run(&material(30), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.seen, 3);
        assert_eq!(summary.attempted, 0);
        assert_eq!(h.provider.resolve_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.state.summary().await.unwrap().pending, 3);
    }

    #[tokio::test]
    async fn test_list_only_records_pending() {
        let h = harness(two_page_provider("http://127.0.0.1:1"), config());
        let summary = h
            .pipeline
            .run(&material(1), RunMode::ListOnly, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.seen, 3);
        assert_eq!(summary.attempted, 0);
        let pending = h.state.list_by_status(SyncStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn test_state_conflict_stops_the_run() {
        let server = blob_server().await;
        let config = PipelineConfig {
            concurrency: 1,
            ..config()
        };
        let clock = Arc::new(ManualClock::new(now()));
        let state = Arc::new(
            SqliteStateStore::open_in_memory()
                .unwrap()
                .with_clock(clock.clone()),
        );

        // While item 1 is being written, another worker re-claims it after
        // the stall threshold and completes it under a different key.
        let (hook_state, hook_clock) = (state.clone(), clock.clone());
        let h = harness_with(two_page_provider(&server.uri()), config, state, |root| {
            Arc::new(HookedStore::new(root).before_put(move || {
                let (state, clock) = (hook_state.clone(), hook_clock.clone());
                async move {
                    let key = SyncKey::new("fake", "1");
                    clock.advance(chrono::Duration::hours(3));
                    let claim = state.try_claim(&key).await.unwrap().unwrap();
                    state
                        .complete(&key, &claim, "elsewhere/1/GH000001.MP4", 11)
                        .await
                        .unwrap();
                }
                .boxed()
            }))
        });

        let err = h
            .pipeline
            .run(&material(1), RunMode::Sync, CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.stage(), Stage::Transfer);
        assert!(matches!(
            err,
            SyncError::State {
                source: StateError::Conflict { .. },
                ..
            }
        ));
        assert_eq!(h.notifier.kinds(), vec![AlertKind::StateConflict]);
        // No further items were admitted.
        assert_eq!(h.provider.resolve_calls.load(Ordering::SeqCst), 1);
        assert!(h.state.get(&SyncKey::new("fake", "2")).await.unwrap().is_none());
        let rec = h.state.get(&SyncKey::new("fake", "1")).await.unwrap().unwrap();
        assert_eq!(rec.destination_key.as_deref(), Some("elsewhere/1/GH000001.MP4"));
        assert!(h.state.summary().await.unwrap().last_sync_interrupted);
    }

    #[tokio::test]
    async fn test_cancelled_run_admits_nothing() {
        let h = harness(two_page_provider("http://127.0.0.1:1"), config());
        let token = CancellationToken::new();
        token.cancel();
        let summary = h
            .pipeline
            .run(&material(1), RunMode::Sync, token)
            .await
            .unwrap();
        assert_eq!(summary.attempted, 0);
        assert!(summary.interrupted);
        assert_eq!(h.provider.resolve_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(5)), "5s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 05s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 02m 05s");
    }
}
