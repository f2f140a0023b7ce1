//! Transfer engine: claims an item, resolves its download target, streams
//! the bytes into the object store and records the outcome.
//!
//! Items with a known size below the single-shot threshold are buffered and
//! written with one `put_object`. Everything else (including items whose
//! size the provider did not report) goes through a multipart upload in
//! bounded parts, so no object is ever held in memory whole.
//!
//! A pass has no overall deadline. Every network read and store write must
//! make progress within the idle timeout, so a large file that keeps moving
//! is never cut off, while a hung connection fails the pass and any staged
//! upload is aborted.

pub mod error;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::header::{COOKIE, USER_AGENT};
use sha2::{Digest, Sha256};

pub use error::TransferError;

use crate::catalog::MediaItem;
use crate::provider::{AuthContext, DownloadTarget, MediaProvider, ProviderError};
use crate::retry::{self, RetryAction, RetryError, RetryPolicy};
use crate::state::{ClaimToken, StateError, StateStore, SyncKey};
use crate::store::{destination_key, ObjectMetadata, ObjectStore, PartReceipt};
use error::redact_url;

const MIB: u64 = 1024 * 1024;
pub const DEFAULT_SINGLE_SHOT_THRESHOLD: u64 = 100 * MIB;
pub const DEFAULT_PART_SIZE: usize = 100 * MIB as usize;
/// Smallest part an object store accepts for anything but the last part.
pub const MIN_PART_SIZE: usize = 5 * MIB as usize;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Known sizes strictly below this go single-shot.
    pub single_shot_threshold: u64,
    pub part_size: usize,
    /// Policy for claim, resolve and ledger writes.
    pub api_retry: RetryPolicy,
    /// Policy for one full fetch-and-store pass.
    pub stream_retry: RetryPolicy,
    /// Longest wait for a single read or store write within a pass.
    pub idle_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let api_retry = RetryPolicy::default();
        Self {
            single_shot_threshold: DEFAULT_SINGLE_SHOT_THRESHOLD,
            part_size: DEFAULT_PART_SIZE,
            stream_retry: api_retry.with_attempt_timeout(None),
            api_retry,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    SingleShot,
    Multipart,
}

impl TransferMode {
    /// Unknown size is always multipart.
    pub fn choose(size_bytes: Option<u64>, threshold: u64) -> Self {
        match size_bytes {
            Some(size) if size < threshold => Self::SingleShot,
            _ => Self::Multipart,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStage {
    Resolve,
    Stream,
}

impl std::fmt::Display for TransferStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve => f.write_str("resolve"),
            Self::Stream => f.write_str("stream"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed {
        destination_key: String,
        bytes: u64,
        mode: TransferMode,
    },
    /// Completed earlier, or claimed by another worker.
    AlreadyHandled,
    /// Recorded as failed in the ledger; the run carries on.
    Failed { stage: TransferStage, error: String },
}

struct Stored {
    bytes: u64,
    sha256: String,
}

pub struct TransferEngine<P: ?Sized> {
    provider: Arc<P>,
    state: Arc<dyn StateStore>,
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
    config: TransferConfig,
}

impl<P: MediaProvider + ?Sized> TransferEngine<P> {
    pub fn new(
        provider: Arc<P>,
        state: Arc<dyn StateStore>,
        store: Arc<dyn ObjectStore>,
        http: reqwest::Client,
        config: TransferConfig,
    ) -> Self {
        Self {
            provider,
            state,
            store,
            http,
            config,
        }
    }

    /// Move one item. Per-item failures come back as
    /// [`TransferOutcome::Failed`]; only ledger errors are returned as `Err`.
    pub async fn transfer(
        &self,
        item: &MediaItem,
        auth: &AuthContext,
    ) -> Result<TransferOutcome, StateError> {
        let provider_id = self.provider.provider_id();
        let key = SyncKey::new(provider_id, &item.id);

        let Some(claim) = self.state_call("claim", || self.state.try_claim(&key)).await? else {
            tracing::debug!(media_id = %item.id, "Already completed or claimed elsewhere");
            return Ok(TransferOutcome::AlreadyHandled);
        };

        let target = match retry::retry_with_backoff(
            &self.config.api_retry,
            "resolve download",
            |e: &ProviderError| RetryAction::from_retryable(e.is_retryable()),
            || self.provider.resolve_download(auth, &item.id),
        )
        .await
        {
            Ok(target) => target,
            Err(e) => {
                return self
                    .record_failure(&key, &claim, TransferStage::Resolve, e.to_string())
                    .await
            }
        };
        if target.expires_at.is_some_and(|at| at <= Utc::now()) {
            tracing::warn!(media_id = %item.id, "Download URL is already past its expiry");
        }

        let destination = destination_key(provider_id, &item.id, &item.filename);
        let mode = TransferMode::choose(item.size_bytes, self.config.single_shot_threshold);
        tracing::debug!(
            media_id = %item.id,
            size = ?item.size_bytes,
            ?mode,
            "Starting transfer"
        );

        let stored = match retry::retry_with_backoff(
            &self.config.stream_retry,
            "stream to store",
            |e: &TransferError| RetryAction::from_retryable(e.is_retryable()),
            || self.stream_once(&target, auth, &destination, mode),
        )
        .await
        {
            Ok(stored) => stored,
            Err(e) => {
                return self
                    .record_failure(&key, &claim, TransferStage::Stream, e.to_string())
                    .await
            }
        };

        if let Some(expected) = item.size_bytes {
            if expected != stored.bytes {
                tracing::warn!(
                    media_id = %item.id,
                    expected,
                    actual = stored.bytes,
                    "Size mismatch between catalog and transferred bytes"
                );
            }
        }

        let metadata = ObjectMetadata {
            provider_id: provider_id.to_string(),
            media_id: item.id.clone(),
            filename: item.filename.clone(),
            size_bytes: stored.bytes,
            sha256: stored.sha256,
            stored_at: Utc::now(),
        };
        if let Err(e) = self.store.put_metadata(&destination, &metadata).await {
            tracing::warn!(media_id = %item.id, error = %e, "Failed to write metadata sidecar");
        }

        let completed = self
            .state_call("complete", || {
                self.state.complete(&key, &claim, &destination, stored.bytes)
            })
            .await;
        if let Err(StateError::ClaimLost { .. }) = completed {
            tracing::warn!(key = %key, "Claim was taken over while transferring, leaving the item to its new owner");
            return Ok(TransferOutcome::AlreadyHandled);
        }
        completed?;

        tracing::info!(
            media_id = %item.id,
            key = %destination,
            bytes = stored.bytes,
            "Transferred {}",
            item.filename
        );
        Ok(TransferOutcome::Completed {
            destination_key: destination,
            bytes: stored.bytes,
            mode,
        })
    }

    async fn record_failure(
        &self,
        key: &SyncKey,
        claim: &ClaimToken,
        stage: TransferStage,
        error: String,
    ) -> Result<TransferOutcome, StateError> {
        tracing::warn!(key = %key, %stage, "Transfer failed: {}", error);
        match self
            .state_call("fail", || self.state.fail(key, claim, &error))
            .await
        {
            Ok(()) => Ok(TransferOutcome::Failed { stage, error }),
            Err(StateError::ClaimLost { .. }) => {
                tracing::warn!(key = %key, "Claim was taken over, not recording the failure");
                Ok(TransferOutcome::AlreadyHandled)
            }
            Err(e) => Err(e),
        }
    }

    /// Fail with [`TransferError::Stalled`] if `fut` makes no progress
    /// within the idle timeout.
    async fn within_idle<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = T>,
    ) -> Result<T, TransferError> {
        tokio::time::timeout(self.config.idle_timeout, fut)
            .await
            .map_err(|_| TransferError::Stalled {
                operation,
                idle: self.config.idle_timeout,
            })
    }

    /// Ledger writes retry only on lock contention.
    async fn state_call<T, F, Fut>(&self, operation: &str, call: F) -> Result<T, StateError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StateError>>,
    {
        retry::retry_with_backoff(
            &self.config.api_retry,
            operation,
            |e: &StateError| RetryAction::from_retryable(e.is_retryable()),
            call,
        )
        .await
        .map_err(|e| match e {
            RetryError::Permanent { error, .. } => error,
            RetryError::Exhausted {
                last: Some(error), ..
            } => error,
            RetryError::Exhausted { last_error, .. } => StateError::Busy(last_error),
        })
    }

    async fn open(
        &self,
        target: &DownloadTarget,
        auth: &AuthContext,
    ) -> Result<reqwest::Response, TransferError> {
        let mut request = self.http.get(&target.url);
        if target.requires_auth_header {
            request = request
                .header(COOKIE, &auth.cookie_header)
                .header(USER_AGENT, &auth.user_agent);
        }
        let response = self
            .within_idle("opening the download", request.send())
            .await?
            .map_err(|e| TransferError::Http {
                url: redact_url(&target.url),
                source: e,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                url: redact_url(&target.url),
            });
        }
        Ok(response)
    }

    /// One full pass: fetch from the start and store under `destination`.
    async fn stream_once(
        &self,
        target: &DownloadTarget,
        auth: &AuthContext,
        destination: &str,
        mode: TransferMode,
    ) -> Result<Stored, TransferError> {
        let response = self.open(target, auth).await?;
        match mode {
            TransferMode::SingleShot => self.store_single(response, &target.url, destination).await,
            TransferMode::Multipart => {
                let upload_id = self.store.initiate_multipart(destination).await?;
                let result = self
                    .store_parts(response, &target.url, destination, &upload_id)
                    .await;
                if result.is_err() {
                    if let Err(e) = self.store.abort_multipart(destination, &upload_id).await {
                        tracing::warn!(
                            key = %destination,
                            upload_id = %upload_id,
                            error = %e,
                            "Failed to abort multipart upload"
                        );
                    }
                }
                result
            }
        }
    }

    async fn store_single(
        &self,
        response: reqwest::Response,
        url: &str,
        destination: &str,
    ) -> Result<Stored, TransferError> {
        let capacity = response.content_length().unwrap_or(0);
        let mut body = BytesMut::with_capacity(usize::try_from(capacity).unwrap_or(0));
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = self.within_idle("reading the body", stream.next()).await? {
            let chunk = chunk.map_err(|e| TransferError::Body {
                url: redact_url(url),
                bytes_so_far: body.len() as u64,
                source: e,
            })?;
            hasher.update(&chunk);
            body.extend_from_slice(&chunk);
        }
        let bytes = body.len() as u64;
        self.within_idle(
            "storing the object",
            self.store.put_object(destination, body.freeze()),
        )
        .await??;
        Ok(Stored {
            bytes,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    async fn store_parts(
        &self,
        response: reqwest::Response,
        url: &str,
        destination: &str,
        upload_id: &str,
    ) -> Result<Stored, TransferError> {
        let part_size = self.config.part_size.max(1);
        let mut buffer = BytesMut::with_capacity(part_size);
        let mut hasher = Sha256::new();
        let mut receipts: Vec<PartReceipt> = Vec::new();
        let mut total: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = self.within_idle("reading the body", stream.next()).await? {
            let chunk = chunk.map_err(|e| TransferError::Body {
                url: redact_url(url),
                bytes_so_far: total,
                source: e,
            })?;
            hasher.update(&chunk);
            total += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);
            while buffer.len() >= part_size {
                let part = buffer.split_to(part_size).freeze();
                receipts.push(self.upload_part(destination, upload_id, &receipts, part).await?);
            }
        }
        // An empty body still needs one part to complete.
        if !buffer.is_empty() || receipts.is_empty() {
            let part = buffer.freeze();
            receipts.push(self.upload_part(destination, upload_id, &receipts, part).await?);
        }

        self.within_idle(
            "completing the upload",
            self.store.complete_multipart(destination, upload_id, &receipts),
        )
        .await??;
        tracing::debug!(key = %destination, parts = receipts.len(), bytes = total, "Multipart upload finished");
        Ok(Stored {
            bytes: total,
            sha256: format!("{:x}", hasher.finalize()),
        })
    }

    async fn upload_part(
        &self,
        destination: &str,
        upload_id: &str,
        done: &[PartReceipt],
        part: Bytes,
    ) -> Result<PartReceipt, TransferError> {
        let part_number = u32::try_from(done.len() + 1).unwrap_or(u32::MAX);
        Ok(self
            .within_idle(
                "uploading a part",
                self.store.upload_part(destination, upload_id, part_number, part),
            )
            .await??)
    }
}
