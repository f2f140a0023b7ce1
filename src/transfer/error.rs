use thiserror::Error;

use crate::store::StoreError;

/// Failures while moving bytes from the provider to the store.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("HTTP error {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Body from {url} broke after {bytes_so_far} bytes: {source}")]
    Body {
        url: String,
        bytes_so_far: u64,
        #[source]
        source: reqwest::Error,
    },

    #[error("No progress while {operation} for {:.0}s", .idle.as_secs_f64())]
    Stalled {
        operation: &'static str,
        idle: std::time::Duration,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TransferError {
    /// Rate limits, server errors, connection drops and truncated bodies are
    /// transient. An expired or rejected transient URL (4xx) is not; the next
    /// run resolves a fresh one.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Http { source, .. } => !source.is_builder(),
            Self::Body { .. } | Self::Stalled { .. } => true,
            Self::Store(e) => e.is_retryable(),
        }
    }
}

/// Strip the query string, which carries the signature of a pre-authorized URL.
pub(crate) fn redact_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.to_string()
        }
        Err(_) => url.split('?').next().unwrap_or_default().to_string(),
    }
}
