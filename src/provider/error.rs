use std::path::PathBuf;

use thiserror::Error;

/// Why the provider refused the session material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// Structurally unusable: missing cookies, malformed values.
    Invalid,
    /// Accepted once, now rejected by the provider (401/403).
    Expired,
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => f.write_str("invalid"),
            Self::Expired => f.write_str("expired"),
        }
    }
}

/// Typed provider errors enabling retry classification.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication {kind}: {message}")]
    Auth { kind: AuthFailure, message: String },

    #[error("HTTP error {status} from {url}")]
    HttpStatus { status: u16, url: String },

    #[error("Request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid response from {url}: {message}")]
    InvalidResponse { url: String, message: String },

    #[error("Media {0} not found at provider")]
    NotFound(String),

    #[error("Invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },
}

impl ProviderError {
    /// Map a non-success HTTP status to an error. 401/403 mean the session
    /// was rejected.
    pub fn from_status(status: u16, url: &str) -> Self {
        match status {
            401 | 403 => Self::Auth {
                kind: AuthFailure::Expired,
                message: format!("provider returned HTTP {}", status),
            },
            _ => Self::HttpStatus {
                status,
                url: url.to_string(),
            },
        }
    }

    /// Whether this error is transient and worth retrying.
    ///
    /// Rate limits, server errors, and connection-level failures are
    /// transient. Rejected credentials and malformed responses are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Http { source, .. } => !source.is_builder(),
            Self::Auth { .. }
            | Self::InvalidResponse { .. }
            | Self::NotFound(_)
            | Self::InvalidUrl { .. } => false,
        }
    }

    pub fn auth_failure(&self) -> Option<AuthFailure> {
        match self {
            Self::Auth { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Errors loading session material from the secret file.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to read session file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed session file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Session material has no cookies")]
    NoCookies,

    #[error("Invalid last_updated timestamp '{0}'")]
    Timestamp(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_401_and_403_map_to_expired_auth() {
        for status in [401, 403] {
            let e = ProviderError::from_status(status, "https://x/media/search");
            assert_eq!(e.auth_failure(), Some(AuthFailure::Expired));
            assert!(!e.is_retryable());
        }
    }

    #[test]
    fn test_rate_limit_and_server_errors_retryable() {
        for status in [429, 500, 502, 503, 504] {
            assert!(ProviderError::from_status(status, "u").is_retryable());
        }
    }

    #[test]
    fn test_other_client_errors_permanent() {
        for status in [400, 404, 422] {
            let e = ProviderError::from_status(status, "u");
            assert!(!e.is_retryable());
            assert_eq!(e.auth_failure(), None);
        }
    }

    #[test]
    fn test_invalid_response_not_retryable() {
        let e = ProviderError::InvalidResponse {
            url: "u".into(),
            message: "bad json".into(),
        };
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_auth_display() {
        let e = ProviderError::Auth {
            kind: AuthFailure::Invalid,
            message: "missing gp_access_token".into(),
        };
        assert_eq!(
            e.to_string(),
            "Authentication invalid: missing gp_access_token"
        );
    }
}
