use std::path::PathBuf;

use thiserror::Error;

/// Destination store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid object key '{0}'")]
    InvalidKey(String),

    #[error("No multipart upload '{0}'")]
    NoSuchUpload(String),

    #[error("Part {part_number} of upload {upload_id} rejected: {reason}")]
    InvalidPart {
        upload_id: String,
        part_number: u32,
        reason: String,
    },

    #[error("Failed to encode object metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Interrupted or timed-out I/O is transient. A full disk or a bad key
    /// is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            Self::InvalidKey(_)
            | Self::NoSuchUpload(_)
            | Self::InvalidPart { .. }
            | Self::Metadata(_) => false,
        }
    }
}
