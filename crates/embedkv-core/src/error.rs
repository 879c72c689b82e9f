//! Error types shared across the embedkv workspace.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for store operations.
///
/// `NotFound` is not an error on the lookup fast path; it signals
/// "create if admitted" and optimizer callers treat it as "skip this id
/// in this batch".
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested id is absent from every tier.
    #[error("id {id} not found")]
    NotFound {
        /// The id that was not found.
        id: i64,
    },

    /// Conflicting or malformed configuration, shape mismatch, or use of
    /// a reserved key.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// An operation was attempted on a variable that has not been
    /// initialized.
    #[error("failed precondition: {message}")]
    FailedPrecondition {
        /// Description of the violated precondition.
        message: String,
    },

    /// SSD read or write failure. Never retried at this layer.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Checksum mismatch during an SSD read or restart scan. The
    /// affected record is dropped and logged.
    #[error("corruption in {path} at offset {offset}: {message}")]
    Corruption {
        /// Path of the corrupted file.
        path: PathBuf,
        /// Byte offset of the corrupted record.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },
}

impl StoreError {
    /// Shorthand for an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Shorthand for a `FailedPrecondition` error.
    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            message: message.into(),
        }
    }

    /// Returns true if this error is `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A specialized Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound { id: 42 };
        assert_eq!(err.to_string(), "id 42 not found");
        assert!(err.is_not_found());

        let err = StoreError::invalid_argument("reserved key");
        assert_eq!(err.to_string(), "invalid argument: reserved key");
        assert!(!err.is_not_found());

        let err = StoreError::Corruption {
            path: PathBuf::from("/data/seg_00000001.emb"),
            offset: 512,
            message: "checksum mismatch".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "corruption in /data/seg_00000001.emb at offset 512: checksum mismatch"
        );
    }
}
