//! Error types for the safekeep library
//!
//! Every per-file operation returns a [`Result`] so that bulk operations in the
//! registry can isolate one file's failure from the rest. Errors carry enough
//! context (paths, reasons) to be shown to a user as-is.

use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the safekeep library
pub type Result<T> = std::result::Result<T, SafekeepError>;

/// Main error type for all safekeep operations
#[derive(Debug, Error)]
pub enum SafekeepError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Managed file or backup is missing
    #[error("Not found: {0:?}")]
    NotFound(PathBuf),

    /// Content could not be decoded (corrupt or wrong format)
    #[error("Decode error: {0}")]
    Decode(String),

    /// Value could not be encoded
    #[error("Encode error: {0}")]
    Encode(String),

    /// Remote repository unreachable or returned a non-success status
    #[error("Network error: {0}")]
    Network(String),

    /// Operation requires a feature that is switched off
    #[error("Not enabled: {0}")]
    NotEnabled(String),

    /// Auto-save was requested but there is nothing cached to write
    #[error("No cached data for {0:?}")]
    NoCachedData(PathBuf),

    /// Every backup attempted during a rollback failed
    #[error("All {} backup(s) failed to restore", tried_paths.len())]
    FullRollbackFailure {
        /// Backup paths that were attempted, newest first
        tried_paths: Vec<PathBuf>,
        /// Failure reason for each attempted path
        reasons: Vec<String>,
    },

    /// Operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SafekeepError {
    fn from(err: serde_json::Error) -> Self {
        SafekeepError::Decode(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for SafekeepError {
    fn from(err: bincode::error::DecodeError) -> Self {
        SafekeepError::Decode(err.to_string())
    }
}

impl From<bincode::error::EncodeError> for SafekeepError {
    fn from(err: bincode::error::EncodeError) -> Self {
        SafekeepError::Encode(err.to_string())
    }
}

impl SafekeepError {
    /// Create a decode error with a custom message
    pub fn decode(msg: impl Into<String>) -> Self {
        SafekeepError::Decode(msg.into())
    }

    /// Create a network error with a custom message
    pub fn network(msg: impl Into<String>) -> Self {
        SafekeepError::Network(msg.into())
    }

    /// Create an invalid configuration error with a custom message
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        SafekeepError::InvalidConfiguration(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        SafekeepError::Internal(msg.into())
    }

    /// Map an I/O error on `path` to `NotFound` when the file is missing
    pub(crate) fn from_io(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            SafekeepError::NotFound(path.into())
        } else {
            SafekeepError::Io(err)
        }
    }

    /// Check if retrying later may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SafekeepError::Network(_) | SafekeepError::Cancelled | SafekeepError::Io(_)
        )
    }

    /// Check if this error indicates corrupt content
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SafekeepError::Decode(_) | SafekeepError::FullRollbackFailure { .. }
        )
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            SafekeepError::NotFound(path) => {
                format!("{:?} does not exist. Save the file at least once before backing it up.", path)
            }
            SafekeepError::NotEnabled(what) => {
                format!("{} is disabled for this file. Enable it in the file manager configuration.", what)
            }
            SafekeepError::FullRollbackFailure { tried_paths, .. } => {
                format!(
                    "None of the {} backup(s) could be restored. The data may need manual recovery.",
                    tried_paths.len()
                )
            }
            SafekeepError::Network(msg) => {
                format!("Remote repository unavailable ({}). The next poll will retry.", msg)
            }
            _ => self.to_string(),
        }
    }
}
