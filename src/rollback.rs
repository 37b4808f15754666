//! Sequential-retry recovery from backups
//!
//! [`RollbackEngine`] walks a list of backups, newest first, and returns the
//! first one that can be read and decoded. A result with `index > 0` means the
//! newest backup(s) were unreadable and an older copy was used, which callers
//! surface as a rollback rather than a plain restore.
//!
//! ```text
//! backups:   [newest] ──✗──> [older] ──✗──> [oldest] ──✓
//! outcome:   Recovered { index: 2, tried: 3 }
//! ```
//!
//! How far back the engine goes is bounded by
//! [`RollbackOptions::max_retries`]: `0` only tries the newest backup, a
//! negative value tries all of them.

use crate::error::{Result, SafekeepError};
use crate::serializer::Serializer;
use crate::types::RollbackOptions;
use crate::utils;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Details of a restore that did not come from the newest backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackDetails {
    /// Backups attempted, newest first
    pub tried_paths: Vec<PathBuf>,
    /// Backup that finally restored, if any
    pub successful_path: Option<PathBuf>,
    /// Failure reason for each failed attempt
    pub reasons: Vec<String>,
}

/// Result of walking the backup chain
#[derive(Debug, Clone)]
pub enum RollbackOutcome<T> {
    /// A backup decoded successfully
    Recovered {
        /// Decoded value
        value: T,
        /// Raw bytes of the backup
        bytes: Vec<u8>,
        /// Position in the newest-first list (0 = latest)
        index: usize,
        /// Backup that restored
        path: PathBuf,
        /// Backups attempted including the successful one
        tried_paths: Vec<PathBuf>,
        /// Failure reason for each failed attempt before the success
        reasons: Vec<String>,
    },
    /// No attempted backup could be restored
    Exhausted {
        /// Backups attempted, newest first
        tried_paths: Vec<PathBuf>,
        /// Failure reason for each attempt
        reasons: Vec<String>,
    },
}

impl<T> RollbackOutcome<T> {
    /// Whether a value was recovered
    pub fn is_recovered(&self) -> bool {
        matches!(self, RollbackOutcome::Recovered { .. })
    }

    /// Whether recovery used something other than the newest backup, or failed
    pub fn is_rollback(&self) -> bool {
        match self {
            RollbackOutcome::Recovered { index, .. } => *index > 0,
            RollbackOutcome::Exhausted { .. } => true,
        }
    }

    /// Index of the backup that restored
    pub fn index(&self) -> Option<usize> {
        match self {
            RollbackOutcome::Recovered { index, .. } => Some(*index),
            RollbackOutcome::Exhausted { .. } => None,
        }
    }

    /// Recovered value, if any
    pub fn into_value(self) -> Option<T> {
        match self {
            RollbackOutcome::Recovered { value, .. } => Some(value),
            RollbackOutcome::Exhausted { .. } => None,
        }
    }

    /// Attempt history in the shape reported to rollback listeners
    pub fn details(&self) -> RollbackDetails {
        match self {
            RollbackOutcome::Recovered {
                path,
                tried_paths,
                reasons,
                ..
            } => RollbackDetails {
                tried_paths: tried_paths.clone(),
                successful_path: Some(path.clone()),
                reasons: reasons.clone(),
            },
            RollbackOutcome::Exhausted {
                tried_paths,
                reasons,
            } => RollbackDetails {
                tried_paths: tried_paths.clone(),
                successful_path: None,
                reasons: reasons.clone(),
            },
        }
    }

    /// Turn an exhausted outcome into [`SafekeepError::FullRollbackFailure`]
    /// when the options ask for it
    pub fn escalate(self, options: &RollbackOptions) -> Result<Self> {
        match self {
            RollbackOutcome::Exhausted {
                tried_paths,
                reasons,
            } if options.throw_on_all_failed => Err(SafekeepError::FullRollbackFailure {
                tried_paths,
                reasons,
            }),
            other => Ok(other),
        }
    }
}

/// Walks backups newest first until one decodes
#[derive(Debug, Clone, Default)]
pub struct RollbackEngine {
    options: RollbackOptions,
}

impl RollbackEngine {
    /// Create an engine with the given options
    pub fn new(options: RollbackOptions) -> Self {
        Self { options }
    }

    /// Options in effect
    pub fn options(&self) -> &RollbackOptions {
        &self.options
    }

    /// Try backups in order and apply `throw_on_all_failed`
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::FullRollbackFailure`] if nothing restored and the
    ///   options ask for an error
    pub async fn restore<T>(
        &self,
        backups: &[PathBuf],
        serializer: &dyn Serializer<T>,
    ) -> Result<RollbackOutcome<T>> {
        self.run(backups, serializer, &CancellationToken::new())
            .await?
            .escalate(&self.options)
    }

    /// Try backups in order, never escalating exhaustion
    ///
    /// # Errors
    ///
    /// - [`SafekeepError::Cancelled`] if `cancel` fires between attempts
    pub async fn run<T>(
        &self,
        backups: &[PathBuf],
        serializer: &dyn Serializer<T>,
        cancel: &CancellationToken,
    ) -> Result<RollbackOutcome<T>> {
        let limit = self.options.attempt_limit(backups.len());
        let mut tried_paths = Vec::with_capacity(limit);
        let mut reasons = Vec::with_capacity(limit);

        for (index, path) in backups.iter().take(limit).enumerate() {
            if index > 0 && !self.options.retry_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SafekeepError::Cancelled),
                    _ = tokio::time::sleep(self.options.retry_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(SafekeepError::Cancelled);
            }

            tried_paths.push(path.clone());
            match attempt(path, serializer).await {
                Ok((value, bytes)) => {
                    if index > 0 {
                        warn!(
                            "Restored from older backup {:?} after {} failed attempt(s)",
                            path, index
                        );
                    } else {
                        debug!("Restored from latest backup {:?}", path);
                    }
                    return Ok(RollbackOutcome::Recovered {
                        value,
                        bytes,
                        index,
                        path: path.clone(),
                        tried_paths,
                        reasons,
                    });
                }
                Err(e) => {
                    debug!("Backup {:?} unusable: {}", path, e);
                    reasons.push(e.to_string());
                }
            }
        }

        warn!(
            "No backup could be restored ({} of {} attempted)",
            tried_paths.len(),
            backups.len()
        );
        Ok(RollbackOutcome::Exhausted {
            tried_paths,
            reasons,
        })
    }
}

/// Read and decode a single backup
async fn attempt<T>(path: &Path, serializer: &dyn Serializer<T>) -> Result<(T, Vec<u8>)> {
    let bytes = utils::read_file(path).await?;
    let value = serializer.decode(&bytes)?;
    Ok((value, bytes))
}
