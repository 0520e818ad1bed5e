//! Error taxonomy for the engines.
//!
//! Transport and verification failures are errors; a non-zero command exit
//! status is data carried on the [`Command`](crate::Command) and is never
//! turned into an error here.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Connection-establishment and protocol failures. Raised before any exit
/// status is recorded on the command being executed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection to {endpoint} failed: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("authentication failed for {endpoint}: {reason}")]
    Auth { endpoint: String, reason: String },

    #[error("protocol error on {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{operation} is not supported by the {transport} transport")]
    Unsupported {
        transport: &'static str,
        operation: &'static str,
    },
}

/// Aggregated localization failures: error code to the remote paths that
/// failed with it. Collected after every target was attempted.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CopyFailures(pub BTreeMap<i32, Vec<String>>);

impl CopyFailures {
    pub fn record(&mut self, code: i32, path: &str) {
        self.0.entry(code).or_default().push(path.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn path_count(&self) -> usize {
        self.0.values().map(|v| v.len()).sum()
    }
}

impl fmt::Display for CopyFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} directories failed", self.path_count())?;
        for (code, paths) in &self.0 {
            write!(f, "; code {code}: {}", paths.join(", "))?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("directory localization failed: {0}")]
    CopyFailed(CopyFailures),

    #[error("archive verification failed for {}: tar exited with {exit_code}", path.display())]
    ArchiveVerification { path: PathBuf, exit_code: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A restore step failed. Remaining steps are aborted; already-applied steps
/// are not rolled back (operator intervention is expected).
#[derive(Debug, thiserror::Error)]
#[error("restore step '{step}' failed for instance {instance}: {source}")]
pub struct RestoreError {
    pub step: crate::services::restore::RestoreStep,
    pub instance: i64,
    #[source]
    pub source: anyhow::Error,
}
