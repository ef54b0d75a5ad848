//! Error types for provisioning operations.
//!
//! Everything here is fatal for the current device. A failed verify is not
//! an error: it is reported as `Outcome::ProgrammingFailed` once the probe
//! link has been released.

use std::path::PathBuf;
use thiserror::Error;

use keyburn_core::{CoreError, KeyFileName, Uid};

use crate::probe::ProbeError;
use crate::provisioner::SessionState;

/// Errors that abort a provisioning session.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The debug probe could not be reached; no device state was touched
    #[error("Connect error: {0}")]
    Connect(#[source] ProbeError),

    /// No unused key files remain for a new device
    #[error("Key pool exhausted: no unused key files in {}", dir.display())]
    PoolExhausted { dir: PathBuf },

    /// The provisioning database holds a row that cannot be trusted
    #[error("Corrupt record in {}:{line}: {reason}", path.display())]
    CorruptRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// A record for this UID or key file already exists
    #[error("Assignment conflict: {uid} -> {key_file}: {reason}")]
    AssignmentConflict {
        uid: Uid,
        key_file: KeyFileName,
        reason: String,
    },

    /// A probe call failed before the key region was touched
    #[error("Probe error during {state}: {source}")]
    Probe {
        state: SessionState,
        #[source]
        source: ProbeError,
    },

    /// The selected key blob cannot be programmed
    #[error("Unusable key file {}: {reason}", path.display())]
    KeyFile { path: PathBuf, reason: String },

    /// Filesystem failure on the key store
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration or identifier validation errors
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvisionError>;

/// Attach a path to an I/O error.
pub(crate) fn io_error(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> ProvisionError {
    let path = path.into();
    move |source| ProvisionError::Io { path, source }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProvisionError::PoolExhausted {
            dir: PathBuf::from("keys"),
        };
        assert_eq!(err.to_string(), "Key pool exhausted: no unused key files in keys");

        let err = ProvisionError::CorruptRecord {
            path: PathBuf::from("keys/used_keys.csv"),
            line: 4,
            reason: "expected 3 fields, got 2".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Corrupt record in keys/used_keys.csv:4: expected 3 fields, got 2"
        );
    }

    #[test]
    fn test_io_error_keeps_path() {
        let err = io_error("keys/1A2B")(std::io::Error::from(std::io::ErrorKind::NotFound));
        match err {
            ProvisionError::Io { path, source } => {
                assert_eq!(path, PathBuf::from("keys/1A2B"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
