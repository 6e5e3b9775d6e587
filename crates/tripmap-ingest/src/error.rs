//! Error types for the ingest engine.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
///
/// Source open/decode failures inside a running ingest are not errors here:
/// they end the affected stream and are reported in
/// [`IngestStats`](crate::IngestStats) instead.
#[derive(Error, Debug)]
pub enum Error {
    /// A directory that must be listed could not be.
    #[error("cannot list {}: {source}", .path.display())]
    Enumerate {
        /// The directory being listed.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Session database file does not exist.
    #[error("session database not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Session database file is not a valid database.
    #[error("session database decode error: {0}")]
    Decode(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Adding trips to a database that already holds trips.
    #[error("incremental ingest is not supported: database already holds {trips} trips")]
    IncrementalIngestUnsupported {
        /// Number of trips already recorded.
        trips: usize,
    },

    /// The run was abandoned through the shutdown flag.
    #[error("ingest cancelled")]
    Cancelled,

    /// A pipeline thread panicked.
    #[error("{0} thread panicked")]
    WorkerPanicked(&'static str),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Decoder error.
    #[error(transparent)]
    Core(#[from] tripmap_core::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_display() {
        let err = Error::Enumerate {
            path: PathBuf::from("/data/log"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/data/log"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_incremental_display() {
        let err = Error::IncrementalIngestUnsupported { trips: 3 };
        assert!(err.to_string().contains("3 trips"));
    }

    #[test]
    fn test_from_core_error() {
        let err: Error = tripmap_core::Error::UnsupportedLinkType(9).into();
        assert!(matches!(err, Error::Core(_)));
        assert_eq!(err.to_string(), "unsupported link type 9");
    }
}
