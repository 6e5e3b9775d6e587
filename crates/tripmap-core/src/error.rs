//! Error types for the tripmap source decoders.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while decoding GPS logs and packet captures.
#[derive(Error, Debug)]
pub enum Error {
    /// A GPS log line is not a sentence we can decode.
    #[error("invalid NMEA sentence: {0}")]
    InvalidSentence(String),

    /// A sentence field has an invalid format (e.g., non-numeric latitude).
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// The name of the invalid field.
        field: &'static str,
        /// Description of what's wrong.
        reason: String,
    },

    /// The capture file header is not a classic pcap header.
    #[error("invalid capture: {0}")]
    InvalidCapture(String),

    /// The capture uses a link-layer type we cannot extract addresses from.
    #[error("unsupported link type {0}")]
    UnsupportedLinkType(u32),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
