//! HJ/T212 protocol error types.

use thiserror::Error;

/// Errors raised while framing or exchanging HJ/T212 data.
#[derive(Error, Debug)]
pub enum Hj212Error {
    /// IO error during socket operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to establish connection to the server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A phase deadline expired.
    #[error("Timeout during {0}")]
    Timeout(&'static str),

    /// Frame does not start with `##`.
    #[error("Frame marker missing")]
    MissingMarker,

    /// Frame does not end with `\r\n`.
    #[error("Frame terminator missing")]
    MissingTerminator,

    /// Frame too short to carry a checksum.
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    /// The four checksum characters are not hex digits.
    #[error("Invalid checksum digits: {0:?}")]
    InvalidChecksumDigits(String),

    /// Neither frame variant validates against the trailing checksum.
    #[error("Checksum mismatch: frame carries {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Data segment contains bytes outside 7-bit ASCII.
    #[error("Data segment is not ASCII")]
    NonAscii,
}

/// Result type for HJ/T212 protocol operations.
pub type Result<T> = std::result::Result<T, Hj212Error>;
