//! Typed errors for the send pipeline.

use thiserror::Error;

/// Failures opening or reading a sample source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("input device unavailable: {0}")]
    Device(String),

    #[error("WAV input error: {0}")]
    Wav(#[from] hound::Error),

    #[error("unsupported WAV format: {0}")]
    Format(String),

    #[error("WAV file contains no samples")]
    Empty,
}

/// Why an announcement could not be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AnnounceError {
    #[error("SAP packet of {0} bytes exceeds the {1} byte limit")]
    TooLarge(usize, usize),
}
