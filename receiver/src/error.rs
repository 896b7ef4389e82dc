//! Typed errors for the receive pipeline.

use scream_rtp_common::CoreError;
use thiserror::Error;

/// Why a packet could not be mapped to a playout time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("SSRC is not tracked")]
    UnknownSsrc,

    #[error("no sender report has seeded the mapping")]
    Unseeded,

    #[error("last sender report is older than the freshness limit")]
    Stale,

    #[error("playout time is too far in the future")]
    TooEarly,

    #[error("playout time has already passed")]
    TooLate,
}

impl SyncError {
    /// The `NotFound` family: no usable mapping exists for this SSRC.
    pub fn is_not_found(self) -> bool {
        // ---
        matches!(self, Self::UnknownSsrc | Self::Unseeded | Self::Stale)
    }
}

impl From<SyncError> for CoreError {
    fn from(e: SyncError) -> Self {
        // ---
        match e {
            SyncError::TooEarly => CoreError::Overflow,
            SyncError::TooLate => CoreError::Underflow,
            _ => CoreError::NotFound,
        }
    }
}

/// `JitterBuffer::pop` outcomes that yield no chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("jitter buffer is empty")]
    Empty,

    #[error("jitter buffer is refilling after an underrun")]
    Underrun,
}

/// Failures reported by a sample sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("chunk of {0} bytes is not a whole number of frames")]
    BadLength(usize),

    #[error("output device unavailable: {0}")]
    Device(String),

    #[error("sink I/O failed")]
    Io(#[from] std::io::Error),

    #[error("wav encoding failed")]
    Wav(#[from] hound::Error),
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_not_found_family() {
        // ---
        assert!(SyncError::UnknownSsrc.is_not_found());
        assert!(SyncError::Unseeded.is_not_found());
        assert!(SyncError::Stale.is_not_found());
        assert!(!SyncError::TooEarly.is_not_found());
        assert!(!SyncError::TooLate.is_not_found());

        assert!(matches!(CoreError::from(SyncError::Stale), CoreError::NotFound));
        assert!(matches!(CoreError::from(SyncError::TooLate), CoreError::Underflow));
    }
}
