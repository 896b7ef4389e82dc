//! Error kinds shared by the receive and send pipelines.
//!
//! Wire parsing and configuration get their own narrow enums; `CoreError`
//! is the umbrella the pipelines report through their statistics and logs.

use std::io;
use thiserror::Error;

/// Wire-format parse failures (RTP, RTCP, SAP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    // ---
    #[error("packet too short")]
    TooShort,

    #[error("unsupported protocol version")]
    BadVersion,

    #[error("length field inconsistent with datagram size")]
    BadSize,

    #[error("header extension runs past end of packet")]
    BadExtension,
}

impl ParseError {
    // ---
    /// Stable label used for metrics and logs.
    pub fn kind(self) -> &'static str {
        // ---
        match self {
            ParseError::TooShort => "too_short",
            ParseError::BadVersion => "bad_version",
            ParseError::BadSize => "bad_size",
            ParseError::BadExtension => "bad_extension",
        }
    }
}

/// Rejected configuration value. The previous configuration stays active.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    // ---
    #[error("invalid port {0}")]
    InvalidPort(u16),

    #[error("invalid IPv4 address {0:?}")]
    InvalidAddress(String),

    #[error("unsupported sample rate {0} Hz")]
    UnsupportedSampleRate(u32),

    #[error("unsupported bit depth {0}")]
    UnsupportedBitDepth(u16),

    #[error("volume {0} outside 0.0..=1.0")]
    InvalidVolume(f32),

    #[error("invalid buffer sizing: {0}")]
    InvalidBuffer(String),

    #[error("unknown device mode {0:?}")]
    UnknownMode(String),

    #[error("mode {0} is not handled by this pipeline")]
    WrongMode(String),
}

/// Internal error kinds of the streaming core.
///
/// None of these abort the process: each is absorbed where it happens
/// and surfaced through counters and the periodic stats log.
#[derive(Debug, Error)]
pub enum CoreError {
    // ---
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("no usable clock mapping")]
    NotFound,

    #[error("jitter buffer overflow")]
    Overflow,

    #[error("jitter buffer underflow")]
    Underflow,

    #[error("transient I/O error: {0}")]
    IoTransient(#[source] io::Error),

    #[error("fatal I/O error: {0}")]
    IoFatal(#[source] io::Error),

    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
}

impl CoreError {
    // ---
    /// Returns true when a single retry is worth attempting.
    pub fn is_transient(&self) -> bool {
        // ---
        matches!(self, CoreError::IoTransient(_))
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        // ---
        match err.kind() {
            io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::OutOfMemory
            | io::ErrorKind::TimedOut => CoreError::IoTransient(err),
            _ => CoreError::IoFatal(err),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_io_error_classification() {
        // ---
        let eagain = io::Error::from(io::ErrorKind::WouldBlock);
        assert!(CoreError::from(eagain).is_transient());

        let enomem = io::Error::from(io::ErrorKind::OutOfMemory);
        assert!(CoreError::from(enomem).is_transient());

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(CoreError::from(refused), CoreError::IoFatal(_)));
    }

    #[test]
    fn test_parse_error_kind_labels() {
        // ---
        assert_eq!(ParseError::TooShort.kind(), "too_short");
        assert_eq!(ParseError::BadExtension.kind(), "bad_extension");
        let core: CoreError = ParseError::BadVersion.into();
        assert!(core.to_string().contains("version"));
    }
}
