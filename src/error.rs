//! Error types for framelink.
//!
//! I/O errors are held behind an `Arc` so that a single outcome can be
//! handed to every observer of a send or a session (the error type is
//! `Clone`).

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Main error type for all framelink operations.
#[derive(Debug, Clone, Error)]
pub enum FramelinkError {
    /// The dial operation failed to produce a transport.
    #[error("dial failed: {0}")]
    DialFailed(Arc<io::Error>),

    /// Reading a frame from the transport failed (short read, EOF, I/O error).
    #[error("transport read error: {0}")]
    TransportRead(Arc<io::Error>),

    /// Writing a frame to the transport failed (I/O error or short write).
    #[error("transport write error: {0}")]
    TransportWrite(Arc<io::Error>),

    /// A frame payload exceeds the configured maximum.
    #[error("frame payload of {size} bytes exceeds maximum {max}")]
    OversizedFrame {
        /// Declared or actual payload size.
        size: u64,
        /// Configured maximum payload size.
        max: u32,
    },

    /// The caller's own cancellation token or deadline fired before handoff.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection, client or server has been torn down.
    #[error("connection closed")]
    Closed,

    /// The session was stopped explicitly, without a transport fault.
    #[error("session closed by request")]
    ClosedByRequest,

    /// Payload (de)serialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FramelinkError {
    /// Wrap an I/O error raised while dialing.
    pub fn dial(err: io::Error) -> Self {
        Self::DialFailed(Arc::new(err))
    }

    /// Wrap an I/O error raised while reading.
    pub fn read(err: io::Error) -> Self {
        Self::TransportRead(Arc::new(err))
    }

    /// Wrap an I/O error raised while writing.
    pub fn write(err: io::Error) -> Self {
        Self::TransportWrite(Arc::new(err))
    }

    /// True for faults raised by the underlying transport.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::TransportRead(_) | Self::TransportWrite(_))
    }

    /// True when the message was never handed to the transport.
    ///
    /// Lets callers tell "never sent" apart from "sent but the write failed".
    pub fn never_sent(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Closed | Self::OversizedFrame { .. }
        )
    }
}

impl From<rmp_serde::encode::Error> for FramelinkError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FramelinkError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Result type alias using FramelinkError.
pub type Result<T> = std::result::Result<T, FramelinkError>;
