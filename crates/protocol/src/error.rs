//! Error types for the protocol crate.

use std::fmt;

use thiserror::Error;

/// The protocol phase an operation was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Connection handshake and authentication.
    Handshake,
    /// Opening a stream.
    Open,
    /// Writing to a stream.
    Write,
    /// Reading from a stream.
    Read,
    /// A file-sync exchange.
    Sync,
    /// Closing streams or the transport.
    Close,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Handshake => "handshake",
            Phase::Open => "open",
            Phase::Write => "write",
            Phase::Read => "read",
            Phase::Sync => "sync",
            Phase::Close => "close",
        };
        f.write_str(name)
    }
}

/// Error type covering every failure mode of the ADB engine.
#[derive(Debug, Error)]
pub enum AdbError {
    // Framing errors
    /// Malformed header, unknown command, or checksum/magic mismatch.
    #[error("framing error: {0}")]
    Framing(String),

    /// Payload exceeds the negotiated maximum.
    #[error("payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge {
        /// Actual payload size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Transport errors
    /// A read or write did not complete in time.
    #[error("{phase} timed out: {detail}")]
    Timeout {
        /// Phase the timeout occurred in.
        phase: Phase,
        /// What was being waited for.
        detail: String,
    },

    /// The transport reached end of stream or was reset.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Any other transport failure.
    #[error("transport error: {0}")]
    Transport(std::io::Error),

    // Handshake errors
    /// The device refused every signature and the offered public key.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The connection banner does not have the `state::props` shape.
    #[error("malformed device banner: {0:?}")]
    MalformedBanner(String),

    /// Unexpected message type or mismatched identifiers.
    #[error("protocol violation: {0}")]
    Protocol(String),

    // Stream errors
    /// The device rejected the requested service.
    #[error("device refused to open stream for {destination:?}")]
    StreamOpen {
        /// The destination that was refused.
        destination: String,
    },

    /// The stream is closed, locally or by the device.
    #[error("stream {local_id} is closed")]
    StreamClosed {
        /// Local id of the closed stream.
        local_id: u32,
    },

    // Sync errors
    /// The device reported a file-sync failure.
    #[error("sync failed: {0}")]
    Sync(String),

    // Local input errors
    /// Input rejected before any I/O because it cannot fit the protocol.
    #[error("overflow: {0}")]
    Overflow(String),

    /// Unusable key material.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Reading a local push source or writing a local pull sink failed.
    #[error("local I/O error: {0}")]
    LocalIo(std::io::Error),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, AdbError>;

impl AdbError {
    /// Returns the phase a timeout occurred in, if this is a timeout.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            AdbError::Timeout { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    /// Whether the connection is unusable after this error.
    ///
    /// Stream-scoped errors (open refusal, closed stream, sync failure,
    /// local overflow) leave other streams usable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdbError::Framing(_)
                | AdbError::ConnectionClosed(_)
                | AdbError::Transport(_)
                | AdbError::Authentication(_)
                | AdbError::MalformedBanner(_)
                | AdbError::Protocol(_)
        )
    }

    /// Re-tags a timeout with the phase of the operation that observed it.
    pub(crate) fn during(self, phase: Phase) -> Self {
        match self {
            AdbError::Timeout { detail, .. } => AdbError::Timeout { phase, detail },
            other => other,
        }
    }
}

impl From<std::io::Error> for AdbError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => AdbError::Timeout {
                phase: Phase::Read,
                detail: err.to_string(),
            },
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => AdbError::ConnectionClosed(err.to_string()),
            _ => AdbError::Transport(err),
        }
    }
}
