use std::io;

use crate::attestation::types::Phase;

/// Errors from frame parsing and encoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid magic bytes: expected 0xC754, got 0x{0:04X}")]
    InvalidMagic(u16),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u32, max: u32 },

    #[error("malformed batch payload: {0}")]
    MalformedBatch(&'static str),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors from calls against the trust engine.
///
/// `Clone` so that one failed remote call can be reported against every
/// element of a batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("trust engine unreachable: {0}")]
    Unreachable(String),

    #[error("trust engine call timed out")]
    Timeout,

    #[error("trust engine call failed: {0}")]
    Remote(String),

    /// The engine evaluated the input and refused it.
    #[error("rejected by trust engine: {0}")]
    Rejected(String),

    #[error("trust engine protocol violation: {0}")]
    Protocol(String),
}

impl EngineError {
    pub(crate) fn unreachable(err: impl std::fmt::Display) -> Self {
        Self::Unreachable(err.to_string())
    }

    pub(crate) fn protocol(err: impl std::fmt::Display) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Errors that end an attestation handshake. Every variant is fatal: the
/// session is discarded and the caller has to redial to try again.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake timeout")]
    Timeout,

    #[error("{phase} phase: transport failure: {source}")]
    Transport {
        phase: Phase,
        #[source]
        source: FrameError,
    },

    #[error("{phase} phase: connection closed by peer")]
    Closed { phase: Phase },

    #[error("unexpected message during {expected} phase: {actual}")]
    UnexpectedMessage { expected: Phase, actual: String },

    #[error("{phase} phase: trust engine unavailable: {source}")]
    Engine {
        phase: Phase,
        #[source]
        source: EngineError,
    },

    #[error("peer attestation rejected at {phase} phase: {reason}")]
    Rejected { phase: Phase, reason: String },

    #[error("peer refused our attestation at {phase} phase: {reason}")]
    PeerRejected { phase: Phase, reason: String },
}

impl HandshakeError {
    /// Phase the handshake was in when it failed, if it got that far.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Timeout => None,
            Self::Transport { phase, .. }
            | Self::Closed { phase }
            | Self::Engine { phase, .. }
            | Self::Rejected { phase, .. }
            | Self::PeerRejected { phase, .. } => Some(*phase),
            Self::UnexpectedMessage { expected, .. } => Some(*expected),
        }
    }

    /// Whether one side refused the other's attestation payload.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::PeerRejected { .. })
    }
}

/// Errors from a peer session after (or instead of) the handshake.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session has not completed attestation")]
    NotTrusted,

    #[error("session closed")]
    Closed,

    #[error("unexpected message type: expected {expected}, got {actual}")]
    UnexpectedMessage {
        expected: &'static str,
        actual: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
