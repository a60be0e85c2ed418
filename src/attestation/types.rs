use std::fmt;

use sha3::{Digest, Keccak256};

/// One step of the attestation handshake. Phases run strictly in the order of
/// [`Phase::ALL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    Auth,
    Verify,
    RequestKey,
    ResponseKey,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Auth,
        Phase::Verify,
        Phase::RequestKey,
        Phase::ResponseKey,
    ];

    /// Zero-based position in the handshake.
    pub const fn index(self) -> u32 {
        match self {
            Phase::Auth => 0,
            Phase::Verify => 1,
            Phase::RequestKey => 2,
            Phase::ResponseKey => 3,
        }
    }

    pub fn from_index(index: u32) -> Option<Self> {
        Self::ALL.get(index as usize).copied()
    }

    /// The phase that follows this one, `None` after the last.
    pub fn next(self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Auth => "auth",
            Phase::Verify => "verify",
            Phase::RequestKey => "request-key",
            Phase::ResponseKey => "response-key",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fingerprint of a remote node's transport identity.
///
/// The engine receives it as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the fingerprint from the peer's authenticated transport public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(Keccak256::digest(public_key).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Shortened like node ids in logs.
        write!(f, "PeerId({}…)", &self.to_hex()[..16])
    }
}
