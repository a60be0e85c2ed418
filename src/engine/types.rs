use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

use crate::error::EngineError;

/// 20-byte account address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// 32-byte digest.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// An encrypted transaction produced and consumed only by the trust engine.
///
/// Immutable; clones share the same bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfidentialTransaction(Bytes);

impl ConfidentialTransaction {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    /// Keccak-256 of the encrypted bytes, the digest used for every
    /// identity in this crate.
    pub fn hash(&self) -> Hash {
        Hash(Keccak256::digest(&self.0).into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl fmt::Debug for ConfidentialTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfidentialTransaction")
            .field("hash", &self.hash())
            .field("size", &self.0.len())
            .finish()
    }
}

/// A plain transaction in its canonical binary encoding. The pool never looks
/// inside it; decoding belongs to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction(pub Bytes);

impl RawTransaction {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Where a transaction submission came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Submitted through this node's own API.
    Local,
    /// Received from the network.
    Remote,
}

/// Pool status of a transaction, as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Unknown,
    Queued,
    Pending,
    Included,
}

impl TxStatus {
    /// Out-of-range codes are reported as `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Queued,
            2 => Self::Pending,
            3 => Self::Included,
            _ => Self::Unknown,
        }
    }
}

/// Pending and queued transaction counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub pending: usize,
    pub queued: usize,
}

/// Outcome of submitting one confidential transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub hash: Hash,
    /// Engine-issued report proving the submission was processed.
    pub report: Bytes,
    pub error: Option<EngineError>,
}

impl SendResult {
    /// Result recorded for `tx` when the submission itself failed.
    pub fn failed(tx: &ConfidentialTransaction, error: EngineError) -> Self {
        Self {
            hash: tx.hash(),
            report: Bytes::new(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}
