//! Messages of the remote engine protocol.
//!
//! Requests and responses travel as bincode payloads inside `Request` /
//! `Response` frames whose sequence number is the call id. Amounts are minimal
//! big-endian byte strings and batch results carry one error string per
//! element, empty meaning success.

use bytes::Bytes;
use primitive_types::U256;
use serde::{Deserialize, Serialize};

use super::types::{Address, Hash};
use crate::error::EngineError;
use crate::frame::{Frame, FrameType};

/// `crypt` method selector understood by the engine.
pub const CRYPT_METHOD_ENCRYPT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineRequest {
    GasPrice,
    SetPrice { price: Vec<u8> },
    PendingNonce { address: Address },
    Stats,
    Pending,
    Locals,
    AddLocals { txs: Vec<Vec<u8>> },
    AddRemotes { txs: Vec<Vec<u8>> },
    AddLocalConfidential { txs: Vec<Vec<u8>> },
    AddRemoteConfidential { txs: Vec<Vec<u8>> },
    Status { hashes: Vec<Hash> },
    Get { hash: Hash },
    Has { hash: Hash },
    CheckSecretKey,
    Crypt { method: u32, data: Vec<u8> },
    GetAuthData { peer_id: String },
    VerifyAuth { peer_id: String, data: Vec<u8> },
    GetVerifyData { peer_id: String },
    VerifyRemoteVerify { peer_id: String, data: Vec<u8> },
    GetRequestKeyData { peer_id: String },
    VerifyRequestKeyData { peer_id: String, data: Vec<u8> },
    GetResponseKeyData { peer_id: String },
    VerifyResponseKey { peer_id: String, data: Vec<u8> },
    /// Switches the connection to server streaming of new confidential transactions.
    SubscribeNewTransactions,
}

impl EngineRequest {
    /// Short name used in logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GasPrice => "gas_price",
            Self::SetPrice { .. } => "set_price",
            Self::PendingNonce { .. } => "pending_nonce",
            Self::Stats => "stats",
            Self::Pending => "pending",
            Self::Locals => "locals",
            Self::AddLocals { .. } => "add_locals",
            Self::AddRemotes { .. } => "add_remotes",
            Self::AddLocalConfidential { .. } => "add_local_confidential",
            Self::AddRemoteConfidential { .. } => "add_remote_confidential",
            Self::Status { .. } => "status",
            Self::Get { .. } => "get",
            Self::Has { .. } => "has",
            Self::CheckSecretKey => "check_secret_key",
            Self::Crypt { .. } => "crypt",
            Self::GetAuthData { .. } => "get_auth_data",
            Self::VerifyAuth { .. } => "verify_auth",
            Self::GetVerifyData { .. } => "get_verify_data",
            Self::VerifyRemoteVerify { .. } => "verify_remote_verify",
            Self::GetRequestKeyData { .. } => "get_request_key_data",
            Self::VerifyRequestKeyData { .. } => "verify_request_key_data",
            Self::GetResponseKeyData { .. } => "get_response_key_data",
            Self::VerifyResponseKey { .. } => "verify_response_key",
            Self::SubscribeNewTransactions => "subscribe_new_transactions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTransactions {
    pub address: Address,
    pub txs: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSendResult {
    pub hash: Hash,
    pub report: Vec<u8>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineResponse {
    Done,
    Price { price: Vec<u8> },
    Nonce { nonce: u64 },
    Stats { pending: u64, queued: u64 },
    Pending { accounts: Vec<AccountTransactions> },
    Locals { addresses: Vec<Address> },
    Added { errors: Vec<String> },
    ConfidentialAdded { results: Vec<WireSendResult> },
    Status { codes: Vec<u32> },
    Transaction { tx: Option<Vec<u8>> },
    Has { has: bool },
    SecretKey { exists: bool },
    Crypted { data: Vec<u8> },
    Attestation { data: Vec<u8> },
    /// Empty `error` means the payload was accepted.
    Verified { error: String },
}

pub fn encode_request(call_id: u32, request: &EngineRequest) -> Result<Frame, EngineError> {
    let payload = bincode::serialize(request).map_err(EngineError::protocol)?;
    Ok(Frame::request(call_id, Bytes::from(payload)))
}

pub fn decode_request(frame: &Frame) -> Result<EngineRequest, EngineError> {
    if frame.header.msg_type != FrameType::Request {
        return Err(EngineError::Protocol(format!(
            "expected request frame, got {:?}",
            frame.header.msg_type
        )));
    }
    bincode::deserialize(&frame.payload).map_err(EngineError::protocol)
}

pub fn encode_response(call_id: u32, response: &EngineResponse) -> Result<Frame, EngineError> {
    let payload = bincode::serialize(response).map_err(EngineError::protocol)?;
    Ok(Frame::response(call_id, Bytes::from(payload)))
}

/// Interpret the frame answering call `call_id`.
pub fn decode_response(call_id: u32, frame: &Frame) -> Result<EngineResponse, EngineError> {
    if frame.header.sequence != call_id {
        return Err(EngineError::Protocol(format!(
            "response for call {} while waiting for call {call_id}",
            frame.header.sequence
        )));
    }
    match frame.header.msg_type {
        FrameType::Response => bincode::deserialize(&frame.payload).map_err(EngineError::protocol),
        FrameType::EngineFailure => Err(EngineError::Remote(
            String::from_utf8_lossy(&frame.payload).into_owned(),
        )),
        other => Err(EngineError::Protocol(format!(
            "expected response frame, got {other:?}"
        ))),
    }
}

/// Minimal big-endian encoding; zero is the empty string.
pub fn amount_to_bytes(amount: U256) -> Vec<u8> {
    let mut buf = [0u8; 32];
    amount.to_big_endian(&mut buf);
    let first = buf.iter().position(|b| *b != 0).unwrap_or(32);
    buf[first..].to_vec()
}

pub fn amount_from_bytes(bytes: &[u8]) -> Result<U256, EngineError> {
    if bytes.len() > 32 {
        return Err(EngineError::Protocol(format!(
            "amount of {} bytes does not fit 256 bits",
            bytes.len()
        )));
    }
    Ok(U256::from_big_endian(bytes))
}
