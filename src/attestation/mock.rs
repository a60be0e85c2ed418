use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use super::types::{PeerId, Phase};
use super::TrustEngine;
use crate::error::EngineError;

/// Mask applied by [`StaticTrustEngine::crypt`]. Reversible, not encryption.
const CRYPT_MASK: u8 = 0x5A;

/// In-memory trust engine for testing.
///
/// Produces the fixed payloads `"auth"`, `"verify"`, `"request key"` and
/// `"response key"`, and accepts exactly those payloads from the peer. Either
/// side can be overridden per phase to model a misbehaving or mismatched peer.
///
/// # Security Warning
///
/// This engine performs **zero attestation** and must never be used in
/// production. Enable it only via `features = ["mock"]` for development and
/// testing.
pub struct StaticTrustEngine {
    produced: HashMap<Phase, Bytes>,
    expected: HashMap<Phase, Bytes>,
    secret_key: bool,
    unavailable: Option<Phase>,
    calls: Mutex<Vec<EngineCall>>,
}

/// One recorded interaction with a [`StaticTrustEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Produce(Phase),
    Verify(Phase, Bytes),
}

/// Payload the double produces and expects for `phase` by default.
pub fn default_payload(phase: Phase) -> Bytes {
    Bytes::from_static(match phase {
        Phase::Auth => b"auth",
        Phase::Verify => b"verify",
        Phase::RequestKey => b"request key",
        Phase::ResponseKey => b"response key",
    })
}

impl StaticTrustEngine {
    pub fn new() -> Self {
        let defaults = || Phase::ALL.into_iter().map(|p| (p, default_payload(p))).collect();
        Self {
            produced: defaults(),
            expected: defaults(),
            secret_key: true,
            unavailable: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Produce `payload` instead of the default for `phase`.
    pub fn producing(mut self, phase: Phase, payload: impl Into<Bytes>) -> Self {
        self.produced.insert(phase, payload.into());
        self
    }

    /// Accept only `payload` from the peer for `phase`.
    pub fn expecting(mut self, phase: Phase, payload: impl Into<Bytes>) -> Self {
        self.expected.insert(phase, payload.into());
        self
    }

    /// Fail verification at `phase` as an engine outage rather than a rejection.
    pub fn unavailable_at(mut self, phase: Phase) -> Self {
        self.unavailable = Some(phase);
        self
    }

    /// Report whether a secret key is provisioned (default: true).
    pub fn with_secret_key(mut self, exists: bool) -> Self {
        self.secret_key = exists;
        self
    }

    /// Every produce/verify call made so far, in order.
    pub fn calls(&self) -> Vec<EngineCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Phases for which a peer payload was handed to verification.
    pub fn verified_phases(&self) -> Vec<Phase> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                EngineCall::Verify(phase, _) => Some(phase),
                EngineCall::Produce(_) => None,
            })
            .collect()
    }

    fn record(&self, call: EngineCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn produce_fixed(&self, phase: Phase) -> Result<Bytes, EngineError> {
        self.record(EngineCall::Produce(phase));
        Ok(self.produced[&phase].clone())
    }

    fn verify_fixed(&self, phase: Phase, data: &[u8]) -> Result<(), EngineError> {
        self.record(EngineCall::Verify(phase, Bytes::copy_from_slice(data)));
        if self.unavailable == Some(phase) {
            return Err(EngineError::Unreachable("engine went away".into()));
        }
        if data == &self.expected[&phase][..] {
            Ok(())
        } else {
            Err(EngineError::Rejected(format!("{phase} data error")))
        }
    }
}

impl Default for StaticTrustEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TrustEngine for StaticTrustEngine {
    async fn get_auth_data(&self, _peer: &PeerId) -> Result<Bytes, EngineError> {
        self.produce_fixed(Phase::Auth)
    }

    async fn verify_auth(&self, data: &[u8], _peer: &PeerId) -> Result<(), EngineError> {
        self.verify_fixed(Phase::Auth, data)
    }

    async fn get_verify_data(&self, _peer: &PeerId) -> Result<Bytes, EngineError> {
        self.produce_fixed(Phase::Verify)
    }

    async fn verify_remote_verify(&self, data: &[u8], _peer: &PeerId) -> Result<(), EngineError> {
        self.verify_fixed(Phase::Verify, data)
    }

    async fn get_request_key_data(&self, _peer: &PeerId) -> Result<Bytes, EngineError> {
        self.produce_fixed(Phase::RequestKey)
    }

    async fn verify_request_key_data(
        &self,
        data: &[u8],
        _peer: &PeerId,
    ) -> Result<(), EngineError> {
        self.verify_fixed(Phase::RequestKey, data)
    }

    async fn get_response_key_data(&self, _peer: &PeerId) -> Result<Bytes, EngineError> {
        self.produce_fixed(Phase::ResponseKey)
    }

    async fn verify_response_key(&self, data: &[u8], _peer: &PeerId) -> Result<(), EngineError> {
        self.verify_fixed(Phase::ResponseKey, data)
    }

    async fn check_secret_key(&self) -> Result<bool, EngineError> {
        Ok(self.secret_key)
    }

    async fn crypt(&self, data: &[u8]) -> Result<Bytes, EngineError> {
        Ok(data.iter().map(|b| b ^ CRYPT_MASK).collect::<Vec<_>>().into())
    }
}
