pub mod types;

#[cfg(feature = "mock")]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::EngineError;
use types::{PeerId, Phase};

/// Capability boundary of the trust engine.
///
/// The engine produces and checks the payload of every handshake phase, and
/// offers two primitives used by transaction origination. Every operation may
/// block on a remote call. Verification methods return
/// [`EngineError::Rejected`] when the payload is refused; any other error
/// means the engine could not be consulted.
#[async_trait]
pub trait TrustEngine: Send + Sync {
    /// Generate the report that opens the exchange with `peer`.
    async fn get_auth_data(&self, peer: &PeerId) -> Result<Bytes, EngineError>;

    async fn verify_auth(&self, data: &[u8], peer: &PeerId) -> Result<(), EngineError>;

    /// Generate the report used by `peer` to verify us.
    async fn get_verify_data(&self, peer: &PeerId) -> Result<Bytes, EngineError>;

    async fn verify_remote_verify(&self, data: &[u8], peer: &PeerId) -> Result<(), EngineError>;

    /// Generate the secret-key request.
    async fn get_request_key_data(&self, peer: &PeerId) -> Result<Bytes, EngineError>;

    async fn verify_request_key_data(
        &self,
        data: &[u8],
        peer: &PeerId,
    ) -> Result<(), EngineError>;

    /// Generate the answer to the peer's key request.
    async fn get_response_key_data(&self, peer: &PeerId) -> Result<Bytes, EngineError>;

    async fn verify_response_key(&self, data: &[u8], peer: &PeerId) -> Result<(), EngineError>;

    /// Whether a signing/encryption credential is already provisioned locally.
    async fn check_secret_key(&self) -> Result<bool, EngineError>;

    /// Encrypt `data` under the engine-managed key.
    async fn crypt(&self, data: &[u8]) -> Result<Bytes, EngineError>;

    /// Produce the local payload for `phase`.
    async fn produce(&self, phase: Phase, peer: &PeerId) -> Result<Bytes, EngineError> {
        match phase {
            Phase::Auth => self.get_auth_data(peer).await,
            Phase::Verify => self.get_verify_data(peer).await,
            Phase::RequestKey => self.get_request_key_data(peer).await,
            Phase::ResponseKey => self.get_response_key_data(peer).await,
        }
    }

    /// Check the peer's payload for `phase`.
    async fn verify(&self, phase: Phase, data: &[u8], peer: &PeerId) -> Result<(), EngineError> {
        match phase {
            Phase::Auth => self.verify_auth(data, peer).await,
            Phase::Verify => self.verify_remote_verify(data, peer).await,
            Phase::RequestKey => self.verify_request_key_data(data, peer).await,
            Phase::ResponseKey => self.verify_response_key(data, peer).await,
        }
    }
}
