use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use primitive_types::U256;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

use super::types::{
    Address, ConfidentialTransaction, Hash, Origin, PoolStats, RawTransaction, SendResult,
    TxStatus,
};
use super::wire::{self, EngineRequest, EngineResponse, WireSendResult};
use super::EngineConfig;
use crate::attestation::types::PeerId;
use crate::attestation::TrustEngine;
use crate::error::EngineError;
use crate::frame::codec::FrameCodec;
use crate::frame::{batch, Frame, FrameType};
use crate::subscriber::{TxBatchStream, TxFeed};
use crate::transport::tcp;

/// Remote-call facade for the trust engine.
///
/// Non-streaming calls draw a connection from a small idle pool, dialling a
/// new one when none is free, so concurrent callers never queue behind each
/// other. A connection goes back to the pool only after a well-formed answer;
/// a failed, timed-out or cancelled call discards it. Calls are never retried
/// internally.
pub struct EngineClient {
    config: EngineConfig,
    idle: Mutex<Vec<Connection>>,
    next_call_id: AtomicU32,
}

struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    codec: FrameCodec,
}

impl Connection {
    async fn open(config: &EngineConfig) -> Result<Self, EngineError> {
        let stream = tcp::dial(&config.endpoint, config.connect_timeout).await?;

        tracing::debug!(endpoint = %config.endpoint, "connected to trust engine");

        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            codec: FrameCodec::with_max_payload_size(config.max_payload_size),
        })
    }

    async fn send(&mut self, frame: Frame) -> Result<(), EngineError> {
        let mut buf = BytesMut::new();
        self.codec
            .encode(frame, &mut buf)
            .map_err(EngineError::protocol)?;
        self.stream
            .write_all(&buf)
            .await
            .map_err(EngineError::unreachable)?;
        self.stream.flush().await.map_err(EngineError::unreachable)?;
        Ok(())
    }

    /// Next frame, or `None` once the engine closed the connection.
    async fn recv(&mut self) -> Result<Option<Frame>, EngineError> {
        loop {
            if let Some(frame) = self
                .codec
                .decode(&mut self.read_buf)
                .map_err(EngineError::protocol)?
            {
                return Ok(Some(frame));
            }
            let n = self
                .stream
                .read_buf(&mut self.read_buf)
                .await
                .map_err(EngineError::unreachable)?;
            if n == 0 {
                return Ok(None);
            }
        }
    }

    async fn round_trip(
        &mut self,
        call_id: u32,
        request: &EngineRequest,
    ) -> Result<EngineResponse, EngineError> {
        self.send(wire::encode_request(call_id, request)?).await?;
        let reply = self
            .recv()
            .await?
            .ok_or_else(|| EngineError::Unreachable("engine closed the connection".into()))?;
        wire::decode_response(call_id, &reply)
    }
}

fn unexpected(request: &'static str, response: EngineResponse) -> EngineError {
    EngineError::Protocol(format!("unexpected response to {request}: {response:?}"))
}

/// Map per-element error strings onto the submitted batch.
fn align_errors(len: usize, errors: Vec<String>) -> Vec<Result<(), EngineError>> {
    if errors.len() != len {
        let err = EngineError::Protocol(format!(
            "engine returned {} results for {len} transactions",
            errors.len()
        ));
        return vec![Err(err); len];
    }
    errors
        .into_iter()
        .map(|e| {
            if e.is_empty() {
                Ok(())
            } else {
                Err(EngineError::Rejected(e))
            }
        })
        .collect()
}

fn align_send_results(
    txs: &[ConfidentialTransaction],
    results: Vec<WireSendResult>,
) -> Vec<SendResult> {
    if results.len() != txs.len() {
        let err = EngineError::Protocol(format!(
            "engine returned {} results for {} transactions",
            results.len(),
            txs.len()
        ));
        return txs.iter().map(|tx| SendResult::failed(tx, err.clone())).collect();
    }
    txs.iter()
        .zip(results)
        .map(|(tx, result)| {
            if result.error.is_empty() {
                SendResult {
                    hash: result.hash,
                    report: Bytes::from(result.report),
                    error: None,
                }
            } else {
                SendResult::failed(tx, EngineError::Rejected(result.error))
            }
        })
        .collect()
}

fn verified(request: &'static str, response: EngineResponse) -> Result<(), EngineError> {
    match response {
        EngineResponse::Verified { error } if error.is_empty() => Ok(()),
        EngineResponse::Verified { error } => Err(EngineError::Rejected(error)),
        other => Err(unexpected(request, other)),
    }
}

fn attestation(request: &'static str, response: EngineResponse) -> Result<Bytes, EngineError> {
    match response {
        EngineResponse::Attestation { data } => Ok(Bytes::from(data)),
        other => Err(unexpected(request, other)),
    }
}

impl EngineClient {
    /// Create a client for the engine described by `config`. No connection is
    /// made until the first call.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            idle: Mutex::new(Vec::new()),
            next_call_id: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Issue one request and wait for its answer. `request_timeout` covers
    /// dialling as well as the round trip.
    pub async fn call(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);

        let exchange = async {
            let mut conn = match self.checkout() {
                Some(conn) => conn,
                None => Connection::open(&self.config).await?,
            };
            let result = conn.round_trip(call_id, &request).await;
            // A failure reported by the engine leaves the connection in sync.
            if matches!(result, Ok(_) | Err(EngineError::Remote(_))) {
                self.checkin(conn);
            }
            result
        };

        let result = match tokio::time::timeout(self.config.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout),
        };

        if let Err(ref e) = result {
            tracing::debug!(call = request.name(), call_id, error = %e, "engine call failed");
        }
        result
    }

    fn checkout(&self) -> Option<Connection> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    fn checkin(&self, conn: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.config.max_idle_connections {
                idle.push(conn);
            }
        }
    }

    /// Readiness probe: the engine answers a gas price query.
    pub async fn ready(&self) -> bool {
        match self.gas_price().await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(endpoint = %self.config.endpoint, error = %e, "trust engine not ready");
                false
            }
        }
    }

    pub async fn gas_price(&self) -> Result<U256, EngineError> {
        match self.call(EngineRequest::GasPrice).await? {
            EngineResponse::Price { price } => wire::amount_from_bytes(&price),
            other => Err(unexpected("gas_price", other)),
        }
    }

    pub async fn set_price(&self, price: U256) -> Result<(), EngineError> {
        let request = EngineRequest::SetPrice {
            price: wire::amount_to_bytes(price),
        };
        match self.call(request).await? {
            EngineResponse::Done => Ok(()),
            other => Err(unexpected("set_price", other)),
        }
    }

    /// Next nonce of `address` with every pool transaction applied.
    pub async fn nonce(&self, address: Address) -> Result<u64, EngineError> {
        match self.call(EngineRequest::PendingNonce { address }).await? {
            EngineResponse::Nonce { nonce } => Ok(nonce),
            other => Err(unexpected("pending_nonce", other)),
        }
    }

    pub async fn stats(&self) -> Result<PoolStats, EngineError> {
        match self.call(EngineRequest::Stats).await? {
            EngineResponse::Stats { pending, queued } => Ok(PoolStats {
                pending: pending as usize,
                queued: queued as usize,
            }),
            other => Err(unexpected("stats", other)),
        }
    }

    /// Processable plain transactions grouped by sender.
    pub async fn pending(&self) -> Result<BTreeMap<Address, Vec<RawTransaction>>, EngineError> {
        match self.call(EngineRequest::Pending).await? {
            EngineResponse::Pending { accounts } => Ok(accounts
                .into_iter()
                .map(|account| {
                    let txs = account.txs.into_iter().map(RawTransaction::new).collect();
                    (account.address, txs)
                })
                .collect()),
            other => Err(unexpected("pending", other)),
        }
    }

    /// Accounts the engine treats as local.
    pub async fn locals(&self) -> Result<Vec<Address>, EngineError> {
        match self.call(EngineRequest::Locals).await? {
            EngineResponse::Locals { addresses } => Ok(addresses),
            other => Err(unexpected("locals", other)),
        }
    }

    /// Submit plain transactions. One result per input, in input order.
    pub async fn add_transactions(
        &self,
        origin: Origin,
        txs: &[RawTransaction],
    ) -> Vec<Result<(), EngineError>> {
        let payload = txs.iter().map(|tx| tx.as_bytes().to_vec()).collect();
        let request = match origin {
            Origin::Local => EngineRequest::AddLocals { txs: payload },
            Origin::Remote => EngineRequest::AddRemotes { txs: payload },
        };
        let name = request.name();
        match self.call(request).await {
            Ok(EngineResponse::Added { errors }) => align_errors(txs.len(), errors),
            Ok(other) => vec![Err(unexpected(name, other)); txs.len()],
            Err(e) => vec![Err(e); txs.len()],
        }
    }

    /// Submit confidential transactions. One result per input, in input order;
    /// if the call itself fails every result carries that failure.
    pub async fn add_confidential(
        &self,
        origin: Origin,
        txs: &[ConfidentialTransaction],
    ) -> Vec<SendResult> {
        let payload = txs.iter().map(|tx| tx.as_bytes().to_vec()).collect();
        let request = match origin {
            Origin::Local => EngineRequest::AddLocalConfidential { txs: payload },
            Origin::Remote => EngineRequest::AddRemoteConfidential { txs: payload },
        };
        let name = request.name();
        let results = match self.call(request).await {
            Ok(EngineResponse::ConfidentialAdded { results }) => align_send_results(txs, results),
            Ok(other) => {
                let err = unexpected(name, other);
                txs.iter().map(|tx| SendResult::failed(tx, err.clone())).collect()
            }
            Err(e) => txs.iter().map(|tx| SendResult::failed(tx, e.clone())).collect(),
        };
        tracing::debug!(
            origin = ?origin,
            submitted = txs.len(),
            accepted = results.iter().filter(|r| r.is_ok()).count(),
            "confidential transactions submitted"
        );
        results
    }

    /// Submit one locally originated confidential transaction.
    pub async fn add_local_confidential(
        &self,
        tx: &ConfidentialTransaction,
    ) -> Result<SendResult, EngineError> {
        let mut results = self
            .add_confidential(Origin::Local, std::slice::from_ref(tx))
            .await;
        let result = results
            .pop()
            .ok_or_else(|| EngineError::Protocol("no result for submitted transaction".into()))?;
        match result.error {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    pub async fn status(&self, hashes: &[Hash]) -> Result<Vec<TxStatus>, EngineError> {
        let request = EngineRequest::Status {
            hashes: hashes.to_vec(),
        };
        match self.call(request).await? {
            EngineResponse::Status { codes } if codes.len() == hashes.len() => {
                Ok(codes.into_iter().map(TxStatus::from_code).collect())
            }
            EngineResponse::Status { codes } => Err(EngineError::Protocol(format!(
                "engine returned {} statuses for {} hashes",
                codes.len(),
                hashes.len()
            ))),
            other => Err(unexpected("status", other)),
        }
    }

    pub async fn get(&self, hash: Hash) -> Result<Option<RawTransaction>, EngineError> {
        match self.call(EngineRequest::Get { hash }).await? {
            EngineResponse::Transaction { tx } => Ok(tx.map(RawTransaction::new)),
            other => Err(unexpected("get", other)),
        }
    }

    pub async fn has(&self, hash: Hash) -> Result<bool, EngineError> {
        match self.call(EngineRequest::Has { hash }).await? {
            EngineResponse::Has { has } => Ok(has),
            other => Err(unexpected("has", other)),
        }
    }

    /// Open the server stream of newly observed confidential transactions on a
    /// dedicated connection. Returns once the engine acknowledged the subscription.
    pub async fn subscribe_new_transactions(&self) -> Result<EngineTxStream, EngineError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let open = async {
            let mut conn = Connection::open(&self.config).await?;
            match conn
                .round_trip(call_id, &EngineRequest::SubscribeNewTransactions)
                .await?
            {
                EngineResponse::Done => Ok::<_, EngineError>(conn),
                other => Err(unexpected("subscribe_new_transactions", other)),
            }
        };
        let conn = tokio::time::timeout(self.config.request_timeout, open)
            .await
            .map_err(|_| EngineError::Timeout)??;

        tracing::info!(endpoint = %self.config.endpoint, "subscribed to new confidential transactions");
        Ok(EngineTxStream { conn, received: 0 })
    }
}

/// Server stream of confidential transaction batches. Dropping it closes the
/// underlying connection.
pub struct EngineTxStream {
    conn: Connection,
    received: u64,
}

impl EngineTxStream {
    /// Next batch in arrival order; `None` when the engine ended the stream.
    pub async fn next_batch(&mut self) -> Result<Option<Vec<ConfidentialTransaction>>, EngineError> {
        let Some(frame) = self.conn.recv().await? else {
            return Ok(None);
        };
        match frame.header.msg_type {
            FrameType::StreamBatch => {
                let txs = batch::decode(frame.payload).map_err(EngineError::protocol)?;
                self.received += 1;
                Ok(Some(txs))
            }
            FrameType::EngineFailure => Err(EngineError::Remote(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            other => Err(EngineError::Protocol(format!(
                "unexpected {other:?} frame on transaction stream"
            ))),
        }
    }

    /// Number of batches received so far.
    pub fn batches_received(&self) -> u64 {
        self.received
    }
}

#[async_trait]
impl TxBatchStream for EngineTxStream {
    async fn next_batch(&mut self) -> Result<Option<Vec<ConfidentialTransaction>>, EngineError> {
        EngineTxStream::next_batch(self).await
    }
}

#[async_trait]
impl TxFeed for EngineClient {
    async fn ready(&self) -> bool {
        EngineClient::ready(self).await
    }

    async fn subscribe(&self) -> Result<Box<dyn TxBatchStream>, EngineError> {
        let stream = self.subscribe_new_transactions().await?;
        Ok(Box::new(stream))
    }
}

#[async_trait]
impl TrustEngine for EngineClient {
    async fn get_auth_data(&self, peer: &PeerId) -> Result<Bytes, EngineError> {
        let request = EngineRequest::GetAuthData {
            peer_id: peer.to_hex(),
        };
        attestation("get_auth_data", self.call(request).await?)
    }

    async fn verify_auth(&self, data: &[u8], peer: &PeerId) -> Result<(), EngineError> {
        let request = EngineRequest::VerifyAuth {
            peer_id: peer.to_hex(),
            data: data.to_vec(),
        };
        verified("verify_auth", self.call(request).await?)
    }

    async fn get_verify_data(&self, peer: &PeerId) -> Result<Bytes, EngineError> {
        let request = EngineRequest::GetVerifyData {
            peer_id: peer.to_hex(),
        };
        attestation("get_verify_data", self.call(request).await?)
    }

    async fn verify_remote_verify(&self, data: &[u8], peer: &PeerId) -> Result<(), EngineError> {
        let request = EngineRequest::VerifyRemoteVerify {
            peer_id: peer.to_hex(),
            data: data.to_vec(),
        };
        verified("verify_remote_verify", self.call(request).await?)
    }

    async fn get_request_key_data(&self, peer: &PeerId) -> Result<Bytes, EngineError> {
        let request = EngineRequest::GetRequestKeyData {
            peer_id: peer.to_hex(),
        };
        attestation("get_request_key_data", self.call(request).await?)
    }

    async fn verify_request_key_data(
        &self,
        data: &[u8],
        peer: &PeerId,
    ) -> Result<(), EngineError> {
        let request = EngineRequest::VerifyRequestKeyData {
            peer_id: peer.to_hex(),
            data: data.to_vec(),
        };
        verified("verify_request_key_data", self.call(request).await?)
    }

    async fn get_response_key_data(&self, peer: &PeerId) -> Result<Bytes, EngineError> {
        let request = EngineRequest::GetResponseKeyData {
            peer_id: peer.to_hex(),
        };
        attestation("get_response_key_data", self.call(request).await?)
    }

    async fn verify_response_key(&self, data: &[u8], peer: &PeerId) -> Result<(), EngineError> {
        let request = EngineRequest::VerifyResponseKey {
            peer_id: peer.to_hex(),
            data: data.to_vec(),
        };
        verified("verify_response_key", self.call(request).await?)
    }

    async fn check_secret_key(&self) -> Result<bool, EngineError> {
        match self.call(EngineRequest::CheckSecretKey).await? {
            EngineResponse::SecretKey { exists } => Ok(exists),
            other => Err(unexpected("check_secret_key", other)),
        }
    }

    async fn crypt(&self, data: &[u8]) -> Result<Bytes, EngineError> {
        let request = EngineRequest::Crypt {
            method: wire::CRYPT_METHOD_ENCRYPT,
            data: data.to_vec(),
        };
        match self.call(request).await? {
            EngineResponse::Crypted { data: sealed } => {
                tracing::debug!(plain = data.len(), sealed = sealed.len(), "payload encrypted");
                Ok(Bytes::from(sealed))
            }
            other => Err(unexpected("crypt", other)),
        }
    }
}
