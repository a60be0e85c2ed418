//! In-process trust engine speaking the engine protocol over loopback TCP.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use primitive_types::U256;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use confidential_tx_relay::engine::server::{serve, EngineService};
use confidential_tx_relay::engine::wire::{
    self, AccountTransactions, EngineRequest, EngineResponse, WireSendResult,
};
use confidential_tx_relay::{
    Address, ConfidentialTransaction, EngineConfig, EngineError, PeerId, StaticTrustEngine,
    TrustEngine,
};

/// Engine double: attestation answers come from a [`StaticTrustEngine`],
/// pool state is a handful of in-memory maps.
pub struct EngineEmulator {
    pub attestation: StaticTrustEngine,
    ready: AtomicBool,
    fail_calls: AtomicBool,
    delay: Mutex<Option<Duration>>,
    gas_price: Mutex<U256>,
    rejections: Mutex<HashMap<Vec<u8>, String>>,
    known: Mutex<HashSet<[u8; 32]>>,
    feeds: Mutex<Vec<mpsc::Sender<Vec<ConfidentialTransaction>>>>,
    subscriptions: AtomicUsize,
    calls: Mutex<Vec<&'static str>>,
}

impl EngineEmulator {
    pub fn new() -> Self {
        Self::with_attestation(StaticTrustEngine::new())
    }

    pub fn with_attestation(attestation: StaticTrustEngine) -> Self {
        Self {
            attestation,
            ready: AtomicBool::new(true),
            fail_calls: AtomicBool::new(false),
            delay: Mutex::new(None),
            gas_price: Mutex::new(U256::from(1_000_000_000u64)),
            rejections: Mutex::new(HashMap::new()),
            known: Mutex::new(HashSet::new()),
            feeds: Mutex::new(Vec::new()),
            subscriptions: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Answer every request with an engine failure.
    pub fn fail_calls(&self, fail: bool) {
        self.fail_calls.store(fail, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Report `error` for the confidential transaction with these bytes.
    pub fn reject(&self, tx: &[u8], error: &str) {
        self.rejections
            .lock()
            .unwrap()
            .insert(tx.to_vec(), error.to_string());
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    /// Total streaming subscriptions opened so far.
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Push a batch to every open stream. Returns how many streams took it.
    pub async fn push(&self, txs: Vec<ConfidentialTransaction>) -> usize {
        let feeds: Vec<_> = self.feeds.lock().unwrap().clone();
        let mut delivered = 0;
        for feed in feeds {
            if feed.send(txs.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// End every open stream.
    pub fn close_streams(&self) {
        self.feeds.lock().unwrap().clear();
    }

    /// Wait until at least `n` subscriptions were opened in total.
    pub async fn wait_for_subscriptions(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.subscriptions() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscription not opened in time");
    }

    fn confidential_results(&self, txs: Vec<Vec<u8>>) -> Vec<WireSendResult> {
        let rejections = self.rejections.lock().unwrap();
        let mut known = self.known.lock().unwrap();
        txs.into_iter()
            .map(|bytes| match rejections.get(&bytes) {
                Some(error) => WireSendResult {
                    hash: Default::default(),
                    report: Vec::new(),
                    error: error.clone(),
                },
                None => {
                    let hash = ConfidentialTransaction::new(bytes).hash();
                    known.insert(hash.0);
                    WireSendResult {
                        hash,
                        report: b"report".to_vec(),
                        error: String::new(),
                    }
                }
            })
            .collect()
    }
}

fn attestation(result: Result<bytes::Bytes, EngineError>) -> Result<EngineResponse, EngineError> {
    result.map(|data| EngineResponse::Attestation {
        data: data.to_vec(),
    })
}

fn verified(result: Result<(), EngineError>) -> Result<EngineResponse, EngineError> {
    match result {
        Ok(()) => Ok(EngineResponse::Verified {
            error: String::new(),
        }),
        Err(EngineError::Rejected(error)) => Ok(EngineResponse::Verified { error }),
        Err(e) => Err(e),
    }
}

const ANY_PEER: PeerId = PeerId([0; 32]);

#[async_trait]
impl EngineService for EngineEmulator {
    async fn call(&self, request: EngineRequest) -> Result<EngineResponse, EngineError> {
        self.calls.lock().unwrap().push(request.name());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(EngineError::Remote("engine is shutting down".into()));
        }

        let engine = &self.attestation;
        match request {
            EngineRequest::GasPrice => {
                if !self.ready.load(Ordering::SeqCst) {
                    return Err(EngineError::Remote("pool not initialised".into()));
                }
                let price = *self.gas_price.lock().unwrap();
                Ok(EngineResponse::Price {
                    price: wire::amount_to_bytes(price),
                })
            }
            EngineRequest::SetPrice { price } => {
                *self.gas_price.lock().unwrap() = wire::amount_from_bytes(&price)?;
                Ok(EngineResponse::Done)
            }
            EngineRequest::PendingNonce { address } => Ok(EngineResponse::Nonce {
                nonce: u64::from(address.0[19]) + 1,
            }),
            EngineRequest::Stats => Ok(EngineResponse::Stats {
                pending: 2,
                queued: 1,
            }),
            EngineRequest::Pending => Ok(EngineResponse::Pending {
                accounts: vec![AccountTransactions {
                    address: Address([0x11; 20]),
                    txs: vec![b"tx-0".to_vec(), b"tx-1".to_vec()],
                }],
            }),
            EngineRequest::Locals => Ok(EngineResponse::Locals {
                addresses: vec![Address([0x11; 20])],
            }),
            EngineRequest::AddLocals { txs } | EngineRequest::AddRemotes { txs } => {
                Ok(EngineResponse::Added {
                    errors: txs
                        .iter()
                        .map(|tx| {
                            if tx.is_empty() {
                                "empty transaction".to_string()
                            } else {
                                String::new()
                            }
                        })
                        .collect(),
                })
            }
            EngineRequest::AddLocalConfidential { txs }
            | EngineRequest::AddRemoteConfidential { txs } => {
                Ok(EngineResponse::ConfidentialAdded {
                    results: self.confidential_results(txs),
                })
            }
            EngineRequest::Status { hashes } => {
                let known = self.known.lock().unwrap();
                Ok(EngineResponse::Status {
                    codes: hashes
                        .iter()
                        .map(|h| if known.contains(&h.0) { 2 } else { 0 })
                        .collect(),
                })
            }
            EngineRequest::Get { hash } => Ok(EngineResponse::Transaction {
                tx: (hash.0 == [0x22; 32]).then(|| b"plain".to_vec()),
            }),
            EngineRequest::Has { hash } => Ok(EngineResponse::Has {
                has: self.known.lock().unwrap().contains(&hash.0),
            }),
            EngineRequest::CheckSecretKey => Ok(EngineResponse::SecretKey {
                exists: engine.check_secret_key().await?,
            }),
            EngineRequest::Crypt { method, data } => {
                if method != wire::CRYPT_METHOD_ENCRYPT {
                    return Err(EngineError::Remote(format!("unknown crypt method {method}")));
                }
                Ok(EngineResponse::Crypted {
                    data: engine.crypt(&data).await?.to_vec(),
                })
            }
            EngineRequest::GetAuthData { .. } => attestation(engine.get_auth_data(&ANY_PEER).await),
            EngineRequest::VerifyAuth { data, .. } => {
                verified(engine.verify_auth(&data, &ANY_PEER).await)
            }
            EngineRequest::GetVerifyData { .. } => {
                attestation(engine.get_verify_data(&ANY_PEER).await)
            }
            EngineRequest::VerifyRemoteVerify { data, .. } => {
                verified(engine.verify_remote_verify(&data, &ANY_PEER).await)
            }
            EngineRequest::GetRequestKeyData { .. } => {
                attestation(engine.get_request_key_data(&ANY_PEER).await)
            }
            EngineRequest::VerifyRequestKeyData { data, .. } => {
                verified(engine.verify_request_key_data(&data, &ANY_PEER).await)
            }
            EngineRequest::GetResponseKeyData { .. } => {
                attestation(engine.get_response_key_data(&ANY_PEER).await)
            }
            EngineRequest::VerifyResponseKey { data, .. } => {
                verified(engine.verify_response_key(&data, &ANY_PEER).await)
            }
            EngineRequest::SubscribeNewTransactions => Err(EngineError::Protocol(
                "subscription is not a unary call".into(),
            )),
        }
    }

    async fn subscribe_new_transactions(
        &self,
    ) -> Result<mpsc::Receiver<Vec<ConfidentialTransaction>>, EngineError> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(EngineError::Remote("engine is shutting down".into()));
        }
        let (tx, rx) = mpsc::channel(16);
        self.feeds.lock().unwrap().push(tx);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }
}

/// Route library logs to the test harness. Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A running emulator and the token that shuts it down.
pub struct RunningEngine {
    pub emulator: Arc<EngineEmulator>,
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
}

impl RunningEngine {
    pub fn config(&self) -> EngineConfig {
        EngineConfig::builder(self.addr.to_string())
            .connect_timeout(Duration::from_secs(1))
            .request_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }
}

impl Drop for RunningEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn start_engine(emulator: EngineEmulator) -> RunningEngine {
    start_engine_at(emulator, "127.0.0.1:0").await
}

/// Start an emulator on a fixed address, e.g. to restart one in place.
pub async fn start_engine_at(emulator: EngineEmulator, addr: &str) -> RunningEngine {
    init_tracing();
    let listener = TcpListener::bind(addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let emulator = Arc::new(emulator);
    let shutdown = CancellationToken::new();

    let service = Arc::clone(&emulator);
    let token = shutdown.clone();
    tokio::spawn(async move {
        serve(listener, service, token).await.unwrap();
    });

    RunningEngine {
        emulator,
        addr,
        shutdown,
    }
}

/// Address nothing is listening on.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}
