use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use primitive_types::U256;

use crate::attestation::TrustEngine;
use crate::bus::{EventBus, EventBusConfig, Subscription};
use crate::engine::types::{
    Address, ConfidentialTransaction, Hash, Origin, PoolStats, RawTransaction, SendResult,
    TxStatus,
};
use crate::engine::{EngineClient, EngineConfig};
use crate::error::EngineError;
use crate::subscriber::{ReconnectingSubscriber, SubscriberConfig, SubscriberState};

/// Settings for a [`ConfidentialTxPool`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub engine: EngineConfig,
    pub bus: EventBusConfig,
    pub subscriber: SubscriberConfig,
}

impl PoolConfig {
    /// Defaults for everything except the engine connection.
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            bus: EventBusConfig::default(),
            subscriber: SubscriberConfig::default(),
        }
    }

    pub fn with_bus(mut self, bus: EventBusConfig) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_subscriber(mut self, subscriber: SubscriberConfig) -> Self {
        self.subscriber = subscriber;
        self
    }
}

/// Transaction pool whose state lives in the remote trust engine.
///
/// Every query and submission is forwarded to the engine. New confidential
/// transactions observed by the engine are republished to local subscribers.
pub struct ConfidentialTxPool {
    client: Arc<EngineClient>,
    bus: Arc<EventBus>,
    subscriber: ReconnectingSubscriber,
}

impl ConfidentialTxPool {
    /// Create the pool and start following the engine's transaction feed.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(config: PoolConfig) -> Self {
        let client = Arc::new(EngineClient::new(config.engine));
        let bus = Arc::new(EventBus::with_config(config.bus));
        let subscriber =
            ReconnectingSubscriber::spawn(Arc::clone(&client), Arc::clone(&bus), config.subscriber);

        tracing::info!(endpoint = %client.config().endpoint, "confidential transaction pool started");
        Self {
            client,
            bus,
            subscriber,
        }
    }

    /// The engine client, usable as the [`TrustEngine`] for peer attestation.
    pub fn engine(&self) -> Arc<EngineClient> {
        Arc::clone(&self.client)
    }

    pub async fn is_ready(&self) -> bool {
        self.client.ready().await
    }

    pub async fn gas_price(&self) -> Result<U256, EngineError> {
        self.client.gas_price().await
    }

    /// Update the minimum gas price enforced by the engine.
    pub async fn set_gas_price(&self, price: U256) -> Result<(), EngineError> {
        self.client.set_price(price).await?;
        tracing::info!(%price, "transaction pool price threshold updated");
        Ok(())
    }

    pub async fn nonce(&self, address: Address) -> Result<u64, EngineError> {
        self.client.nonce(address).await
    }

    pub async fn stats(&self) -> Result<PoolStats, EngineError> {
        self.client.stats().await
    }

    pub async fn pending(&self) -> Result<BTreeMap<Address, Vec<RawTransaction>>, EngineError> {
        self.client.pending().await
    }

    pub async fn locals(&self) -> Result<Vec<Address>, EngineError> {
        self.client.locals().await
    }

    pub async fn add_locals(&self, txs: &[RawTransaction]) -> Vec<Result<(), EngineError>> {
        self.client.add_transactions(Origin::Local, txs).await
    }

    pub async fn add_local(&self, tx: RawTransaction) -> Result<(), EngineError> {
        first(self.add_locals(std::slice::from_ref(&tx)).await)
    }

    pub async fn add_remotes(&self, txs: &[RawTransaction]) -> Vec<Result<(), EngineError>> {
        self.client.add_transactions(Origin::Remote, txs).await
    }

    pub async fn add_remote(&self, tx: RawTransaction) -> Result<(), EngineError> {
        first(self.add_remotes(std::slice::from_ref(&tx)).await)
    }

    /// Submit a confidential transaction created on this node.
    pub async fn add_local_confidential(
        &self,
        tx: &ConfidentialTransaction,
    ) -> Result<SendResult, EngineError> {
        self.client.add_local_confidential(tx).await
    }

    /// Submit confidential transactions relayed by peers. One result per
    /// input, in input order.
    pub async fn add_remotes_confidential(
        &self,
        txs: &[ConfidentialTransaction],
    ) -> Vec<Result<(), EngineError>> {
        self.client
            .add_confidential(Origin::Remote, txs)
            .await
            .into_iter()
            .map(|result| match result.error {
                Some(e) => Err(e),
                None => Ok(()),
            })
            .collect()
    }

    pub async fn status(&self, hashes: &[Hash]) -> Result<Vec<TxStatus>, EngineError> {
        self.client.status(hashes).await
    }

    pub async fn get(&self, hash: Hash) -> Result<Option<RawTransaction>, EngineError> {
        self.client.get(hash).await
    }

    pub async fn has(&self, hash: Hash) -> Result<bool, EngineError> {
        self.client.has(hash).await
    }

    pub async fn check_secret_key(&self) -> Result<bool, EngineError> {
        self.client.check_secret_key().await
    }

    /// Encrypt `data` under the engine-managed key.
    pub async fn crypt(&self, data: &[u8]) -> Result<Bytes, EngineError> {
        self.client.crypt(data).await
    }

    /// Receive every batch of confidential transactions the engine reports
    /// from now on.
    pub fn subscribe_new_confidential_txs(&self) -> Subscription {
        self.bus.subscribe()
    }

    pub fn subscriber_state(&self) -> SubscriberState {
        self.subscriber.state()
    }

    /// Stop following the engine and end all local subscriptions.
    pub async fn stop(&self) {
        self.subscriber.stop().await;
        self.bus.close();
        tracing::info!("confidential transaction pool stopped");
    }
}

fn first(results: Vec<Result<(), EngineError>>) -> Result<(), EngineError> {
    results
        .into_iter()
        .next()
        .unwrap_or_else(|| Err(EngineError::Protocol("no result for submitted transaction".into())))
}
