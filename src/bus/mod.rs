//! # Event Bus
//!
//! Local fanout of newly observed confidential transactions.
//!
//! Every subscriber owns a bounded queue. A publish reaches each subscriber
//! registered when it starts; a subscriber whose queue stays full for longer
//! than the publish timeout misses that event, and one whose receiver is gone
//! is removed from the registry.

mod subscription;

pub use subscription::{EventStream, Subscription};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};

use crate::engine::types::ConfidentialTransaction;
use crate::error::{Error, SessionError};

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default time a publish waits on one full subscriber queue.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(500);

/// A batch of confidential transactions newly seen by the trust engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConfidentialTxsEvent {
    pub txs: Vec<ConfidentialTransaction>,
}

impl NewConfidentialTxsEvent {
    pub fn new(txs: Vec<ConfidentialTransaction>) -> Self {
        Self { txs }
    }
}

/// Settings for an [`EventBus`].
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Events buffered per subscriber (default: 1024).
    pub queue_capacity: usize,

    /// How long a publish waits on a full subscriber before skipping it (default: 500ms).
    pub publish_timeout: Duration,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }
}

impl EventBusConfig {
    /// Create a builder for constructing an `EventBusConfig`.
    pub fn builder() -> EventBusConfigBuilder {
        EventBusConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`EventBusConfig`].
#[derive(Debug, Clone)]
pub struct EventBusConfigBuilder {
    config: EventBusConfig,
}

impl EventBusConfigBuilder {
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.config.publish_timeout = timeout;
        self
    }

    /// Build the `EventBusConfig`, validating that all values are sensible.
    pub fn build(self) -> Result<EventBusConfig, Error> {
        if self.config.queue_capacity == 0 {
            return Err(SessionError::InvalidConfig("queue_capacity must be > 0".into()).into());
        }
        Ok(self.config)
    }
}

pub(crate) type RegistryMap = Mutex<HashMap<u64, mpsc::Sender<NewConfidentialTxsEvent>>>;
type Registry = Arc<RegistryMap>;

/// Publish/subscribe fanout for [`NewConfidentialTxsEvent`]s.
pub struct EventBus {
    subscribers: Registry,
    next_id: AtomicU64,
    closed: AtomicBool,
    config: EventBusConfig,
}

impl EventBus {
    /// Create a bus with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    #[must_use]
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Register a subscriber. It receives every event published from now on.
    ///
    /// After [`EventBus::close`] the returned subscription is already ended.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity.max(1));

        if let Ok(mut subs) = self.subscribers.lock() {
            // Checked under the lock so `close` cannot miss this entry.
            if !self.closed.load(Ordering::Acquire) {
                subs.insert(id, sender);
                debug!(id, subscribers = subs.len(), "new subscription");
            }
        }

        Subscription::new(id, receiver, Arc::downgrade(&self.subscribers))
    }

    /// Convenience for `subscribe().into_stream()`.
    #[must_use]
    pub fn event_stream(&self) -> EventStream {
        self.subscribe().into_stream()
    }

    /// Deliver `event` to every current subscriber. Returns how many accepted it.
    pub async fn publish(&self, event: NewConfidentialTxsEvent) -> usize {
        let snapshot: Vec<(u64, mpsc::Sender<NewConfidentialTxsEvent>)> =
            match self.subscribers.lock() {
                Ok(subs) => subs.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
                Err(_) => return 0,
            };

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, sender) in snapshot {
            match sender
                .send_timeout(event.clone(), self.config.publish_timeout)
                .await
            {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(
                        id,
                        count = event.txs.len(),
                        timeout_ms = self.config.publish_timeout.as_millis() as u64,
                        "subscriber queue full, event skipped"
                    );
                }
                Err(SendTimeoutError::Closed(_)) => gone.push(id),
            }
        }

        if !gone.is_empty() {
            if let Ok(mut subs) = self.subscribers.lock() {
                for id in &gone {
                    subs.remove(id);
                }
            }
            debug!(pruned = gone.len(), "removed closed subscribers");
        }

        debug!(count = event.txs.len(), delivered, "published confidential transactions");
        delivered
    }

    /// Unsubscribe everyone. Subscribers drain what is queued and then end.
    pub fn close(&self) {
        if let Ok(mut subs) = self.subscribers.lock() {
            self.closed.store(true, Ordering::Release);
            let count = subs.len();
            subs.clear();
            debug!(count, "event bus closed");
        }
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
