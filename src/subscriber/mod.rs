//! Long-lived subscription to the engine's feed of new confidential
//! transactions.
//!
//! The subscriber cycles through WaitingReady → Subscribing → Streaming and
//! back whenever the stream fails, until stopped. Batches are republished on
//! the [`EventBus`] in arrival order. Delivery is at least once: batches seen
//! again after a reconnect are published again.

mod probe;

pub use probe::ProbePolicy;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, NewConfidentialTxsEvent};
use crate::engine::types::ConfidentialTransaction;
use crate::error::{EngineError, Error};

/// An open server stream of transaction batches.
#[async_trait]
pub trait TxBatchStream: Send {
    /// Next batch; `Ok(None)` when the stream ended cleanly.
    async fn next_batch(&mut self) -> Result<Option<Vec<ConfidentialTransaction>>, EngineError>;
}

/// Source of confidential transaction batches, normally the [`EngineClient`].
///
/// [`EngineClient`]: crate::engine::EngineClient
#[async_trait]
pub trait TxFeed: Send + Sync + 'static {
    /// Whether the source currently answers requests.
    async fn ready(&self) -> bool;

    /// Open a new batch stream.
    async fn subscribe(&self) -> Result<Box<dyn TxBatchStream>, EngineError>;
}

/// Where the subscriber is in its reconnect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    WaitingReady,
    Subscribing,
    Streaming,
    Stopped,
}

impl fmt::Display for SubscriberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WaitingReady => "waiting-ready",
            Self::Subscribing => "subscribing",
            Self::Streaming => "streaming",
            Self::Stopped => "stopped",
        })
    }
}

/// Settings for a [`ReconnectingSubscriber`].
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct SubscriberConfig {
    /// Readiness probe spacing (default: fixed 1s).
    pub probe: ProbePolicy,
}

impl SubscriberConfig {
    /// Create a builder for constructing a `SubscriberConfig`.
    pub fn builder() -> SubscriberConfigBuilder {
        SubscriberConfigBuilder::default()
    }
}

/// Builder for [`SubscriberConfig`].
#[derive(Debug, Clone, Default)]
pub struct SubscriberConfigBuilder {
    probe: ProbePolicy,
}

impl SubscriberConfigBuilder {
    /// Probe at a fixed `interval`.
    pub fn probe_interval(mut self, interval: std::time::Duration) -> Self {
        self.probe = ProbePolicy::fixed(interval);
        self
    }

    pub fn probe_policy(mut self, policy: ProbePolicy) -> Self {
        self.probe = policy;
        self
    }

    /// Build the `SubscriberConfig`, validating the probe policy.
    pub fn build(self) -> Result<SubscriberConfig, Error> {
        self.probe.validate()?;
        Ok(SubscriberConfig { probe: self.probe })
    }
}

/// Handle on the background task that keeps the engine subscription alive.
///
/// Dropping the handle cancels the task without waiting for it.
pub struct ReconnectingSubscriber {
    token: CancellationToken,
    state: watch::Receiver<SubscriberState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectingSubscriber {
    /// Spawn the subscriber task on the current runtime.
    pub fn spawn<F: TxFeed>(feed: Arc<F>, bus: Arc<EventBus>, config: SubscriberConfig) -> Self {
        let token = CancellationToken::new();
        let (state_tx, state) = watch::channel(SubscriberState::WaitingReady);
        let worker = Worker {
            feed,
            bus,
            probe: config.probe,
            token: token.clone(),
            state: state_tx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            token,
            state,
            task: Mutex::new(Some(task)),
        }
    }

    /// Current state.
    pub fn state(&self) -> SubscriberState {
        *self.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn watch_state(&self) -> watch::Receiver<SubscriberState> {
        self.state.clone()
    }

    /// Cancel the task, close its stream and wait for it to exit.
    pub async fn stop(&self) {
        self.token.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "subscriber task ended abnormally");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == SubscriberState::Stopped
    }
}

impl Drop for ReconnectingSubscriber {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Worker<F> {
    feed: Arc<F>,
    bus: Arc<EventBus>,
    probe: ProbePolicy,
    token: CancellationToken,
    state: watch::Sender<SubscriberState>,
}

impl<F: TxFeed> Worker<F> {
    async fn run(self) {
        info!("starting confidential transaction subscriber");
        let mut recovering = false;

        loop {
            self.enter(SubscriberState::WaitingReady);
            // After a failed cycle wait one interval before probing again.
            if recovering && !self.pause(self.probe.delay_for_attempt(0)).await {
                break;
            }
            if !self.wait_ready().await {
                break;
            }

            self.enter(SubscriberState::Subscribing);
            let subscribed = select! {
                _ = self.token.cancelled() => break,
                result = self.feed.subscribe() => result,
            };
            let stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "subscribing to new confidential transactions failed");
                    recovering = true;
                    continue;
                }
            };

            self.enter(SubscriberState::Streaming);
            if !self.stream(stream).await {
                break;
            }
            recovering = true;
        }

        self.enter(SubscriberState::Stopped);
        info!("confidential transaction subscriber stopped");
    }

    fn enter(&self, state: SubscriberState) {
        debug!(%state, "subscriber state");
        self.state.send_replace(state);
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: std::time::Duration) -> bool {
        select! {
            _ = self.token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Probe until the feed is ready. Returns false on cancellation.
    async fn wait_ready(&self) -> bool {
        let mut attempt = 0u32;
        loop {
            let ready = select! {
                _ = self.token.cancelled() => return false,
                ready = self.feed.ready() => ready,
            };
            if ready {
                return true;
            }
            let delay = self.probe.delay_for_attempt(attempt);
            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "trust engine not ready, waiting"
            );
            attempt = attempt.saturating_add(1);
            if !self.pause(delay).await {
                return false;
            }
        }
    }

    /// Forward batches until the stream fails or ends. Returns false on
    /// cancellation. The stream is dropped, closing its connection, on return.
    async fn stream(&self, mut stream: Box<dyn TxBatchStream>) -> bool {
        loop {
            let next = select! {
                _ = self.token.cancelled() => return false,
                next = stream.next_batch() => next,
            };
            match next {
                Ok(Some(txs)) => {
                    let count = txs.len();
                    let delivered = self.bus.publish(NewConfidentialTxsEvent::new(txs)).await;
                    debug!(count, delivered, "posted new confidential transactions");
                }
                Ok(None) => {
                    warn!("confidential transaction stream closed by engine");
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, "confidential transaction stream failed");
                    return true;
                }
            }
        }
    }
}
