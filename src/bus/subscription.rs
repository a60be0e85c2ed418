use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_stream::Stream;
use tracing::debug;

use super::{NewConfidentialTxsEvent, RegistryMap};

/// A subscriber's handle on the bus.
///
/// Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<NewConfidentialTxsEvent>,
    registry: Weak<RegistryMap>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        receiver: mpsc::Receiver<NewConfidentialTxsEvent>,
        registry: Weak<RegistryMap>,
    ) -> Self {
        Self {
            id,
            receiver,
            registry,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once unsubscribed by the bus and drained.
    pub async fn recv(&mut self) -> Option<NewConfidentialTxsEvent> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<NewConfidentialTxsEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Leave the bus explicitly.
    pub fn unsubscribe(self) {}

    /// Turn the subscription into a lazy stream of events.
    #[must_use]
    pub fn into_stream(self) -> EventStream {
        EventStream { subscription: self }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let Ok(mut subs) = registry.lock() else {
            return;
        };
        if subs.remove(&self.id).is_some() {
            debug!(id = self.id, "subscription dropped");
        }
    }
}

/// A [`Subscription`] as a `tokio_stream::Stream`.
pub struct EventStream {
    subscription: Subscription,
}

impl EventStream {
    pub fn id(&self) -> u64 {
        self.subscription.id
    }
}

impl Stream for EventStream {
    type Item = NewConfidentialTxsEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.subscription.receiver.poll_recv(cx)
    }
}
