//! Message sources for the relay, and the in-process bus.

use std::sync::Arc;

use async_trait::async_trait;
use saga_core::{EnvelopeError, EventEnvelope};
use tokio::sync::broadcast;

/// One receive from a bus subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusRecv {
    /// A raw, not yet validated payload.
    Message(Arc<str>),
    /// The subscriber fell behind and this many messages were skipped.
    Lagged(u64),
    Closed,
}

/// A subscription to the shared event channel.
#[async_trait]
pub trait BusSource: Send {
    async fn recv(&mut self) -> BusRecv;
}

/// In-process pub/sub on a tokio broadcast channel.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Arc<str>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish a raw payload unchanged. Returns the number of subscribers
    /// that will see it.
    pub fn publish_raw(&self, payload: &str) -> usize {
        self.tx.send(Arc::from(payload)).unwrap_or(0)
    }

    pub fn publish(&self, envelope: &EventEnvelope) -> Result<usize, EnvelopeError> {
        Ok(self.publish_raw(&envelope.encode()?))
    }

    pub fn subscribe(&self) -> LocalBusReceiver {
        LocalBusReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

pub struct LocalBusReceiver {
    rx: broadcast::Receiver<Arc<str>>,
}

#[async_trait]
impl BusSource for LocalBusReceiver {
    async fn recv(&mut self) -> BusRecv {
        match self.rx.recv().await {
            Ok(payload) => BusRecv::Message(payload),
            Err(broadcast::error::RecvError::Lagged(n)) => BusRecv::Lagged(n),
            Err(broadcast::error::RecvError::Closed) => BusRecv::Closed,
        }
    }
}
