//! Subscribe seam towards the MQTT client owned by the host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Host-side publish/subscribe client.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start delivery of messages published on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;
}

type Unsubscribe = Box<dyn FnOnce() + Send>;

/// A live subscription. Dropping it stops delivery.
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Vec<u8>>,
        unsubscribe: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self { topic: topic.into(), receiver, unsubscribe: Some(Box::new(unsubscribe)) }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message payload, or `None` once the transport closed the topic.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.cancel();
    }

    fn cancel(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("topic", &self.topic).finish_non_exhaustive()
    }
}

type Subscribers = HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>;

#[derive(Default)]
struct LoopbackInner {
    next_id: u64,
    closed: bool,
    subscribers: Subscribers,
}

/// In-process transport: exact topic matching, fan-out to every subscriber.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `payload` to the subscribers of `topic`; returns how many
    /// received it.
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let payload = payload.into();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subscribers) = inner.subscribers.get_mut(topic) else {
            return 0;
        };
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (_, tx) in subscribers.iter() {
            let _ = tx.send(payload.clone());
        }
        subscribers.len()
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .subscribers
            .get(topic)
            .map(|subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// End every subscription; pending messages are still delivered.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.closed = true;
        inner.subscribers.clear();
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            if inner.closed {
                return Err(TransportError::Closed);
            }
            inner.next_id += 1;
            let id = inner.next_id;
            inner.subscribers.entry(topic.to_string()).or_default().push((id, tx));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        let owned_topic = topic.to_string();
        Ok(Subscription::new(topic, rx, move || {
            if let Some(inner) = weak.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(subs) = inner.subscribers.get_mut(&owned_topic) {
                    subs.retain(|(sub_id, _)| *sub_id != id);
                }
            }
        }))
    }
}
