//! Publish/subscribe bus
//!
//! Every message on a topic is fanned out to all subscribers. Topics are
//! shared by all agents, so messages carry the agent id as a fixed-width
//! text prefix and subscribers filter on it before decoding the rest.

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{error, trace};
use uuid::Uuid;

use crate::{BrokerError, BrokerResult};

/// Length of a hyphenated UUID, the prefix of every agent-scoped message
pub const AGENT_PREFIX_LEN: usize = 36;

/// Callback invoked for each message, in publish order
pub type Handler = Box<dyn Fn(Bytes) + Send + Sync>;

/// Publish/subscribe bus shared by control plane replicas
#[async_trait]
pub trait Pubsub: Send + Sync {
    async fn publish(&self, topic: &str, message: Bytes) -> BrokerResult<()>;

    /// Register `handler` for `topic` until the subscription is dropped
    async fn subscribe(&self, topic: &str, handler: Handler) -> BrokerResult<Subscription>;
}

/// Handle that unsubscribes when cancelled or dropped
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    topics: HashMap<String, HashMap<u64, mpsc::UnboundedSender<Bytes>>>,
}

/// In-process bus
///
/// Each subscriber gets its own delivery task so a slow handler never blocks
/// publishers or other subscribers.
#[derive(Clone, Default)]
pub struct MemoryPubsub {
    registry: Arc<Mutex<Registry>>,
}

impl MemoryPubsub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry
            .lock()
            .ok()
            .and_then(|r| r.topics.get(topic).map(|subs| subs.len()))
            .unwrap_or(0)
    }

    fn unsubscribe(registry: &Weak<Mutex<Registry>>, topic: &str, id: u64) {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        if let Ok(mut registry) = registry.lock() {
            if let Some(subs) = registry.topics.get_mut(topic) {
                subs.remove(&id);
                if subs.is_empty() {
                    registry.topics.remove(topic);
                }
            }
        };
    }
}

#[async_trait]
impl Pubsub for MemoryPubsub {
    async fn publish(&self, topic: &str, message: Bytes) -> BrokerResult<()> {
        let registry = self
            .registry
            .lock()
            .map_err(|_| BrokerError::Publish("registry poisoned".to_string()))?;

        if let Some(subs) = registry.topics.get(topic) {
            trace!(topic, subscribers = subs.len(), "Publishing message");
            for tx in subs.values() {
                let _ = tx.send(message.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> BrokerResult<Subscription> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let id = {
            let mut registry = self
                .registry
                .lock()
                .map_err(|_| BrokerError::Subscribe("registry poisoned".to_string()))?;
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .topics
                .entry(topic.to_string())
                .or_default()
                .insert(id, tx);
            id
        };

        let delivery = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler(message);
            }
        });

        let registry = Arc::downgrade(&self.registry);
        let topic = topic.to_string();
        Ok(Subscription::new(move || {
            MemoryPubsub::unsubscribe(&registry, &topic, id);
            delivery.abort();
        }))
    }
}

/// Prefix `payload` with the agent id
pub fn agent_prefixed(agent_id: Uuid, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(AGENT_PREFIX_LEN + payload.len());
    buf.put_slice(agent_id.hyphenated().to_string().as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Payload of `message` if it is addressed to `agent_id`
///
/// Messages shorter than the prefix are malformed and logged.
pub fn strip_agent_prefix(agent_id: Uuid, message: &[u8]) -> Option<&[u8]> {
    if message.len() < AGENT_PREFIX_LEN {
        error!(
            agent_id = %agent_id,
            len = message.len(),
            "Bus message shorter than agent id prefix"
        );
        return None;
    }

    let (prefix, payload) = message.split_at(AGENT_PREFIX_LEN);
    if prefix != agent_id.hyphenated().to_string().as_bytes() {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn collector() -> (Handler, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Handler = Box::new(move |message| {
            let _ = tx.send(message);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let bus = MemoryPubsub::new();
        let (handler, mut rx) = collector();
        let _sub = bus.subscribe("topic", handler).await.unwrap();

        for i in 0..10u8 {
            bus.publish("topic", Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = MemoryPubsub::new();
        let (handler, mut rx) = collector();
        let _sub = bus.subscribe("a", handler).await.unwrap();

        bus.publish("b", Bytes::from_static(b"other")).await.unwrap();
        bus.publish("a", Bytes::from_static(b"mine")).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"mine"));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = MemoryPubsub::new();
        let (handler, mut rx) = collector();
        let sub = bus.subscribe("topic", handler).await.unwrap();
        assert_eq!(bus.subscriber_count("topic"), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count("topic"), 0);

        bus.publish("topic", Bytes::from_static(b"late")).await.unwrap();
        let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        // The handler (and its sender) is gone with the aborted delivery task
        assert!(!matches!(received, Ok(Some(_))));
    }

    #[test]
    fn test_agent_prefix() {
        let agent = Uuid::new_v4();
        let other = Uuid::new_v4();
        let message = agent_prefixed(agent, b"{}");

        assert_eq!(message.len(), AGENT_PREFIX_LEN + 2);
        assert_eq!(strip_agent_prefix(agent, &message), Some(&b"{}"[..]));
        assert_eq!(strip_agent_prefix(other, &message), None);
        assert_eq!(strip_agent_prefix(agent, b"short"), None);
    }
}
