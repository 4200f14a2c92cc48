//! Broadcast channel boundary.
//!
//! A [`MessageBus`] fans a published payload out to every subscriber of a
//! topic. Delivery is best-effort: subscribers present at publish time get
//! the message (at least once), nothing is persisted, and a failing handler
//! only affects itself.
//!
//! [`InMemoryMessageBus`] gives every subscriber its own unbounded channel
//! drained by one task, so each subscriber sees messages in publish order
//! and a slow handler never blocks the publisher.

use std::collections::HashMap;
use std::fmt;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{CoreResult, Serializer};

/// A payload delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Subscriber callback (async).
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handle keeping a subscription alive.
///
/// Dropping it (or calling [`Subscription::unsubscribe`]) stops delivery.
pub struct Subscription {
    topic: String,
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            topic: topic.into(),
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription that owns nothing, for buses that never deliver.
    pub fn inert(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            cancel: None,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Publish/subscribe transport
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Send `payload` to every current subscriber of `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> CoreResult<()>;

    /// Register `handler` for messages on `topic`
    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> CoreResult<Subscription>;
}

/// Serialize `message` and publish it.
pub async fn publish_message<S, M>(
    bus: &dyn MessageBus,
    serializer: &S,
    topic: &str,
    message: &M,
) -> CoreResult<()>
where
    S: Serializer,
    M: Serialize + ?Sized,
{
    let payload = serializer.to_bytes(message)?;
    bus.publish(topic, payload).await
}

/// Subscribe with a typed handler; payloads that fail to decode are
/// reported as handler failures.
pub async fn subscribe_message<S, M, F>(
    bus: &dyn MessageBus,
    serializer: S,
    topic: &str,
    handler: F,
) -> CoreResult<Subscription>
where
    S: Serializer,
    M: DeserializeOwned + Send + 'static,
    F: Fn(M) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static,
{
    let handler = Arc::new(handler);
    let typed: MessageHandler = Arc::new(move |message: Message| -> BoxFuture<'static, anyhow::Result<()>> {
        let decoded = serializer.from_bytes::<M>(&message.payload);
        let handler = handler.clone();
        Box::pin(async move {
            let value = decoded?;
            handler(value).await
        })
    });
    bus.subscribe(topic, typed).await
}

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl BusInner {
    fn remove(&self, topic: &str, id: u64) {
        let mut topics = self.topics.write();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|s| s.id != id);
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

/// In-process message bus shared by every component holding a clone.
#[derive(Clone, Default)]
pub struct InMemoryMessageBus {
    inner: Arc<BusInner>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Total messages accepted by `publish`
    pub fn published_count(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MessageBus for InMemoryMessageBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> CoreResult<()> {
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        let mut closed = Vec::new();
        {
            let topics = self.inner.topics.read();
            let Some(subscribers) = topics.get(topic) else {
                debug!(topic, "no subscribers, message dropped");
                return Ok(());
            };
            for subscriber in subscribers {
                let message = Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                if subscriber.sender.send(message).is_err() {
                    closed.push(subscriber.id);
                }
            }
        }

        for id in closed {
            self.inner.remove(topic, id);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: MessageHandler) -> CoreResult<Subscription> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();

        self.inner
            .topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber { id, sender });

        let task_topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                if let Err(err) = handler(message).await {
                    warn!(topic = %task_topic, subscriber = id, "message handler failed: {:#}", err);
                }
            }
            debug!(topic = %task_topic, subscriber = id, "subscriber stopped");
        });

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let cancel_topic = topic.to_string();
        Ok(Subscription::new(topic, move || {
            if let Some(inner) = weak.upgrade() {
                inner.remove(&cancel_topic, id);
            }
        }))
    }
}

/// Bus that accepts publishes and never delivers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMessageBus;

#[async_trait]
impl MessageBus for NullMessageBus {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> CoreResult<()> {
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _handler: MessageHandler) -> CoreResult<Subscription> {
        Ok(Subscription::inert(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JsonSerializer;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::time::Duration;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn collecting_handler(into: Arc<Mutex<Vec<String>>>) -> MessageHandler {
        Arc::new(move |message: Message| -> BoxFuture<'static, anyhow::Result<()>> {
            let into = into.clone();
            async move {
                into.lock().push(String::from_utf8(message.payload)?);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn every_subscriber_receives_in_publish_order() {
        let bus = InMemoryMessageBus::new();
        let a = Arc::new(Mutex::new(Vec::new()));
        let b = Arc::new(Mutex::new(Vec::new()));
        let _sa = bus.subscribe("orders", collecting_handler(a.clone())).await.unwrap();
        let _sb = bus.subscribe("orders", collecting_handler(b.clone())).await.unwrap();

        for n in 0..5 {
            bus.publish("orders", n.to_string().into_bytes()).await.unwrap();
        }

        wait_until(|| a.lock().len() == 5 && b.lock().len() == 5).await;
        assert_eq!(*a.lock(), vec!["0", "1", "2", "3", "4"]);
        assert_eq!(*b.lock(), *a.lock());
    }

    #[tokio::test]
    async fn dropping_subscription_stops_delivery() {
        let bus = InMemoryMessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = bus.subscribe("t", collecting_handler(seen.clone())).await.unwrap();
        assert_eq!(bus.subscriber_count("t"), 1);

        drop(subscription);
        assert_eq!(bus.subscriber_count("t"), 0);

        bus.publish("t", b"late".to_vec()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn failing_handler_keeps_receiving() {
        let bus = InMemoryMessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        // non utf-8 payload makes the collecting handler fail
        let _s = bus.subscribe("t", collecting_handler(seen.clone())).await.unwrap();

        bus.publish("t", vec![0xff, 0xfe]).await.unwrap();
        bus.publish("t", b"ok".to_vec()).await.unwrap();

        wait_until(|| seen.lock().len() == 1).await;
        assert_eq!(*seen.lock(), vec!["ok"]);
    }

    #[tokio::test]
    async fn typed_messages_round_trip_through_serializer() {
        #[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
        struct Ping {
            seq: u32,
        }

        let bus = InMemoryMessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _s = subscribe_message(&bus, JsonSerializer, "ping", move |ping: Ping| {
            let sink = sink.clone();
            async move {
                sink.lock().push(ping.seq);
                Ok(())
            }
            .boxed()
        })
        .await
        .unwrap();

        publish_message(&bus, &JsonSerializer, "ping", &Ping { seq: 3 }).await.unwrap();

        wait_until(|| !seen.lock().is_empty()).await;
        assert_eq!(*seen.lock(), vec![3]);
    }

    #[tokio::test]
    async fn null_bus_accepts_everything() {
        let bus = NullMessageBus;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let subscription = bus.subscribe("t", collecting_handler(seen.clone())).await.unwrap();
        bus.publish("t", b"x".to_vec()).await.unwrap();
        assert_eq!(subscription.topic(), "t");
        assert!(seen.lock().is_empty());
    }
}
