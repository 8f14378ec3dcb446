//! Intent channel: an at-least-once work queue addressed by topic.
//!
//! Consumers receive [`Delivery`] values and must settle each one with
//! [`Delivery::ack`] or [`Delivery::nack`].  A broker-backed channel plugs
//! in behind [`IntentChannel`]; [`LocalChannel`] keeps the queues in
//! process.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ChannelError;

pub type Subscription = mpsc::UnboundedReceiver<Delivery>;

#[async_trait]
pub trait IntentChannel: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), ChannelError>;

    /// Opens the consumer side of `topic`.  Dropping the returned
    /// subscription closes it.
    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError>;
}

/// Settles a delivery with the channel that produced it.
pub trait Acknowledger: Send {
    fn ack(self: Box<Self>);
    fn nack(self: Box<Self>, redeliver: bool);
}

/// One message handed to a consumer.
pub struct Delivery {
    topic: String,
    payload: Value,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: Value, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            acker,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn ack(self) {
        self.acker.ack();
    }

    /// Negatively acknowledges; with `redeliver` the message is queued
    /// again, otherwise it is dropped.
    pub fn nack(self, redeliver: bool) {
        self.acker.nack(redeliver);
    }
}

struct Topic {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
}

impl Topic {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

/// In-process work queues, one consumer per topic.
pub struct LocalChannel {
    topics: Mutex<HashMap<String, Topic>>,
    redeliver_delay: Duration,
}

impl LocalChannel {
    pub fn new(redeliver_delay: Duration) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            redeliver_delay,
        }
    }

    fn sender(&self, topic: &str) -> mpsc::UnboundedSender<Delivery> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .tx
            .clone()
    }
}

#[async_trait]
impl IntentChannel for LocalChannel {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), ChannelError> {
        let tx = self.sender(topic);
        let acker = LocalAck {
            tx: tx.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
            delay: self.redeliver_delay,
        };
        tx.send(Delivery::new(topic, payload, Box::new(acker)))
            .map_err(|_| ChannelError::Closed(topic.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(Topic::new)
            .rx
            .take()
            .ok_or_else(|| ChannelError::AlreadySubscribed(topic.to_string()))
    }
}

struct LocalAck {
    tx: mpsc::UnboundedSender<Delivery>,
    topic: String,
    payload: Value,
    delay: Duration,
}

impl Acknowledger for LocalAck {
    fn ack(self: Box<Self>) {}

    fn nack(self: Box<Self>, redeliver: bool) {
        if !redeliver {
            debug!("Dropping nacked message on {}", self.topic);
            return;
        }
        let LocalAck {
            tx,
            topic,
            payload,
            delay,
        } = *self;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let acker = LocalAck {
                tx: tx.clone(),
                topic: topic.clone(),
                payload: payload.clone(),
                delay,
            };
            if tx.send(Delivery::new(topic.clone(), payload, Box::new(acker))).is_err() {
                debug!("Topic {} closed before redelivery", topic);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_published_messages_in_order() {
        let channel = LocalChannel::new(Duration::ZERO);
        channel.publish("server_build", json!({ "server": "a" })).await.unwrap();
        let mut sub = channel.subscribe("server_build").await.unwrap();
        channel.publish("server_build", json!({ "server": "b" })).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.topic(), "server_build");
        assert_eq!(first.payload(), &json!({ "server": "a" }));
        first.ack();
        assert_eq!(sub.recv().await.unwrap().payload(), &json!({ "server": "b" }));
    }

    #[tokio::test]
    async fn nack_with_redeliver_requeues_and_without_drops() {
        let channel = LocalChannel::new(Duration::from_millis(5));
        let mut sub = channel.subscribe("bungee_build").await.unwrap();

        channel.publish("bungee_build", json!({ "bungee": "a" })).await.unwrap();
        sub.recv().await.unwrap().nack(true);
        let again = sub.recv().await.unwrap();
        assert_eq!(again.payload(), &json!({ "bungee": "a" }));

        again.nack(false);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_subscriber_per_topic_and_closed_topics_refuse_publishes() {
        let channel = LocalChannel::new(Duration::ZERO);
        let sub = channel.subscribe("server_build").await.unwrap();
        assert!(matches!(
            channel.subscribe("server_build").await,
            Err(ChannelError::AlreadySubscribed(_))
        ));

        drop(sub);
        assert!(matches!(
            channel.publish("server_build", json!({})).await,
            Err(ChannelError::Closed(_))
        ));
    }
}
