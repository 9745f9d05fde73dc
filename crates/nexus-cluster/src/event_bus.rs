//! Non-durable fire-and-forget pub/sub over a fixed set of channels.
//! Grounded on `examples/original_source/backend/core/cluster/event_bus.py`.

use crate::error::Result;
use crate::metrics::Metrics;
use nexus_broker::{Broker, BrokerMessage};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Fixed cluster-wide channel names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Agent,
    Model,
    Abort,
    Config,
    Health,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Agent => "agent",
            Channel::Model => "model",
            Channel::Abort => "abort",
            Channel::Config => "config",
            Channel::Health => "health",
        }
    }
}

/// Envelope carried on every channel; `_sender` lets publishers ignore
/// their own echo.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(rename = "_sender")]
    pub sender: String,
    pub timestamp: i64,
}

pub type Subscription = mpsc::UnboundedReceiver<Event>;

struct Stats {
    published: AtomicI64,
    received: AtomicI64,
    self_echo_dropped: AtomicI64,
}

/// In-process fan-out of broker pub/sub messages to typed `Event` channels.
pub struct EventBus<B: Broker> {
    broker: Arc<B>,
    prefix: String,
    sender_id: String,
    subscribers: Arc<RwLock<HashMap<Channel, Vec<mpsc::UnboundedSender<Event>>>>>,
    stopped: Arc<AtomicBool>,
    task: RwLock<Option<JoinHandle<()>>>,
    stats: Arc<Stats>,
    metrics: Arc<Metrics>,
}

impl<B: Broker + 'static> EventBus<B> {
    pub fn new(broker: Arc<B>, prefix: String, sender_id: String, metrics: Arc<Metrics>) -> Self {
        Self {
            broker,
            prefix,
            sender_id,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            stopped: Arc::new(AtomicBool::new(false)),
            task: RwLock::new(None),
            stats: Arc::new(Stats {
                published: AtomicI64::new(0),
                received: AtomicI64::new(0),
                self_echo_dropped: AtomicI64::new(0),
            }),
            metrics,
        }
    }

    fn topic(&self, channel: Channel) -> String {
        format!("{}events:{}", self.prefix, channel.as_str())
    }

    /// Subscribes to every fixed channel over one broker connection and
    /// dispatches decoded events to local subscribers.
    pub async fn start(&self) -> Result<()> {
        let channels: Vec<String> = [
            Channel::Agent,
            Channel::Model,
            Channel::Abort,
            Channel::Config,
            Channel::Health,
        ]
        .iter()
        .map(|c| self.topic(*c))
        .collect();
        let mut rx = self.broker.subscribe(&channels).await?;
        let prefix = self.prefix.clone();
        let sender_id = self.sender_id.clone();
        let subscribers_source = SubscriberFanout {
            subscribers: self.subscribers.clone(),
        };
        let stopped = self.stopped.clone();
        let stats = self.stats.clone();

        let task = tokio::spawn(async move {
            while !stopped.load(Ordering::SeqCst) {
                let msg: BrokerMessage = match rx.recv().await {
                    Some(m) => m,
                    None => break,
                };
                let Some(channel) = channel_from_topic(&prefix, &msg.channel) else {
                    continue;
                };
                let Ok(event) = serde_json::from_slice::<Event>(&msg.payload) else {
                    tracing::warn!(channel = %msg.channel, "dropping malformed event payload");
                    continue;
                };
                if event.sender == sender_id {
                    stats.self_echo_dropped.fetch_add(1, Ordering::SeqCst);
                    continue;
                }
                stats.received.fetch_add(1, Ordering::SeqCst);
                subscribers_source.dispatch(channel, event);
            }
        });
        *self.task.write() = Some(task);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.write().take() {
            task.abort();
        }
        Ok(())
    }

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().entry(channel).or_default().push(tx);
        rx
    }

    /// Drops all registered subscribers for `channel`. The reference
    /// implementation tracks per-callback unsubscription; here, since
    /// subscribers are receivers, "unsubscribing" means dropping the
    /// receiver, which this clears proactively for callers that want an
    /// explicit reset.
    pub fn unsubscribe_all(&self, channel: Channel) {
        self.subscribers.write().remove(&channel);
    }

    pub async fn publish(&self, channel: Channel, event_type: &str, data: serde_json::Value) -> Result<i64> {
        let event = Event {
            event_type: event_type.to_string(),
            data,
            sender: self.sender_id.clone(),
            timestamp: nexus_types::now_unix(),
        };
        let payload = serde_json::to_vec(&event).unwrap_or_default();
        let n = self.broker.publish(&self.topic(channel), &payload).await?;
        self.stats.published.fetch_add(1, Ordering::SeqCst);
        self.metrics.record_event_published();
        Ok(n)
    }

    pub async fn publish_agent_event(&self, event_type: &str, data: serde_json::Value) -> Result<i64> {
        self.publish(Channel::Agent, event_type, data).await
    }

    pub async fn publish_model_event(&self, event_type: &str, data: serde_json::Value) -> Result<i64> {
        self.publish(Channel::Model, event_type, data).await
    }

    pub async fn publish_abort(&self, conv_id: &str, reason: &str) -> Result<i64> {
        self.publish(Channel::Abort, "abort", serde_json::json!({ "conv_id": conv_id, "reason": reason }))
            .await
    }

    pub async fn publish_config_change(&self, data: serde_json::Value) -> Result<i64> {
        self.publish(Channel::Config, "config_changed", data).await
    }

    pub async fn publish_health_event(&self, event_type: &str, data: serde_json::Value) -> Result<i64> {
        self.publish(Channel::Health, event_type, data).await
    }

    pub fn get_stats(&self) -> serde_json::Value {
        let subscribers = self.subscribers.read();
        serde_json::json!({
            "published": self.stats.published.load(Ordering::SeqCst),
            "received": self.stats.received.load(Ordering::SeqCst),
            "self_echo_dropped": self.stats.self_echo_dropped.load(Ordering::SeqCst),
            "subscribers": [
                Channel::Agent, Channel::Model, Channel::Abort, Channel::Config, Channel::Health,
            ].iter().map(|c| (c.as_str(), subscribers.get(c).map(Vec::len).unwrap_or(0))).collect::<std::collections::HashMap<_, _>>(),
        })
    }
}

struct SubscriberFanout {
    subscribers: Arc<RwLock<HashMap<Channel, Vec<mpsc::UnboundedSender<Event>>>>>,
}

impl SubscriberFanout {
    fn dispatch(&self, channel: Channel, event: Event) {
        let mut map = self.subscribers.write();
        if let Some(subs) = map.get_mut(&channel) {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

fn channel_from_topic(prefix: &str, topic: &str) -> Option<Channel> {
    let suffix = topic.strip_prefix(prefix)?.strip_prefix("events:")?;
    match suffix {
        "agent" => Some(Channel::Agent),
        "model" => Some(Channel::Model),
        "abort" => Some(Channel::Abort),
        "config" => Some(Channel::Config),
        "health" => Some(Channel::Health),
        _ => None,
    }
}
