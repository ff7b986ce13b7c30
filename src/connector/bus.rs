//! In-process message bus
//!
//! Topic-based pub/sub with MQTT-style wildcards. Reactor nodes subscribe with
//! their flow's pipeline; everything else (control API, tests, request/reply)
//! uses tap subscriptions that hand back a receiver.

use async_trait::async_trait;
use serde::Deserialize;
use std::{
    any::Any,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::connector::Connector;
use crate::error::{FlowError, Result};
use crate::flow::types::NodeId;
use crate::message::{topic_matches, Message, Payload, Pipeline, ReactorEvent};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Capacity of tap subscription queues
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { queue_capacity: 256 }
    }
}

#[derive(Debug)]
enum Sink {
    Reactor { node_id: NodeId, pipeline: Pipeline },
    Tap(mpsc::Sender<Message>),
}

#[derive(Debug)]
struct Subscription {
    owner: String,
    pattern: String,
    sink: Sink,
}

impl Subscription {
    fn is_closed(&self) -> bool {
        match &self.sink {
            Sink::Reactor { pipeline, .. } => pipeline.is_closed(),
            Sink::Tap(tx) => tx.is_closed(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MessageBus {
    config: BusConfig,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            subscriptions: RwLock::new(Vec::new()),
        }
    }

    fn subs(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Subscription>> {
        self.subscriptions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver matching messages to a reactor node through its flow pipeline
    pub fn subscribe_reactor(&self, owner: &str, pattern: &str, node_id: &str, pipeline: Pipeline) {
        tracing::debug!("Bus subscription {} -> {}", pattern, owner);
        self.subs().push(Subscription {
            owner: owner.to_string(),
            pattern: pattern.to_string(),
            sink: Sink::Reactor {
                node_id: node_id.to_string(),
                pipeline,
            },
        });
    }

    /// Subscribe with a dedicated queue
    pub fn subscribe(&self, owner: &str, pattern: &str) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        self.subs().push(Subscription {
            owner: owner.to_string(),
            pattern: pattern.to_string(),
            sink: Sink::Tap(tx),
        });
        rx
    }

    /// Drop every subscription held by `owner`; returns how many were removed
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut subs = self.subs();
        let before = subs.len();
        subs.retain(|s| s.owner != owner);
        before - subs.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Publish without blocking; full queues drop the message with a warning.
    /// Returns the number of subscribers the message was handed to.
    pub fn publish(&self, topic: &str, payload: Payload) -> usize {
        let msg = Message::new(topic, payload);
        let mut delivered = 0;
        let mut saw_closed = false;
        {
            let subs = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
            for sub in subs.iter().filter(|s| topic_matches(&s.pattern, topic)) {
                let result = match &sub.sink {
                    Sink::Reactor { node_id, pipeline } => pipeline
                        .try_send(ReactorEvent::input(node_id.clone(), msg.clone()))
                        .map_err(|e| matches!(e, TrySendError::Closed(_))),
                    Sink::Tap(tx) => tx
                        .try_send(msg.clone())
                        .map_err(|e| matches!(e, TrySendError::Closed(_))),
                };
                match result {
                    Ok(()) => delivered += 1,
                    Err(true) => saw_closed = true,
                    Err(false) => {
                        tracing::warn!("Queue of {} is full, dropping message on {}", sub.owner, topic)
                    }
                }
            }
        }
        if saw_closed {
            self.subs().retain(|s| !s.is_closed());
        }
        tracing::trace!("Published {} to {} subscribers", topic, delivered);
        delivered
    }

    /// Publish `payload` and wait for the message whose `corid` equals its `uid`
    pub async fn request(
        &self,
        topic: &str,
        payload: Payload,
        response_pattern: &str,
        timeout: Duration,
    ) -> Result<Message> {
        let owner = format!("request/{}", payload.uid);
        let uid = payload.uid.clone();
        let mut rx = self.subscribe(&owner, response_pattern);
        self.publish(topic, payload);

        let wait = async {
            while let Some(msg) = rx.recv().await {
                if msg.payload.corid == uid {
                    return Some(msg);
                }
            }
            None
        };
        let outcome = tokio::time::timeout(timeout, wait).await;
        self.unsubscribe_owner(&owner);

        match outcome {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(FlowError::connector("bus", "response subscription closed")),
            Err(_) => Err(FlowError::Timeout(format!(
                "no response to {} within {:?}",
                topic, timeout
            ))),
        }
    }
}

#[async_trait]
impl Connector for MessageBus {
    fn plugin(&self) -> &'static str {
        "bus"
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.subs().clear();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventKind;
    use serde_json::json;

    const REPORT: &str = "pt:j1/mt:evt/rt:dev/rn:test/ad:1/sv:sensor_lumin/ad:199_0";

    fn report(value: i64) -> Payload {
        Payload::new("evt.sensor.report", "sensor_lumin", "int", json!(value))
    }

    #[tokio::test]
    async fn wildcard_tap_receives_matching_messages_only() {
        let bus = MessageBus::default();
        let mut rx = bus.subscribe("test", "pt:j1/mt:evt/+/+/+/sv:sensor_lumin/+");

        assert_eq!(bus.publish(REPORT, report(1)), 1);
        assert_eq!(bus.publish("pt:j1/mt:cmd/rt:dev/rn:test/ad:1/sv:out_bin_switch/ad:1", report(2)), 0);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload.value, json!(1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reactor_subscription_feeds_pipeline_with_node_id() {
        let bus = MessageBus::default();
        let (tx, mut rx) = mpsc::channel(4);
        bus.subscribe_reactor("f1/n1", REPORT, "n1", tx);

        bus.publish(REPORT, report(50));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.node_id, "n1");
        assert_eq!(event.kind, EventKind::Input);
        assert_eq!(event.msg.address.unwrap().service_name, "sensor_lumin");
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let bus = MessageBus::new(BusConfig { queue_capacity: 1 });
        let _rx = bus.subscribe("slow", "#");
        assert_eq!(bus.publish(REPORT, report(1)), 1);
        assert_eq!(bus.publish(REPORT, report(2)), 0);
    }

    #[tokio::test]
    async fn unsubscribe_owner_removes_only_its_subscriptions() {
        let bus = MessageBus::default();
        let _a = bus.subscribe("f1/n1", "#");
        let _b = bus.subscribe("f1/n1", REPORT);
        let _c = bus.subscribe("f2/n1", "#");
        assert_eq!(bus.unsubscribe_owner("f1/n1"), 2);
        assert_eq!(bus.subscription_count(), 1);
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let bus = MessageBus::default();
        drop(bus.subscribe("gone", "#"));
        bus.publish(REPORT, report(1));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[tokio::test]
    async fn request_waits_for_correlated_reply() {
        let bus = Arc::new(MessageBus::default());
        let mut server = bus.subscribe("server", "pt:j1/mt:cmd/rt:app/rn:svc/ad:1");

        let responder = bus.clone();
        tokio::spawn(async move {
            let req = server.recv().await.unwrap();
            // unrelated reply first
            responder.publish("pt:j1/mt:evt/rt:app/rn:svc/ad:1", report(0));
            let reply = Payload::reply_to(&req.payload, "evt.svc.report", "string", json!("pong"));
            responder.publish("pt:j1/mt:evt/rt:app/rn:svc/ad:1", reply);
        });

        let request = Payload::new("cmd.svc.ping", "svc", "null", serde_json::Value::Null);
        let reply = bus
            .request(
                "pt:j1/mt:cmd/rt:app/rn:svc/ad:1",
                request,
                "pt:j1/mt:evt/rt:app/rn:svc/ad:1",
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(reply.payload.value, json!("pong"));
        assert_eq!(bus.subscription_count(), 1);
    }

    #[tokio::test]
    async fn request_without_reply_times_out() {
        let bus = MessageBus::default();
        let request = Payload::new("cmd.svc.ping", "svc", "null", serde_json::Value::Null);
        let err = bus
            .request("pt:j1/mt:cmd/rt:app/rn:svc/ad:1", request, "#", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Timeout(_)));
    }
}
