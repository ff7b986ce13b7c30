//! Messaging fabric types
//!
//! Messages travel on hierarchical topics composed of message-type,
//! resource-type, resource-name and resource-address segments, optionally
//! followed by service-name and service-address:
//!
//! `pt:j1/mt:evt/rt:dev/rn:zw/ad:1/sv:sensor_lumin/ad:199_0`
//!
//! Reactor nodes receive messages through their flow's [`Pipeline`], a bounded
//! queue of [`ReactorEvent`]s drained by the flow's dispatcher task.

pub mod topic;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

use crate::context::Variable;
use crate::flow::types::NodeId;

pub use topic::{topic_matches, Address};

/// Payload carried on the fabric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Message type, e.g. "evt.sensor.report" or "cmd.light.set"
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Service the message is addressed to/from
    #[serde(rename = "serv", default)]
    pub service: String,
    /// Value type tag (int, float, string, bool, object, null, ...)
    #[serde(rename = "val_t", default)]
    pub value_type: String,
    #[serde(rename = "val", default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub props: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Unique message id
    #[serde(default)]
    pub uid: String,
    /// Id of the request this message answers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub corid: String,
    #[serde(default)]
    pub ctime: String,
}

impl Payload {
    pub fn new(msg_type: &str, service: &str, value_type: &str, value: Value) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            service: service.to_string(),
            value_type: value_type.to_string(),
            value,
            props: BTreeMap::new(),
            tags: Vec::new(),
            uid: uuid::Uuid::new_v4().to_string(),
            corid: String::new(),
            ctime: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn from_variable(msg_type: &str, service: &str, variable: &Variable) -> Self {
        Self::new(msg_type, service, &variable.value_type, variable.value.clone())
    }

    /// Build a reply whose `corid` points back at `request`
    pub fn reply_to(request: &Payload, msg_type: &str, value_type: &str, value: Value) -> Self {
        let mut reply = Self::new(msg_type, &request.service, value_type, value);
        reply.corid = request.uid.clone();
        reply
    }

    pub fn variable(&self) -> Variable {
        Variable::new(&self.value_type, self.value.clone())
    }

    pub fn set_variable(&mut self, variable: Variable) {
        self.value_type = variable.value_type;
        self.value = variable.value;
    }

    pub fn string_value(&self) -> Option<&str> {
        self.value.as_str()
    }
}

/// A message as seen by nodes
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic the message arrived on (or was addressed to)
    pub topic: String,
    /// Parsed address, when the topic follows the addressing convention
    pub address: Option<Address>,
    pub payload: Payload,
    /// Correlation id of a live HTTP/WebSocket connection waiting for a reply
    pub request_id: Option<u32>,
    /// Set when the walk follows an error transition
    pub last_error: Option<String>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        let topic = topic.into();
        let address = Address::parse(&topic);
        Self {
            topic,
            address,
            payload,
            request_id: None,
            last_error: None,
        }
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = Some(request_id);
        self
    }
}

/// What woke a reactor node up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Regular inbound message, handled by `on_input`
    Input,
    /// Node-internal timer expired; routed to the timeout transition
    Timeout,
}

/// Unit of work on a flow pipeline: one event for one reactor node
#[derive(Debug, Clone)]
pub struct ReactorEvent {
    pub node_id: NodeId,
    pub kind: EventKind,
    pub msg: Message,
}

impl ReactorEvent {
    pub fn input(node_id: impl Into<NodeId>, msg: Message) -> Self {
        Self {
            node_id: node_id.into(),
            kind: EventKind::Input,
            msg,
        }
    }

    pub fn timeout(node_id: impl Into<NodeId>, msg: Message) -> Self {
        Self {
            node_id: node_id.into(),
            kind: EventKind::Timeout,
            msg,
        }
    }
}

/// Sending half of a flow's ingestion queue
pub type Pipeline = mpsc::Sender<ReactorEvent>;
