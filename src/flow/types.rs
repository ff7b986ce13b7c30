//! Flow definition types
//!
//! `FlowMeta` is the persisted form of a flow: it is what lives in the flow
//! storage directory and what the control surfaces exchange. Field order is
//! fixed so a definition serializes to the same bytes every time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, str::FromStr};

use crate::error::FlowError;

/// Node id, unique within one flow
pub type NodeId = String;

/// Persisted flow definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowMeta {
    /// Unique flow id; also the storage file stem
    #[serde(default)]
    pub id: String,
    /// Human-readable label
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub created_at: String,
    /// A disabled flow is loaded but not started
    #[serde(default)]
    pub is_disabled: bool,
    /// Nodes in declaration order
    #[serde(default)]
    pub nodes: Vec<MetaNode>,
}

impl FlowMeta {
    /// Empty definition with the given id
    pub fn skeleton(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: "New flow".to_string(),
            description: String::new(),
            group: String::new(),
            author: String::new(),
            version: 1,
            created_at: chrono::Utc::now().to_rfc3339(),
            is_disabled: false,
            nodes: Vec::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&MetaNode> {
        self.nodes.iter().find(|n| n.id == node_id)
    }
}

/// Definition of one node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaNode {
    pub id: NodeId,
    /// Node type tag, resolved through the node registry
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub label: String,
    /// Empty means terminal
    #[serde(default)]
    pub success_transition: NodeId,
    #[serde(default)]
    pub error_transition: NodeId,
    #[serde(default)]
    pub timeout_transition: NodeId,
    /// Topic (or topic pattern for reactors) the node talks to
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub service: String,
    /// Message type, e.g. "cmd.light.set"
    #[serde(default)]
    pub service_interface: String,
    /// Type-specific configuration, decoded by the node variant
    #[serde(default)]
    pub config: Value,
}

impl MetaNode {
    pub fn new(id: &str, node_type: &str) -> Self {
        Self {
            id: id.to_string(),
            node_type: node_type.to_string(),
            label: String::new(),
            success_transition: String::new(),
            error_transition: String::new(),
            timeout_transition: String::new(),
            address: String::new(),
            service: String::new(),
            service_interface: String::new(),
            config: Value::Null,
        }
    }

    /// Non-empty transition targets, labelled by kind
    pub fn transitions(&self) -> impl Iterator<Item = (&'static str, &str)> {
        [
            ("success", self.success_transition.as_str()),
            ("error", self.error_transition.as_str()),
            ("timeout", self.timeout_transition.as_str()),
        ]
        .into_iter()
        .filter(|(_, target)| !target.is_empty())
    }
}

/// Runtime lifecycle state of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl FlowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Created => "CREATED",
            FlowState::Starting => "STARTING",
            FlowState::Running => "RUNNING",
            FlowState::Stopping => "STOPPING",
            FlowState::Stopped => "STOPPED",
            FlowState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lightweight summary returned by flow listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowListItem {
    pub id: String,
    pub name: String,
    pub group: String,
    pub description: String,
    pub state: FlowState,
    pub is_disabled: bool,
    pub node_count: usize,
}

/// Control operations accepted by `Manager::control_flow`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowControlOp {
    Start,
    Stop,
    SendInclusionReport,
    SendExclusionReport,
}

impl FlowControlOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowControlOp::Start => "START",
            FlowControlOp::Stop => "STOP",
            FlowControlOp::SendInclusionReport => "SEND_INCLUSION_REPORT",
            FlowControlOp::SendExclusionReport => "SEND_EXCLUSION_REPORT",
        }
    }
}

impl fmt::Display for FlowControlOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowControlOp {
    type Err = FlowError;

    /// Accepts `start`, `STOP`, `send-inclusion-report`, `SEND_EXCLUSION_REPORT`, ...
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "START" => Ok(FlowControlOp::Start),
            "STOP" => Ok(FlowControlOp::Stop),
            "SEND_INCLUSION_REPORT" => Ok(FlowControlOp::SendInclusionReport),
            "SEND_EXCLUSION_REPORT" => Ok(FlowControlOp::SendExclusionReport),
            other => Err(FlowError::InvalidOperation(format!("unknown flow control op '{}'", other))),
        }
    }
}
