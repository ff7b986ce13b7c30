//! Engine-level error types.
//!
//! Node errors are recovered through the node's error/timeout transitions;
//! everything the manager returns to a caller is one of these variants.

use thiserror::Error;

use crate::flow::types::FlowState;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors produced by the flow engine.
#[derive(Debug, Error)]
pub enum FlowError {
    // ------ Definition errors ------
    /// Raw flow JSON (or a control request body) could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// Flow definition is structurally invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// A node's configuration payload does not match the variant's schema.
    #[error("config of node '{node_id}' can't be decoded: {message}")]
    ConfigDecode { node_id: String, message: String },

    // ------ Lookup errors ------
    /// Unknown flow, node, variable or connector.
    #[error("not found: {0}")]
    NotFound(String),

    // ------ Execution errors ------
    /// Raised by a node's `on_input`.
    #[error("node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// Raised by timer expiry or a bounded wait running out.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Flow is not in a state that allows the requested operation.
    #[error("flow '{flow_id}' can't {op} while {state}")]
    InvalidStateTransition {
        flow_id: String,
        op: String,
        state: FlowState,
    },

    /// Unknown control operation or otherwise unsupported request.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    // ------ Resource errors ------
    /// Flow storage read/write failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Context store persistence failure.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Connector failed to reach RUNNING, or is not usable by the caller.
    #[error("connector '{name}' unavailable: {message}")]
    ConnectorInit { name: String, message: String },
}

impl FlowError {
    pub fn node(node_id: impl Into<String>, message: impl ToString) -> Self {
        FlowError::NodeExecution {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }

    pub fn config(node_id: impl Into<String>, message: impl ToString) -> Self {
        FlowError::ConfigDecode {
            node_id: node_id.into(),
            message: message.to_string(),
        }
    }

    pub fn connector(name: impl Into<String>, message: impl ToString) -> Self {
        FlowError::ConnectorInit {
            name: name.into(),
            message: message.to_string(),
        }
    }

    /// Lookup misses are reported to the caller, never logged as faults.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FlowError::NotFound(_))
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(e: serde_json::Error) -> Self {
        FlowError::Decode(e.to_string())
    }
}
