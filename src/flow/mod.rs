//! Flow definitions and their lifecycle
//!
//! - `types`: serializable definition model and flow states
//! - `validate`: structural checks run before a definition is registered
//! - `storage`: one JSON file per flow
//! - `runtime`: the per-flow state machine and dispatcher
//! - `manager`: registry of all flows and the control operations on them

pub mod manager;
pub mod runtime;
pub mod storage;
pub mod types;
pub mod validate;

pub use manager::Manager;
pub use runtime::{Flow, FlowOpContext};
pub use storage::FlowStorage;
pub use types::{FlowControlOp, FlowListItem, FlowMeta, FlowState, MetaNode, NodeId};
