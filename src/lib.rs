/// flowway: message-driven flow automation engine
///
/// Flows are graphs of nodes. Reactor nodes listen on the message bus, HTTP
/// bridge or scheduler; every inbound message is walked through the graph by the
/// flow's dispatcher. Definitions are hot-swapped through the `Manager`.

// Process configuration and logging bootstrap
pub mod config;
pub mod logging;

pub mod error;

// Messaging fabric types
pub mod message;

// Variable store shared by flows
pub mod context;

// Shared I/O resources: bus, HTTP bridge, scheduler
pub mod connector;

// Node contract and built-in node types
pub mod node;

// Flow definitions, runtime and manager
pub mod flow;

// REST and bus control surfaces
pub mod api;

pub mod server;

pub use error::{FlowError, Result};
pub use flow::{Flow, FlowMeta, FlowState, Manager, MetaNode};
pub use message::{Message, Payload};
pub use node::{Node, NodeRegistry};
pub use server::start_server;
