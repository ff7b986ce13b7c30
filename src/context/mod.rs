//! Variable / context store
//!
//! Typed variables scoped per flow or globally, persisted in SQLite and shared
//! by every flow in the process.

pub mod store;
pub mod variable;

pub use store::ContextStore;
pub use variable::{ContextRecord, Scope, Variable, GLOBAL_SCOPE};
