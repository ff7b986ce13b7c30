//! Node contract and the node type registry
//!
//! A node is built from its `MetaNode` when a flow starts. Construction decodes
//! the typed configuration; `init` acquires connector handles; reactor nodes
//! then get `configure_in_stream` to hook their input source to the flow
//! pipeline. `on_input` returns the ids of the nodes to run next.

pub mod action;
pub mod http;
pub mod logic;
pub mod rest;
pub mod script;
pub mod time;
pub mod trigger;
pub mod variable;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};

use crate::connector::Adapters;
use crate::context::{ContextStore, Scope, Variable};
use crate::error::{FlowError, Result};
use crate::flow::runtime::FlowOpContext;
use crate::flow::types::{MetaNode, NodeId};
use crate::message::{Message, Pipeline};

/// Connector names nodes use unless configured otherwise
pub const DEFAULT_BUS: &str = "msgbus";
pub const DEFAULT_HTTP: &str = "httpserv";
pub const DEFAULT_SCHEDULER: &str = "scheduler";

#[async_trait]
pub trait Node: Send + Sync {
    fn base(&self) -> &BaseNode;

    /// Reactor nodes own an input subscription and start walks
    fn is_msg_reactor(&self) -> bool {
        self.base().is_reactor()
    }

    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Handle one message; returns next node ids (empty = end of path)
    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>>;

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Register input subscriptions; only called on reactor nodes
    async fn configure_in_stream(&self, _active_subscriptions: &mut Vec<String>, _pipeline: &Pipeline) -> Result<()> {
        Ok(())
    }

    /// Undo `configure_in_stream`
    async fn release_in_stream(&self) {}
}

/// Bookkeeping shared by every node variant
pub struct BaseNode {
    pub meta: MetaNode,
    ctx: Arc<FlowOpContext>,
    is_reactor: bool,
    span: tracing::Span,
}

impl BaseNode {
    pub fn new(meta: MetaNode, ctx: Arc<FlowOpContext>, is_reactor: bool) -> Self {
        let span = tracing::info_span!(
            "fnode",
            fid = %ctx.flow_id,
            nid = %meta.id,
            ntype = %meta.node_type
        );
        Self {
            meta,
            ctx,
            is_reactor,
            span,
        }
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn flow_id(&self) -> &str {
        &self.ctx.flow_id
    }

    pub fn is_reactor(&self) -> bool {
        self.is_reactor
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn flow_context(&self) -> &Arc<FlowOpContext> {
        &self.ctx
    }

    pub fn context(&self) -> &ContextStore {
        &self.ctx.context
    }

    pub fn adapters(&self) -> &Adapters {
        &self.ctx.adapters
    }

    /// Key for bus subscriptions and scheduler jobs
    pub fn owner(&self) -> String {
        format!("{}/{}", self.ctx.flow_id, self.meta.id)
    }

    pub fn scope(&self, is_global: bool) -> Scope {
        Scope::select(is_global, &self.ctx.flow_id)
    }

    /// Write a variable into the flow or global scope
    pub async fn save_variable(&self, name: &str, is_global: bool, in_memory: bool, variable: Variable) -> Result<()> {
        let scope = self.scope(is_global);
        if in_memory {
            self.context().set_transient_variable(name, &scope, variable).await
        } else {
            self.context().set_variable(name, &scope, variable).await
        }
    }

    pub fn success_next(&self) -> Vec<NodeId> {
        transition(&self.meta.success_transition)
    }

    pub fn error_next(&self) -> Vec<NodeId> {
        transition(&self.meta.error_transition)
    }

    pub fn timeout_next(&self) -> Vec<NodeId> {
        transition(&self.meta.timeout_transition)
    }

    /// Decode the node's configuration payload into the variant's schema.
    /// A missing payload decodes as `{}`, so only declared defaults apply.
    pub fn load_config<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = match &self.meta.config {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(raw).map_err(|e| FlowError::config(&self.meta.id, e))
    }

    pub fn error(&self, message: impl ToString) -> FlowError {
        FlowError::node(&self.meta.id, message)
    }
}

fn transition(target: &str) -> Vec<NodeId> {
    if target.is_empty() {
        Vec::new()
    } else {
        vec![target.to_string()]
    }
}

pub type NodeConstructor = Arc<dyn Fn(BaseNode) -> Result<Box<dyn Node>> + Send + Sync>;

#[derive(Clone)]
struct NodeEntry {
    is_reactor: bool,
    ctor: NodeConstructor,
}

/// Type tag -> constructor map used to instantiate flow graphs
#[derive(Clone)]
pub struct NodeRegistry {
    entries: HashMap<String, NodeEntry>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl NodeRegistry {
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("trigger", true, |base| Ok(Box::new(trigger::TriggerNode::new(base)?)));
        registry.register("action", false, |base| Ok(Box::new(action::ActionNode::new(base)?)));
        registry.register("if", false, |base| Ok(Box::new(logic::IfNode::new(base)?)));
        registry.register("set_variable", false, |base| {
            Ok(Box::new(variable::SetVariableNode::new(base)?))
        });
        registry.register("script", false, |base| Ok(Box::new(script::ScriptNode::new(base)?)));
        registry.register("http_trigger", true, |base| {
            Ok(Box::new(http::HttpTriggerNode::new(base)?))
        });
        registry.register("http_reply", false, |base| Ok(Box::new(http::HttpReplyNode::new(base)?)));
        registry.register("time_trigger", true, |base| {
            Ok(Box::new(time::TimeTriggerNode::new(base)?))
        });
        registry.register("rest_action", false, |base| Ok(Box::new(rest::RestActionNode::new(base)?)));
        registry
    }

    /// Add or replace a node type
    pub fn register<F>(&mut self, node_type: &str, is_reactor: bool, ctor: F)
    where
        F: Fn(BaseNode) -> Result<Box<dyn Node>> + Send + Sync + 'static,
    {
        self.entries.insert(
            node_type.to_string(),
            NodeEntry {
                is_reactor,
                ctor: Arc::new(ctor),
            },
        );
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.entries.contains_key(node_type)
    }

    pub fn is_reactor(&self, node_type: &str) -> Option<bool> {
        self.entries.get(node_type).map(|e| e.is_reactor)
    }

    pub fn node_types(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.entries.keys().cloned().collect();
        tags.sort();
        tags
    }

    /// Instantiate a node; decode failures surface as `ConfigDecode`
    pub fn create(&self, meta: &MetaNode, ctx: Arc<FlowOpContext>) -> Result<Box<dyn Node>> {
        let entry = self.entries.get(&meta.node_type).ok_or_else(|| {
            FlowError::Validation(format!("node '{}' has unknown type '{}'", meta.id, meta.node_type))
        })?;
        (entry.ctor)(BaseNode::new(meta.clone(), ctx, entry.is_reactor))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct SampleConfig {
        name: String,
        #[serde(default)]
        is_global: bool,
    }

    fn base(config: Value) -> BaseNode {
        let ctx = Arc::new(FlowOpContext::new(
            "f1",
            Arc::new(ContextStore::in_memory()),
            Arc::new(Adapters::new()),
            Default::default(),
        ));
        let mut meta = MetaNode::new("n1", "set_variable");
        meta.success_transition = "n2".into();
        meta.config = config;
        BaseNode::new(meta, ctx, false)
    }

    #[test]
    fn config_decodes_into_typed_schema() {
        let cfg: SampleConfig = base(json!({"name": "temp"})).load_config().unwrap();
        assert_eq!(cfg.name, "temp");
        assert!(!cfg.is_global);
    }

    #[test]
    fn mismatched_config_is_config_decode_error() {
        for raw in [json!({"name": 5}), json!({"name": "x", "extra": 1}), Value::Null] {
            let err = base(raw).load_config::<SampleConfig>().unwrap_err();
            assert!(matches!(err, FlowError::ConfigDecode { ref node_id, .. } if node_id == "n1"));
        }
    }

    #[test]
    fn transitions_and_owner() {
        let node = base(Value::Null);
        assert_eq!(node.success_next(), vec!["n2".to_string()]);
        assert!(node.error_next().is_empty());
        assert_eq!(node.owner(), "f1/n1");
        assert_eq!(node.scope(true), Scope::Global);
    }

    #[test]
    fn builtin_registry_knows_reactors() {
        let registry = NodeRegistry::with_builtin();
        assert_eq!(registry.is_reactor("trigger"), Some(true));
        assert_eq!(registry.is_reactor("action"), Some(false));
        assert_eq!(registry.is_reactor("nope"), None);
        assert!(registry.node_types().contains(&"rest_action".to_string()));
    }
}
