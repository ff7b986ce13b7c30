#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use flowway::config::EngineConfig;
use flowway::connector::{Adapters, MessageBus};
use flowway::context::ContextStore;
use flowway::flow::{FlowStorage, Manager, MetaNode, NodeId};
use flowway::message::Message;
use flowway::node::{BaseNode, Node, NodeRegistry, DEFAULT_BUS};

/// Ids of executed recorder nodes, in execution order
#[derive(Clone, Default)]
pub struct Trace(Arc<Mutex<Vec<String>>>);

impl Trace {
    pub fn push(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Wait until at least `n` entries were recorded
    pub async fn wait_for(&self, n: usize) -> Vec<String> {
        for _ in 0..500 {
            if self.0.lock().unwrap().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.entries()
    }
}

/// Records its id. Config switches: `{"fail": true}` returns an error,
/// `{"panic": true}` panics, `{"fanout": ["x", "y"]}` replaces the success transition.
pub struct Recorder {
    base: BaseNode,
    trace: Trace,
    fail: bool,
    panic: bool,
    fanout: Option<Vec<NodeId>>,
}

#[async_trait]
impl Node for Recorder {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn on_input(&self, msg: &mut Message) -> flowway::Result<Vec<NodeId>> {
        match &msg.last_error {
            Some(_) => self.trace.push(format!("{}!", self.base.id())),
            None => self.trace.push(self.base.id().to_string()),
        }
        if self.panic {
            panic!("node {} blew up", self.base.id());
        }
        if self.fail {
            return Err(self.base.error("boom"));
        }
        Ok(self.fanout.clone().unwrap_or_else(|| self.base.success_next()))
    }
}

/// Built-in registry plus `step` (plain) and `gate` (reactor without input source)
pub fn registry(trace: &Trace) -> NodeRegistry {
    let mut registry = NodeRegistry::with_builtin();
    for (tag, is_reactor) in [("step", false), ("gate", true)] {
        let trace = trace.clone();
        registry.register(tag, is_reactor, move |base| {
            let config = &base.meta.config;
            let flag = |key: &str| config.get(key).and_then(Value::as_bool).unwrap_or(false);
            let fail = flag("fail");
            let panic = flag("panic");
            let fanout = config
                .get("fanout")
                .and_then(|v| serde_json::from_value::<Vec<NodeId>>(v.clone()).ok());
            Ok(Box::new(Recorder {
                base,
                trace: trace.clone(),
                fail,
                panic,
                fanout,
            }))
        });
    }
    registry
}

pub fn node(id: &str, node_type: &str, next: &str) -> MetaNode {
    let mut node = MetaNode::new(id, node_type);
    node.success_transition = next.to_string();
    node
}

pub struct Harness {
    pub manager: Manager,
    pub bus: Arc<MessageBus>,
    pub trace: Trace,
}

pub async fn harness(dir: &Path) -> Harness {
    harness_with(dir, EngineConfig::default()).await
}

pub async fn harness_with(dir: &Path, engine: EngineConfig) -> Harness {
    let trace = Trace::default();
    let bus = Arc::new(MessageBus::default());
    let adapters = Adapters::new();
    adapters
        .register_instance(DEFAULT_BUS, "bus", Value::Null, bus.clone())
        .await
        .unwrap();
    let context = ContextStore::open(dir.join("context.db")).await.unwrap();

    let manager = Manager::new(
        FlowStorage::new(dir.join("flows")),
        Arc::new(context),
        Arc::new(adapters),
        Arc::new(registry(&trace)),
        engine,
    );
    Harness { manager, bus, trace }
}
