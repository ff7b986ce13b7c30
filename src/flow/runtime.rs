//! Flow execution state machine
//!
//! A running flow owns a bounded pipeline drained by one dispatcher task. Each
//! event targets a reactor node; the dispatcher runs that node and then walks
//! the returned transitions depth-first, executing non-reactor nodes in line
//! until every path ends at a reactor, a terminal node or an unrouted error.
//! The next event is taken only after the walk finishes.

use futures::FutureExt;
use serde_json::json;
use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::EngineConfig;
use crate::connector::{Adapters, MessageBus};
use crate::context::ContextStore;
use crate::error::{FlowError, Result};
use crate::flow::types::{FlowListItem, FlowMeta, FlowState, NodeId};
use crate::message::{Address, EventKind, Message, Payload, Pipeline, ReactorEvent};
use crate::node::{Node, NodeRegistry, DEFAULT_BUS};

/// Per-flow handle shared by all nodes of that flow
pub struct FlowOpContext {
    pub flow_id: String,
    state: RwLock<FlowState>,
    pub context: Arc<ContextStore>,
    pub adapters: Arc<Adapters>,
    pub engine: EngineConfig,
}

impl FlowOpContext {
    pub fn new(
        flow_id: &str,
        context: Arc<ContextStore>,
        adapters: Arc<Adapters>,
        engine: EngineConfig,
    ) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            state: RwLock::new(FlowState::Created),
            context,
            adapters,
            engine,
        }
    }

    pub fn state(&self) -> FlowState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: FlowState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Instantiated nodes of a running flow
struct NodeGraph {
    flow_id: String,
    nodes: HashMap<NodeId, Arc<dyn Node>>,
    /// Declaration order, used for init/cleanup
    order: Vec<NodeId>,
    max_walk_steps: usize,
}

impl NodeGraph {
    fn ordered(&self) -> impl Iterator<Item = &Arc<dyn Node>> {
        self.order.iter().filter_map(|id| self.nodes.get(id))
    }

    fn reactors(&self) -> impl Iterator<Item = &Arc<dyn Node>> {
        self.ordered().filter(|n| n.is_msg_reactor())
    }

    async fn handle_event(&self, event: ReactorEvent) {
        let ReactorEvent { node_id, kind, mut msg } = event;
        let Some(node) = self.nodes.get(&node_id) else {
            tracing::warn!(fid = %self.flow_id, "Event for unknown node {}", node_id);
            return;
        };

        let next = match kind {
            EventKind::Input => self.execute(node, &mut msg).await,
            EventKind::Timeout => {
                let next = node.base().timeout_next();
                if next.is_empty() {
                    tracing::debug!(fid = %self.flow_id, nid = %node_id, "Timeout without timeout transition");
                }
                next
            }
        };
        self.walk(next, msg).await;
    }

    /// Run one node; errors and panics are turned into the matching transition
    async fn execute(&self, node: &Arc<dyn Node>, msg: &mut Message) -> Vec<NodeId> {
        let base = node.base();
        let outcome = AssertUnwindSafe(node.on_input(msg).instrument(base.span().clone()))
            .catch_unwind()
            .await;

        let err = match outcome {
            Ok(Ok(next)) => return next,
            Ok(Err(e)) => e,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                base.error(format!("panicked: {}", reason))
            }
        };

        let target = match err {
            FlowError::Timeout(_) if !base.meta.timeout_transition.is_empty() => &base.meta.timeout_transition,
            _ => &base.meta.error_transition,
        };
        if target.is_empty() {
            tracing::error!(fid = %self.flow_id, nid = %base.id(), "Node error: {}", err);
            return Vec::new();
        }
        tracing::debug!(fid = %self.flow_id, nid = %base.id(), "Routing error to {}: {}", target, err);
        msg.last_error = Some(err.to_string());
        vec![target.clone()]
    }

    async fn walk(&self, next: Vec<NodeId>, msg: Message) {
        let mut stack: Vec<(NodeId, Message)> = next.into_iter().rev().map(|id| (id, msg.clone())).collect();
        let mut steps = 0;

        while let Some((node_id, mut msg)) = stack.pop() {
            let Some(node) = self.nodes.get(&node_id) else {
                tracing::error!(fid = %self.flow_id, "Transition to unknown node {}", node_id);
                continue;
            };
            if node.is_msg_reactor() {
                // waits for its own input
                continue;
            }

            steps += 1;
            if steps > self.max_walk_steps {
                tracing::error!(
                    fid = %self.flow_id,
                    "Walk exceeded {} steps, dropping the rest of it",
                    self.max_walk_steps
                );
                return;
            }

            let next = self.execute(node, &mut msg).await;
            stack.extend(next.into_iter().rev().map(|id| (id, msg.clone())));
        }
    }
}

struct FlowRuntime {
    graph: Arc<NodeGraph>,
    subscriptions: Vec<String>,
    pipeline: Pipeline,
    cancel: CancellationToken,
    dispatcher: JoinHandle<()>,
}

async fn dispatch(graph: Arc<NodeGraph>, mut rx: mpsc::Receiver<ReactorEvent>, cancel: CancellationToken) {
    tracing::debug!(fid = %graph.flow_id, "Dispatcher started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => graph.handle_event(event).await,
                None => break,
            },
        }
    }
    tracing::debug!(fid = %graph.flow_id, "Dispatcher stopped");
}

/// A flow definition plus its running node graph
pub struct Flow {
    meta: RwLock<FlowMeta>,
    ctx: Arc<FlowOpContext>,
    registry: Arc<NodeRegistry>,
    runtime: Mutex<Option<FlowRuntime>>,
    last_error: RwLock<Option<String>>,
}

impl Flow {
    pub fn new(
        meta: FlowMeta,
        context: Arc<ContextStore>,
        adapters: Arc<Adapters>,
        registry: Arc<NodeRegistry>,
        engine: EngineConfig,
    ) -> Self {
        let ctx = Arc::new(FlowOpContext::new(&meta.id, context, adapters, engine));
        Self {
            meta: RwLock::new(meta),
            ctx,
            registry,
            runtime: Mutex::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.ctx.flow_id
    }

    pub fn state(&self) -> FlowState {
        self.ctx.state()
    }

    pub fn op_context(&self) -> &Arc<FlowOpContext> {
        &self.ctx
    }

    pub fn definition(&self) -> FlowMeta {
        self.meta.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn node_count(&self) -> usize {
        self.meta.read().unwrap_or_else(PoisonError::into_inner).nodes.len()
    }

    pub fn is_disabled(&self) -> bool {
        self.meta.read().unwrap_or_else(PoisonError::into_inner).is_disabled
    }

    pub(crate) fn set_disabled(&self, disabled: bool) {
        self.meta.write().unwrap_or_else(PoisonError::into_inner).is_disabled = disabled;
    }

    /// Reason of the last failed start
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn list_item(&self) -> FlowListItem {
        let meta = self.meta.read().unwrap_or_else(PoisonError::into_inner);
        FlowListItem {
            id: meta.id.clone(),
            name: meta.name.clone(),
            group: meta.group.clone(),
            description: meta.description.clone(),
            state: self.state(),
            is_disabled: meta.is_disabled,
            node_count: meta.nodes.len(),
        }
    }

    /// Topics/streams the reactor nodes are listening on
    pub async fn active_subscriptions(&self) -> Vec<String> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.subscriptions.clone())
            .unwrap_or_default()
    }

    /// Instantiate, init and subscribe every node; all or nothing
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let state = self.state();
        if runtime.is_some() || matches!(state, FlowState::Running | FlowState::Starting) {
            return Err(FlowError::InvalidStateTransition {
                flow_id: self.id().to_string(),
                op: "start".into(),
                state,
            });
        }

        tracing::info!(fid = %self.id(), "Starting flow");
        self.ctx.set_state(FlowState::Starting);
        match self.launch().await {
            Ok(rt) => {
                tracing::info!(
                    fid = %self.id(),
                    "Flow is running with {} nodes, subscriptions: {:?}",
                    rt.graph.nodes.len(),
                    rt.subscriptions
                );
                *runtime = Some(rt);
                *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = None;
                self.ctx.set_state(FlowState::Running);
                Ok(())
            }
            Err(e) => {
                tracing::error!(fid = %self.id(), "Flow failed to start: {}", e);
                *self.last_error.write().unwrap_or_else(PoisonError::into_inner) = Some(e.to_string());
                self.ctx.set_state(FlowState::Failed);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<FlowRuntime> {
        let meta = self.definition();
        let mut nodes: HashMap<NodeId, Arc<dyn Node>> = HashMap::new();
        for node_meta in &meta.nodes {
            let node: Arc<dyn Node> = Arc::from(self.registry.create(node_meta, self.ctx.clone())?);
            nodes.insert(node_meta.id.clone(), node);
        }
        let graph = Arc::new(NodeGraph {
            flow_id: meta.id.clone(),
            nodes,
            order: meta.nodes.iter().map(|n| n.id.clone()).collect(),
            max_walk_steps: self.ctx.engine.max_walk_steps,
        });

        let mut initialised: Vec<&Arc<dyn Node>> = Vec::new();
        for node in graph.ordered() {
            if let Err(e) = node.init().await {
                cleanup_all(initialised.into_iter()).await;
                return Err(e);
            }
            initialised.push(node);
        }

        let (pipeline, rx) = mpsc::channel(self.ctx.engine.pipeline_capacity.max(1));
        let mut subscriptions = Vec::new();
        let mut configured: Vec<&Arc<dyn Node>> = Vec::new();
        for node in graph.reactors() {
            if let Err(e) = node.configure_in_stream(&mut subscriptions, &pipeline).await {
                for node in configured {
                    node.release_in_stream().await;
                }
                cleanup_all(graph.ordered()).await;
                return Err(e);
            }
            configured.push(node);
        }

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(graph.clone(), rx, cancel.clone()));
        Ok(FlowRuntime {
            graph,
            subscriptions,
            pipeline,
            cancel,
            dispatcher,
        })
    }

    /// Release subscriptions, stop the dispatcher and clean every node up.
    /// Stopping a flow that isn't running is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let Some(rt) = runtime.take() else {
            if matches!(self.state(), FlowState::Created | FlowState::Failed) {
                self.ctx.set_state(FlowState::Stopped);
            }
            return Ok(());
        };

        tracing::info!(fid = %self.id(), "Stopping flow");
        self.ctx.set_state(FlowState::Stopping);
        for node in rt.graph.reactors() {
            node.release_in_stream().await;
        }

        rt.cancel.cancel();
        let abort = rt.dispatcher.abort_handle();
        let limit = Duration::from_millis(self.ctx.engine.stop_timeout_ms);
        if tokio::time::timeout(limit, rt.dispatcher).await.is_err() {
            tracing::warn!(fid = %self.id(), "Dispatcher didn't finish within {:?}, aborting", limit);
            abort.abort();
        }

        cleanup_all(rt.graph.ordered()).await;
        self.ctx.set_state(FlowState::Stopped);
        tracing::info!(fid = %self.id(), "Flow stopped");
        Ok(())
    }

    /// Queue an event for a node of this flow
    pub async fn send_event(&self, event: ReactorEvent) -> Result<()> {
        let pipeline = self
            .runtime
            .lock()
            .await
            .as_ref()
            .map(|rt| rt.pipeline.clone())
            .ok_or_else(|| FlowError::InvalidStateTransition {
                flow_id: self.id().to_string(),
                op: "receive messages".into(),
                state: self.state(),
            })?;
        pipeline
            .send(event)
            .await
            .map_err(|_| FlowError::InvalidOperation(format!("pipeline of flow '{}' is closed", self.id())))
    }

    /// Announce the flow as a virtual device on the bus
    pub fn send_inclusion_report(&self) -> Result<()> {
        let meta = self.definition();
        let services: Vec<_> = meta
            .nodes
            .iter()
            .filter(|n| {
                n.config
                    .get("register_as_virtual_service")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
            })
            .map(|n| {
                json!({
                    "name": n.service,
                    "interface": n.service_interface,
                    "address": n.address,
                    "group": n.config.get("virtual_service_group").cloned().unwrap_or_else(|| json!("")),
                    "props": n.config.get("virtual_service_props").cloned().unwrap_or_else(|| json!({})),
                    "node_id": n.id,
                })
            })
            .collect();
        let report = json!({
            "address": meta.id,
            "name": meta.name,
            "group": meta.group,
            "services": services,
        });
        self.publish_report("evt.thing.inclusion_report", report)
    }

    pub fn send_exclusion_report(&self) -> Result<()> {
        self.publish_report("evt.thing.exclusion_report", json!({ "address": self.id() }))
    }

    fn publish_report(&self, msg_type: &str, report: serde_json::Value) -> Result<()> {
        let bus = self.ctx.adapters.connection::<MessageBus>(DEFAULT_BUS)?;
        let topic = Address::new("evt", "ad", "flowway", "1").to_topic();
        bus.publish(&topic, Payload::new(msg_type, "flowway", "object", report));
        tracing::info!(fid = %self.id(), "Published {}", msg_type);
        Ok(())
    }
}

async fn cleanup_all<'a>(nodes: impl Iterator<Item = &'a Arc<dyn Node>>) {
    for node in nodes {
        if let Err(e) = node.cleanup().await {
            tracing::warn!(nid = %node.base().id(), "Cleanup failed: {}", e);
        }
    }
}
