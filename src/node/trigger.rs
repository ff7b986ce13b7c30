//! Bus trigger: starts a walk for every matching message on `address`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, OnceLock, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{mpsc::error::TrySendError, Notify},
    task::JoinHandle,
};

use crate::connector::MessageBus;
use crate::error::{FlowError, Result};
use crate::flow::types::NodeId;
use crate::message::{Message, Payload, Pipeline, ReactorEvent};
use crate::node::{BaseNode, Node, DEFAULT_BUS};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
    #[serde(default = "default_connector")]
    pub connector: String,
    /// Only messages carrying exactly this value pass
    #[serde(default)]
    pub value_filter: Option<Value>,
    /// Store the incoming value under this name; empty = don't
    #[serde(default)]
    pub save_to_variable: String,
    #[serde(default)]
    pub is_variable_global: bool,
    #[serde(default)]
    pub is_variable_in_memory: bool,
    /// Inject a timeout event when nothing arrives for this long; 0 = off
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub register_as_virtual_service: bool,
    #[serde(default)]
    pub virtual_service_group: String,
    #[serde(default)]
    pub virtual_service_props: BTreeMap<String, Value>,
}

fn default_connector() -> String {
    DEFAULT_BUS.to_string()
}

struct TimeoutTimer {
    reset: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct TriggerNode {
    base: BaseNode,
    config: TriggerConfig,
    bus: OnceLock<Arc<MessageBus>>,
    timer: Mutex<Option<TimeoutTimer>>,
}

impl TriggerNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config: TriggerConfig = base.load_config()?;
        if base.meta.address.is_empty() {
            return Err(FlowError::config(base.id(), "address is required"));
        }
        Ok(Self {
            base,
            config,
            bus: OnceLock::new(),
            timer: Mutex::new(None),
        })
    }

    fn bus(&self) -> Result<&Arc<MessageBus>> {
        self.bus
            .get()
            .ok_or_else(|| self.base.error("not initialised"))
    }

    fn accepts(&self, msg: &Message) -> bool {
        let meta = &self.base.meta;
        if !meta.service_interface.is_empty() && msg.payload.msg_type != meta.service_interface {
            return false;
        }
        if !meta.service.is_empty() && msg.payload.service != meta.service {
            return false;
        }
        match &self.config.value_filter {
            Some(expected) => msg.payload.value == *expected,
            None => true,
        }
    }

    fn start_timer(&self, pipeline: &Pipeline) {
        let reset = Arc::new(Notify::new());
        let period = Duration::from_secs(self.config.timeout_secs);
        let task = tokio::spawn(timeout_loop(
            period,
            reset.clone(),
            pipeline.clone(),
            self.base.id().to_string(),
            self.base.meta.address.clone(),
        ));
        let previous = self
            .timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(TimeoutTimer { reset, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    fn reset_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            timer.reset.notify_one();
        }
    }
}

async fn timeout_loop(period: Duration, reset: Arc<Notify>, pipeline: Pipeline, node_id: NodeId, topic: String) {
    loop {
        tokio::select! {
            _ = reset.notified() => continue,
            _ = tokio::time::sleep(period) => {
                tracing::debug!(nid = %node_id, "No input for {:?}", period);
                let msg = Message::new(
                    topic.clone(),
                    Payload::new("evt.timeline.timeout", "", "null", Value::Null),
                );
                match pipeline.try_send(ReactorEvent::timeout(node_id.clone(), msg)) {
                    Err(TrySendError::Closed(_)) => break,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(nid = %node_id, "Pipeline full, timeout event dropped")
                    }
                    Ok(()) => {}
                }
            }
        }
    }
}

#[async_trait]
impl Node for TriggerNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self) -> Result<()> {
        let bus = self.base.adapters().connection::<MessageBus>(&self.config.connector)?;
        let _ = self.bus.set(bus);
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        if !self.accepts(msg) {
            tracing::trace!("Message on {} filtered out", msg.topic);
            return Ok(Vec::new());
        }
        self.reset_timer();

        if !self.config.save_to_variable.is_empty() {
            self.base
                .save_variable(
                    &self.config.save_to_variable,
                    self.config.is_variable_global,
                    self.config.is_variable_in_memory,
                    msg.payload.variable(),
                )
                .await?;
        }
        Ok(self.base.success_next())
    }

    async fn configure_in_stream(&self, active_subscriptions: &mut Vec<String>, pipeline: &Pipeline) -> Result<()> {
        let address = &self.base.meta.address;
        self.bus()?
            .subscribe_reactor(&self.base.owner(), address, self.base.id(), pipeline.clone());
        active_subscriptions.push(address.clone());

        if self.config.timeout_secs > 0 {
            self.start_timer(pipeline);
        }
        Ok(())
    }

    async fn release_in_stream(&self) {
        if let Some(bus) = self.bus.get() {
            bus.unsubscribe_owner(&self.base.owner());
        }
        if let Some(timer) = self.timer.lock().unwrap_or_else(PoisonError::into_inner).take() {
            timer.task.abort();
        }
    }
}
