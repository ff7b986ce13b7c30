//! Cron-driven trigger

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc::error::TrySendError;

use crate::connector::CronScheduler;
use crate::error::{FlowError, Result};
use crate::flow::types::NodeId;
use crate::message::{Address, Message, Payload, Pipeline, ReactorEvent};
use crate::node::{BaseNode, Node, DEFAULT_SCHEDULER};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CronExpression {
    /// Six fields, seconds first: `0 */5 * * * *`
    pub expression: String,
    /// Sent as the tick value so one node can tell its schedules apart
    #[serde(default)]
    pub name: String,
}

fn default_connector() -> String {
    DEFAULT_SCHEDULER.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeTriggerConfig {
    #[serde(default = "default_connector")]
    pub connector: String,
    pub expressions: Vec<CronExpression>,
}

pub struct TimeTriggerNode {
    base: BaseNode,
    config: TimeTriggerConfig,
    scheduler: OnceLock<Arc<CronScheduler>>,
}

impl TimeTriggerNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config: TimeTriggerConfig = base.load_config()?;
        if config.expressions.is_empty() {
            return Err(FlowError::config(base.id(), "at least one cron expression is required"));
        }
        Ok(Self {
            base,
            config,
            scheduler: OnceLock::new(),
        })
    }
}

#[async_trait]
impl Node for TimeTriggerNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self) -> Result<()> {
        let scheduler = self
            .base
            .adapters()
            .connection::<CronScheduler>(&self.config.connector)?;
        let _ = self.scheduler.set(scheduler);
        Ok(())
    }

    async fn on_input(&self, _msg: &mut Message) -> Result<Vec<NodeId>> {
        Ok(self.base.success_next())
    }

    async fn configure_in_stream(&self, active_subscriptions: &mut Vec<String>, pipeline: &Pipeline) -> Result<()> {
        let scheduler = self.scheduler.get().ok_or_else(|| self.base.error("not initialised"))?;
        let owner = self.base.owner();
        let topic = Address::new("evt", "app", "scheduler", self.base.flow_id()).to_topic();

        for cron in &self.config.expressions {
            let pipeline = pipeline.clone();
            let node_id = self.base.id().to_string();
            let topic = topic.clone();
            let name = cron.name.clone();
            let callback = Arc::new(move || {
                let payload = Payload::new("evt.timeline.tick", "scheduler", "string", json!(name));
                let event = ReactorEvent::input(node_id.clone(), Message::new(topic.clone(), payload));
                if let Err(TrySendError::Full(_)) = pipeline.try_send(event) {
                    tracing::warn!(nid = %node_id, "Pipeline full, cron tick dropped");
                }
            });

            if let Err(e) = scheduler.add_job(&owner, &cron.expression, callback).await {
                scheduler.remove_jobs(&owner).await;
                return Err(e);
            }
            active_subscriptions.push(format!("cron:{}", cron.expression));
        }
        Ok(())
    }

    async fn release_in_stream(&self) {
        if let Some(scheduler) = self.scheduler.get() {
            scheduler.remove_jobs(&self.base.owner()).await;
        }
    }
}
