//! Stores the message value (or a fixed default) in a context variable

use async_trait::async_trait;
use serde::Deserialize;

use crate::context::Variable;
use crate::error::{FlowError, Result};
use crate::flow::types::NodeId;
use crate::message::Message;
use crate::node::{BaseNode, Node};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetVariableConfig {
    pub name: String,
    #[serde(default)]
    pub is_global: bool,
    /// Keep the value in memory only
    #[serde(default)]
    pub in_memory: bool,
    /// Written instead of the message value when set
    #[serde(default)]
    pub default_value: Option<Variable>,
}

pub struct SetVariableNode {
    base: BaseNode,
    config: SetVariableConfig,
}

impl SetVariableNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config: SetVariableConfig = base.load_config()?;
        if config.name.is_empty() {
            return Err(FlowError::config(base.id(), "variable name can't be empty"));
        }
        Ok(Self { base, config })
    }
}

#[async_trait]
impl Node for SetVariableNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let variable = match &self.config.default_value {
            Some(default) => default.clone(),
            None => msg.payload.variable(),
        };
        self.base
            .save_variable(&self.config.name, self.config.is_global, self.config.in_memory, variable)
            .await?;
        Ok(self.base.success_next())
    }
}
