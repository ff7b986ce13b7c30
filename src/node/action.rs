//! Bus action: publishes a command or event to the node's address
//!
//! The address may hold `{{variable "name" is_global}}` placeholders, resolved
//! from the context store on every publish.

use async_trait::async_trait;
use handlebars::{
    Context as TemplateContext, Handlebars, Helper, HelperDef, HelperResult, Output, RenderContext,
    RenderErrorReason,
};
use serde::Deserialize;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};

use crate::connector::MessageBus;
use crate::context::{ContextStore, Scope, Variable};
use crate::error::{FlowError, Result};
use crate::flow::types::NodeId;
use crate::message::{Message, Payload};
use crate::node::{BaseNode, Node, DEFAULT_BUS};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActionConfig {
    #[serde(default = "default_connector")]
    pub connector: String,
    /// Publish this variable's value instead of the input
    #[serde(default)]
    pub variable_name: String,
    #[serde(default)]
    pub is_variable_global: bool,
    /// Used when set and no variable is configured
    #[serde(default)]
    pub default_value: Option<Variable>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    #[serde(default)]
    pub register_as_virtual_service: bool,
    /// Group the virtual service is announced under
    #[serde(default)]
    pub virtual_service_group: String,
    /// Announced features of the virtual service (supported modes, setpoints, ...)
    #[serde(default)]
    pub virtual_service_props: BTreeMap<String, Value>,
}

fn default_connector() -> String {
    DEFAULT_BUS.to_string()
}

const ADDRESS_TEMPLATE: &str = "address";

/// Registry with the address template and the `variable` helper, or `None` for a literal address
fn address_template(base: &BaseNode, context: Arc<ContextStore>) -> Result<Option<Handlebars<'static>>> {
    let address = &base.meta.address;
    if !address.contains("{{") {
        return Ok(None);
    }

    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    registry.register_escape_fn(handlebars::no_escape);

    let flow_id = base.flow_id().to_string();
    registry.register_helper(
        "variable",
        Box::new(
            move |h: &Helper<'_>,
                  _: &Handlebars<'_>,
                  _: &TemplateContext,
                  _: &mut RenderContext<'_, '_>,
                  out: &mut dyn Output|
                  -> HelperResult {
                let name = h
                    .param(0)
                    .and_then(|p| p.value().as_str())
                    .ok_or_else(|| RenderErrorReason::Other("variable needs a name".to_string()))?;
                let is_global = h.param(1).and_then(|p| p.value().as_bool()).unwrap_or(false);
                let variable = context
                    .get_variable(name, &Scope::select(is_global, &flow_id))
                    .map_err(|e| RenderErrorReason::Other(e.to_string()))?;
                match &variable.value {
                    Value::String(s) => out.write(s)?,
                    Value::Number(n) => out.write(&n.to_string())?,
                    _ => {
                        return Err(RenderErrorReason::Other(format!(
                            "variable '{}' is not a string or number",
                            name
                        ))
                        .into())
                    }
                }
                Ok(())
            },
        ) as Box<dyn HelperDef + Send + Sync>,
    );
    registry
        .register_template_string(ADDRESS_TEMPLATE, address)
        .map_err(|e| FlowError::config(base.id(), format!("bad address template: {}", e)))?;
    Ok(Some(registry))
}

pub struct ActionNode {
    base: BaseNode,
    config: ActionConfig,
    address: Option<Handlebars<'static>>,
    bus: OnceLock<Arc<MessageBus>>,
}

impl ActionNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config: ActionConfig = base.load_config()?;
        if base.meta.address.is_empty() {
            return Err(FlowError::config(base.id(), "address is required"));
        }
        let address = address_template(&base, base.flow_context().context.clone())?;
        Ok(Self {
            base,
            config,
            address,
            bus: OnceLock::new(),
        })
    }

    fn address(&self) -> Result<String> {
        match &self.address {
            Some(registry) => registry
                .render(ADDRESS_TEMPLATE, &())
                .map_err(|e| self.base.error(format!("can't resolve address: {}", e))),
            None => Ok(self.base.meta.address.clone()),
        }
    }

    /// Variable first, then the configured default, then the input message
    fn outgoing_value(&self, msg: &Message) -> Result<Variable> {
        if !self.config.variable_name.is_empty() {
            let scope = self.base.scope(self.config.is_variable_global);
            match self.base.context().get_variable(&self.config.variable_name, &scope) {
                Ok(variable) => return Ok(variable),
                Err(e) if e.is_not_found() && self.config.default_value.is_some() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(match &self.config.default_value {
            Some(default) => default.clone(),
            None => msg.payload.variable(),
        })
    }
}

#[async_trait]
impl Node for ActionNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self) -> Result<()> {
        let bus = self.base.adapters().connection::<MessageBus>(&self.config.connector)?;
        let _ = self.bus.set(bus);
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let bus = self.bus.get().ok_or_else(|| self.base.error("not initialised"))?;
        let meta = &self.base.meta;
        let variable = self.outgoing_value(msg)?;
        let address = self.address()?;

        let mut payload = Payload::from_variable(&meta.service_interface, &meta.service, &variable);
        payload.props = self.config.props.clone();
        let delivered = bus.publish(&address, payload);
        tracing::debug!("Published {} to {} ({} subscribers)", meta.service_interface, address, delivered);

        Ok(self.base.success_next())
    }
}
