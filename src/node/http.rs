//! HTTP/WebSocket trigger and reply nodes, backed by the `http` connector

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};

use crate::connector::http::{AuthConfig, FlowStream, HttpConnector};
use crate::error::Result;
use crate::flow::types::NodeId;
use crate::message::{Message, Pipeline};
use crate::node::{BaseNode, Node, DEFAULT_HTTP};

fn default_connector() -> String {
    DEFAULT_HTTP.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpTriggerConfig {
    #[serde(default = "default_connector")]
    pub connector: String,
    /// Callers wait for an `http_reply`; otherwise they get 202 right away
    #[serde(default = "default_true")]
    pub is_sync: bool,
    #[serde(default)]
    pub is_ws: bool,
    #[serde(default)]
    pub publish_only: bool,
    #[serde(default)]
    pub alias: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

pub struct HttpTriggerNode {
    base: BaseNode,
    config: HttpTriggerConfig,
    http: OnceLock<Arc<HttpConnector>>,
}

impl HttpTriggerNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config = base.load_config()?;
        Ok(Self {
            base,
            config,
            http: OnceLock::new(),
        })
    }
}

#[async_trait]
impl Node for HttpTriggerNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self) -> Result<()> {
        let http = self.base.adapters().connection::<HttpConnector>(&self.config.connector)?;
        let _ = self.http.set(http);
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        tracing::debug!("HTTP input, request id {:?}", msg.request_id);
        Ok(self.base.success_next())
    }

    async fn configure_in_stream(&self, active_subscriptions: &mut Vec<String>, pipeline: &Pipeline) -> Result<()> {
        let http = self.http.get().ok_or_else(|| self.base.error("not initialised"))?;
        let flow_id = self.base.flow_id();
        let stream = FlowStream {
            node_id: self.base.id().to_string(),
            pipeline: pipeline.clone(),
            is_sync: self.config.is_sync,
            is_ws: self.config.is_ws,
            publish_only: self.config.publish_only,
            alias: self.config.alias.clone(),
            name: self.base.meta.label.clone(),
            auth: self.config.auth.clone(),
        };
        http.register_flow(flow_id, stream).await?;

        active_subscriptions.push(format!("/flow/{}/rest", flow_id));
        if self.config.is_ws {
            active_subscriptions.push(format!("/flow/{}/ws", flow_id));
        }
        Ok(())
    }

    async fn release_in_stream(&self) {
        if let Some(http) = self.http.get() {
            http.unregister_flow(self.base.flow_id()).await;
        }
    }
}

fn default_content_type() -> String {
    "application/json".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpReplyConfig {
    #[serde(default = "default_connector")]
    pub connector: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Reply with this variable instead of the message value
    #[serde(default)]
    pub variable_name: String,
    #[serde(default)]
    pub is_variable_global: bool,
}

pub struct HttpReplyNode {
    base: BaseNode,
    config: HttpReplyConfig,
    http: OnceLock<Arc<HttpConnector>>,
}

impl HttpReplyNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config = base.load_config()?;
        Ok(Self {
            base,
            config,
            http: OnceLock::new(),
        })
    }

    fn body(&self, msg: &Message) -> Result<Vec<u8>> {
        let value = if self.config.variable_name.is_empty() {
            msg.payload.value.clone()
        } else {
            let scope = self.base.scope(self.config.is_variable_global);
            self.base.context().get_variable(&self.config.variable_name, &scope)?.value
        };

        Ok(match value {
            Value::String(text) if !self.config.content_type.contains("json") => text.into_bytes(),
            other => serde_json::to_vec(&other)?,
        })
    }
}

#[async_trait]
impl Node for HttpReplyNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self) -> Result<()> {
        let http = self.base.adapters().connection::<HttpConnector>(&self.config.connector)?;
        let _ = self.http.set(http);
        Ok(())
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let http = self.http.get().ok_or_else(|| self.base.error("not initialised"))?;
        let body = self.body(msg)?;

        match msg.request_id {
            Some(request_id) => {
                if !http.reply_to_request(request_id, body, &self.config.content_type) {
                    return Err(self.base.error(format!("request {} is no longer waiting", request_id)));
                }
            }
            None => {
                let sent = http.publish_ws(self.base.flow_id(), body);
                tracing::debug!("Pushed reply to {} WebSocket clients", sent);
            }
        }
        Ok(self.base.success_next())
    }
}
