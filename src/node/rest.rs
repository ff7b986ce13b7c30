//! Outbound REST call

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};

use crate::context::Variable;
use crate::error::{FlowError, Result};
use crate::flow::types::NodeId;
use crate::message::Message;
use crate::node::{BaseNode, Node};

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestActionConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Fixed request body; when absent, POST/PUT/PATCH send the message value
    #[serde(default)]
    pub body: Option<Value>,
    /// 0 = engine default
    #[serde(default)]
    pub timeout_secs: u64,
    /// JSONPath applied to the response, e.g. `$.data.temperature`
    #[serde(default)]
    pub response_path: String,
    #[serde(default)]
    pub save_to_variable: String,
    #[serde(default)]
    pub is_variable_global: bool,
    /// Replace the message value with the (extracted) response
    #[serde(default = "default_true")]
    pub update_message: bool,
}

pub struct RestActionNode {
    base: BaseNode,
    config: RestActionConfig,
    method: Method,
    client: reqwest::Client,
}

impl RestActionNode {
    pub fn new(base: BaseNode) -> Result<Self> {
        let config: RestActionConfig = base.load_config()?;
        if config.url.is_empty() {
            return Err(FlowError::config(base.id(), "url is required"));
        }
        let method = match config.method.to_uppercase().as_str() {
            "GET" => Method::GET,
            "POST" => Method::POST,
            "PUT" => Method::PUT,
            "DELETE" => Method::DELETE,
            "PATCH" => Method::PATCH,
            other => {
                return Err(FlowError::config(base.id(), format!("unsupported HTTP method: {}", other)));
            }
        };

        let timeout_secs = match config.timeout_secs {
            0 => base.flow_context().engine.default_request_timeout_secs,
            secs => secs,
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|e| FlowError::config(base.id(), e))?;

        Ok(Self {
            base,
            config,
            method,
            client,
        })
    }

    fn extract(&self, response: Value) -> Result<Value> {
        if self.config.response_path.is_empty() {
            return Ok(response);
        }
        let found = jsonpath_lib::select(&response, &self.config.response_path)
            .map_err(|e| self.base.error(format!("bad path '{}': {:?}", self.config.response_path, e)))?;
        Ok(found.first().map(|v| (*v).clone()).unwrap_or(Value::Null))
    }
}

#[async_trait]
impl Node for RestActionNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn on_input(&self, msg: &mut Message) -> Result<Vec<NodeId>> {
        let url = &self.config.url;
        tracing::debug!("HTTP request: {} {}", self.method, url);

        let mut request = self.client.request(self.method.clone(), url);
        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        let sends_body = matches!(self.method, Method::POST | Method::PUT | Method::PATCH);
        let body = self
            .config
            .body
            .clone()
            .or_else(|| sends_body.then(|| msg.payload.value.clone()));
        request = match body {
            Some(Value::String(text)) => request.header("Content-Type", "text/plain").body(text),
            Some(Value::Null) | None => request,
            Some(data) => request.json(&data),
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FlowError::Timeout(format!("{} {}", self.method, url))
            } else {
                self.base.error(format!("request failed: {}", e))
            }
        })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.base.error(format!("failed to read response body: {}", e)))?;
        if !status.is_success() {
            return Err(self.base.error(format!("{} {} answered {}", self.method, url, status)));
        }
        tracing::debug!("HTTP request completed: {} {} (status: {})", self.method, url, status);

        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let result = Variable::infer(self.extract(data)?);

        if !self.config.save_to_variable.is_empty() {
            self.base
                .save_variable(&self.config.save_to_variable, self.config.is_variable_global, false, result.clone())
                .await?;
        }
        if self.config.update_message {
            msg.payload.set_variable(result);
        }
        Ok(self.base.success_next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Scope;
    use crate::message::Payload;
    use crate::node::testing::{flow_context, meta};
    use axum::{http::StatusCode, routing::get, Json, Router};
    use serde_json::json;

    async fn serve() -> String {
        let app = Router::new()
            .route("/weather", get(|| async { Json(json!({ "data": { "temperature": 18.5 } })) }))
            .route("/broken", get(|| async { StatusCode::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}", addr)
    }

    fn msg() -> Message {
        Message::new("x", Payload::new("evt.x", "", "null", Value::Null))
    }

    #[tokio::test]
    async fn extracts_and_saves_response() {
        let base_url = serve().await;
        let (ctx, _) = flow_context().await;
        let node = RestActionNode::new(BaseNode::new(
            meta(
                "r1",
                "rest_action",
                json!({
                    "url": format!("{}/weather", base_url),
                    "response_path": "$.data.temperature",
                    "save_to_variable": "outside"
                }),
            ),
            ctx.clone(),
            false,
        ))
        .unwrap();

        let mut m = msg();
        assert_eq!(node.on_input(&mut m).await.unwrap(), vec!["next"]);
        assert_eq!(m.payload.value, json!(18.5));
        assert_eq!(m.payload.value_type, "float");
        assert_eq!(ctx.context.get_variable("outside", &Scope::flow("f1")).unwrap().value, json!(18.5));
    }

    #[tokio::test]
    async fn error_status_is_a_node_error() {
        let base_url = serve().await;
        let (ctx, _) = flow_context().await;
        let node = RestActionNode::new(BaseNode::new(
            meta("r1", "rest_action", json!({ "url": format!("{}/broken", base_url) })),
            ctx,
            false,
        ))
        .unwrap();
        assert!(matches!(
            node.on_input(&mut msg()).await.unwrap_err(),
            FlowError::NodeExecution { .. }
        ));
    }

    #[tokio::test]
    async fn unknown_method_is_a_config_error() {
        let (ctx, _) = flow_context().await;
        let built = RestActionNode::new(BaseNode::new(
            meta("r1", "rest_action", json!({ "url": "http://localhost", "method": "BREW" })),
            ctx,
            false,
        ));
        assert!(matches!(built, Err(FlowError::ConfigDecode { .. })));
    }
}
