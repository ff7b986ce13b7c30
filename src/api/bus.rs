/// Bus control API
///
/// Commands arrive on `pt:j1/mt:cmd/rt:app/rn:flowway/ad:<instance>` and every
/// reply goes to the `evt` twin of that topic with `corid` set to the request uid.
/// Failures are answered with `evt.flow.error_report`.
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::api::{import_from_url, ImportFromUrlRequest};
use crate::connector::MessageBus;
use crate::error::{FlowError, Result};
use crate::flow::{FlowControlOp, FlowMeta, Manager};
use crate::message::{Address, Message, Payload};

pub const APP_NAME: &str = "flowway";
pub const ERROR_REPORT: &str = "evt.flow.error_report";
const OWNER: &str = "api/bus";

pub fn command_topic(instance: &str) -> String {
    Address::new("cmd", "app", APP_NAME, instance).to_topic()
}

pub fn event_topic(instance: &str) -> String {
    Address::new("evt", "app", APP_NAME, instance).to_topic()
}

/// Running command handler; dropping it doesn't stop it, call [`BusApi::stop`]
pub struct BusApi {
    bus: Arc<MessageBus>,
    task: JoinHandle<()>,
}

impl BusApi {
    /// Subscribe to the command topic and serve requests until stopped
    pub fn start(manager: Arc<Manager>, bus: Arc<MessageBus>, instance: &str) -> Self {
        let mut rx = bus.subscribe(OWNER, &command_topic(instance));
        let reply_topic = event_topic(instance);
        let publisher = bus.clone();
        tracing::info!("Bus API listening on {}", command_topic(instance));

        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let manager = manager.clone();
                let bus = publisher.clone();
                let reply_topic = reply_topic.clone();
                // long control operations must not hold up the queue
                tokio::spawn(async move {
                    let reply = handle(&manager, &msg).await;
                    bus.publish(&reply_topic, reply);
                });
            }
        });
        Self { bus, task }
    }

    pub async fn stop(self) {
        self.bus.unsubscribe_owner(OWNER);
        self.task.abort();
        let _ = self.task.await;
    }
}

/// Execute one command and build its reply
pub async fn handle(manager: &Manager, msg: &Message) -> Payload {
    let request = &msg.payload;
    tracing::debug!("Bus API command {}", request.msg_type);
    match dispatch(manager, request).await {
        Ok((msg_type, value)) => {
            let value_type = if value.is_null() { "null" } else { "object" };
            Payload::reply_to(request, msg_type, value_type, value)
        }
        Err(e) => {
            tracing::info!("Bus API command {} failed: {}", request.msg_type, e);
            Payload::reply_to(
                request,
                ERROR_REPORT,
                "object",
                json!({ "request": request.msg_type, "error": e.to_string() }),
            )
        }
    }
}

async fn dispatch(manager: &Manager, request: &Payload) -> Result<(&'static str, Value)> {
    match request.msg_type.as_str() {
        "cmd.flow.get_list" => Ok(("evt.flow.list_report", json!(manager.get_flow_list()))),
        "cmd.flow.get_definition" => {
            let id = string_value(request)?;
            let meta = manager
                .get_flow_definition(id)
                .ok_or_else(|| FlowError::NotFound(format!("flow '{}'", id)))?;
            Ok(("evt.flow.definition_report", json!(meta)))
        }
        "cmd.flow.import" => {
            let raw = serde_json::to_vec(&request.value)?;
            let id = manager.import_flow(&raw).await?;
            Ok(("evt.flow.import_report", json!({ "id": id })))
        }
        "cmd.flow.import_from_url" => {
            let source: ImportFromUrlRequest = serde_json::from_value(request.value.clone())?;
            let id = import_from_url(manager, &source).await?;
            Ok(("evt.flow.import_report", json!({ "id": id })))
        }
        "cmd.flow.update_definition" => {
            let meta: FlowMeta = serde_json::from_value(request.value.clone())?;
            let raw = serde_json::to_vec(&request.value)?;
            manager.update_flow_from_json_and_save_to_storage(&meta.id, &raw).await?;
            Ok(("evt.flow.update_report", json!({ "id": meta.id })))
        }
        "cmd.flow.ctrl" => {
            let op: FlowControlOp = required_prop(request, "op")?.parse()?;
            let id = required_prop(request, "id")?;
            manager.control_flow(op, id).await?;
            let state = manager.get_flow_by_id(id).map(|f| f.state());
            Ok(("evt.flow.ctrl_report", json!({ "id": id, "op": op, "state": state })))
        }
        "cmd.flow.delete" => {
            let id = string_value(request)?;
            manager.delete_flow_from_storage(id).await?;
            Ok(("evt.flow.delete_report", json!({ "id": id })))
        }
        "cmd.flow.get_connector_instances" => Ok((
            "evt.flow.connector_instances_report",
            json!(manager.adapters().list()),
        )),
        other => Err(FlowError::InvalidOperation(format!("unknown command '{}'", other))),
    }
}

fn string_value(request: &Payload) -> Result<&str> {
    request
        .string_value()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FlowError::Decode(format!("{} expects a string value", request.msg_type)))
}

fn required_prop<'a>(request: &'a Payload, key: &str) -> Result<&'a str> {
    request
        .props
        .get(key)
        .map(String::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| FlowError::Decode(format!("{} requires the '{}' property", request.msg_type, key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Adapters;
    use crate::context::ContextStore;
    use crate::flow::FlowStorage;
    use crate::node::NodeRegistry;

    fn manager(dir: &std::path::Path) -> Manager {
        Manager::new(
            FlowStorage::new(dir),
            Arc::new(ContextStore::in_memory()),
            Arc::new(Adapters::new()),
            Arc::new(NodeRegistry::with_builtin()),
            Default::default(),
        )
    }

    fn command(msg_type: &str, value: Value) -> Message {
        Message::new(command_topic("1"), Payload::new(msg_type, APP_NAME, "object", value))
    }

    #[tokio::test]
    async fn import_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let reply = handle(&manager, &command("cmd.flow.import", json!({ "id": "f1", "name": "Lights" }))).await;
        assert_eq!(reply.msg_type, "evt.flow.import_report");
        assert_eq!(reply.value["id"], "f1");

        let request = command("cmd.flow.get_list", Value::Null);
        let reply = handle(&manager, &request).await;
        assert_eq!(reply.corid, request.payload.uid);
        assert_eq!(reply.value[0]["name"], "Lights");
    }

    #[tokio::test]
    async fn ctrl_requires_props_and_known_flow() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let reply = handle(&manager, &command("cmd.flow.ctrl", Value::Null)).await;
        assert_eq!(reply.msg_type, ERROR_REPORT);

        let mut request = command("cmd.flow.ctrl", Value::Null);
        request.payload.props.insert("op".into(), "start".into());
        request.payload.props.insert("id".into(), "ghost".into());
        let reply = handle(&manager, &request).await;
        assert_eq!(reply.msg_type, ERROR_REPORT);
        assert!(reply.value["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn import_from_url_fetches_the_definition() {
        use axum::{routing::get, Json, Router};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route(
            "/lights.json",
            get(|| async { Json(json!({ "id": "fetched", "name": "Lights" })) }),
        );
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());
        let url = format!("http://{}/lights.json", addr);
        let reply = handle(&manager, &command("cmd.flow.import_from_url", json!({ "url": url }))).await;
        assert_eq!(reply.msg_type, "evt.flow.import_report");
        assert_eq!(reply.value["id"], "fetched");
        assert_eq!(manager.get_flow_definition("fetched").unwrap().name, "Lights");

        let missing = format!("http://{}/nope.json", addr);
        let reply = handle(&manager, &command("cmd.flow.import_from_url", json!({ "url": missing }))).await;
        assert_eq!(reply.msg_type, ERROR_REPORT);

        let reply = handle(&manager, &command("cmd.flow.import_from_url", json!("not an object"))).await;
        assert_eq!(reply.msg_type, ERROR_REPORT);
    }

    #[tokio::test]
    async fn unknown_command_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let reply = handle(&manager(dir.path()), &command("cmd.flow.teleport", Value::Null)).await;
        assert_eq!(reply.msg_type, ERROR_REPORT);
    }
}
