/// Typed client for the bus control API
///
/// Each call is a bus request/reply round trip bounded by the client timeout.
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use crate::api::bus::{command_topic, event_topic, APP_NAME, ERROR_REPORT};
use crate::api::ImportFromUrlRequest;
use crate::connector::{ConnectorView, MessageBus};
use crate::error::{FlowError, Result};
use crate::flow::{FlowControlOp, FlowListItem, FlowMeta, FlowState};
use crate::message::Payload;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, serde::Deserialize)]
struct CtrlReport {
    state: Option<FlowState>,
}

#[derive(Debug, serde::Deserialize)]
struct IdReport {
    id: String,
}

pub struct RemoteClient {
    bus: Arc<MessageBus>,
    instance: String,
    timeout: Duration,
}

impl RemoteClient {
    pub fn new(bus: Arc<MessageBus>, instance: impl Into<String>) -> Self {
        Self {
            bus,
            instance: instance.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn call<T: DeserializeOwned>(&self, payload: Payload) -> Result<T> {
        let reply = self
            .bus
            .request(
                &command_topic(&self.instance),
                payload,
                &event_topic(&self.instance),
                self.timeout,
            )
            .await?;

        if reply.payload.msg_type == ERROR_REPORT {
            let reason = reply.payload.value["error"].as_str().unwrap_or("unknown error");
            return Err(FlowError::InvalidOperation(format!("remote: {}", reason)));
        }
        Ok(serde_json::from_value(reply.payload.value)?)
    }

    fn command(msg_type: &str, value_type: &str, value: Value) -> Payload {
        Payload::new(msg_type, APP_NAME, value_type, value)
    }

    pub async fn get_flow_list(&self) -> Result<Vec<FlowListItem>> {
        self.call(Self::command("cmd.flow.get_list", "null", Value::Null)).await
    }

    pub async fn get_flow_definition(&self, id: &str) -> Result<FlowMeta> {
        self.call(Self::command("cmd.flow.get_definition", "string", json!(id)))
            .await
    }

    /// Returns the id the flow was registered under
    pub async fn import_flow(&self, meta: &FlowMeta) -> Result<String> {
        let report: IdReport = self
            .call(Self::command("cmd.flow.import", "object", json!(meta)))
            .await?;
        Ok(report.id)
    }

    /// Have the remote instance download and import a definition
    pub async fn import_flow_from_url(&self, source: &ImportFromUrlRequest) -> Result<String> {
        let report: IdReport = self
            .call(Self::command("cmd.flow.import_from_url", "object", json!(source)))
            .await?;
        Ok(report.id)
    }

    pub async fn update_flow_definition(&self, meta: &FlowMeta) -> Result<()> {
        let _: IdReport = self
            .call(Self::command("cmd.flow.update_definition", "object", json!(meta)))
            .await?;
        Ok(())
    }

    /// Returns the flow state after the operation
    pub async fn control_flow(&self, op: FlowControlOp, id: &str) -> Result<Option<FlowState>> {
        let mut payload = Self::command("cmd.flow.ctrl", "null", Value::Null);
        payload.props = BTreeMap::from([
            ("op".to_string(), op.as_str().to_string()),
            ("id".to_string(), id.to_string()),
        ]);
        let report: CtrlReport = self.call(payload).await?;
        Ok(report.state)
    }

    pub async fn delete_flow(&self, id: &str) -> Result<()> {
        let _: IdReport = self
            .call(Self::command("cmd.flow.delete", "string", json!(id)))
            .await?;
        Ok(())
    }

    pub async fn get_connector_instances(&self) -> Result<Vec<ConnectorView>> {
        self.call(Self::command("cmd.flow.get_connector_instances", "null", Value::Null))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::BusApi;
    use crate::connector::Adapters;
    use crate::context::ContextStore;
    use crate::flow::{FlowStorage, Manager};
    use crate::node::{NodeRegistry, DEFAULT_BUS};

    #[tokio::test]
    async fn round_trip_through_bus_api() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::default());
        let adapters = Arc::new(Adapters::new());
        adapters
            .register_instance(DEFAULT_BUS, "bus", Value::Null, bus.clone())
            .await
            .unwrap();
        let manager = Arc::new(Manager::new(
            FlowStorage::new(dir.path()),
            Arc::new(ContextStore::in_memory()),
            adapters,
            Arc::new(NodeRegistry::with_builtin()),
            Default::default(),
        ));
        let api = BusApi::start(manager, bus.clone(), "1");
        let client = RemoteClient::new(bus, "1");

        let id = client.import_flow(&FlowMeta::skeleton("remote")).await.unwrap();
        assert_eq!(id, "remote");
        assert_eq!(client.get_flow_list().await.unwrap().len(), 1);
        assert_eq!(
            client.control_flow(FlowControlOp::Stop, "remote").await.unwrap(),
            Some(FlowState::Stopped)
        );
        assert!(client.get_flow_definition("remote").await.unwrap().is_disabled);
        assert_eq!(client.get_connector_instances().await.unwrap()[0].name, DEFAULT_BUS);

        client.delete_flow("remote").await.unwrap();
        assert!(client.get_flow_definition("remote").await.is_err());
        api.stop().await;
    }

    #[tokio::test]
    async fn no_listener_times_out() {
        let client = RemoteClient::new(Arc::new(MessageBus::default()), "9").with_timeout(Duration::from_millis(50));
        assert!(matches!(client.get_flow_list().await, Err(FlowError::Timeout(_))));
    }
}
