//! Shared connector registry (Adapters)
//!
//! Connectors are process-wide I/O resources: the message bus, the HTTP bridge,
//! the cron scheduler. The registry owns every instance and its lifecycle; flows
//! and nodes only borrow typed handles through [`Adapters::connection`].

pub mod bus;
pub mod http;
pub mod scheduler;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    any::Any,
    sync::{Arc, PoisonError, RwLock},
};

use crate::config::{ConnectorSpec, EngineConfig};
use crate::error::{FlowError, Result};

pub use bus::MessageBus;
pub use http::HttpConnector;
pub use scheduler::CronScheduler;

/// Behaviour every connector plugin provides to the registry
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Plugin kind, e.g. "bus"
    fn plugin(&self) -> &'static str;

    /// Bring the connection up; failure marks the instance INIT_FAILED
    async fn init(&self) -> Result<()>;

    /// Release the underlying resource
    async fn stop(&self);

    /// Upcast used for typed lookups
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Lifecycle state of a connector instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorState {
    Init,
    Running,
    InitFailed,
    Stopped,
}

/// Named connector owned by the registry
pub struct ConnectorInstance {
    pub name: String,
    pub plugin: String,
    pub config: Value,
    state: RwLock<ConnectorState>,
    connection: Arc<dyn Connector>,
}

impl ConnectorInstance {
    pub fn state(&self) -> ConnectorState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectorState) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn connection(&self) -> Arc<dyn Connector> {
        self.connection.clone()
    }

    pub fn view(&self) -> ConnectorView {
        ConnectorView {
            name: self.name.clone(),
            plugin: self.plugin.clone(),
            state: self.state(),
            config: self.config.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectorInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorInstance")
            .field("name", &self.name)
            .field("plugin", &self.plugin)
            .field("state", &self.state())
            .finish()
    }
}

/// Serializable description of an instance, returned by the control surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorView {
    pub name: String,
    pub plugin: String,
    pub state: ConnectorState,
    pub config: Value,
}

/// Registry of live connector instances, keyed by name
#[derive(Debug, Default)]
pub struct Adapters {
    instances: DashMap<String, Arc<ConnectorInstance>>,
}

impl Adapters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from configuration, initialising every instance
    ///
    /// An instance whose `init` fails stays registered as INIT_FAILED so that
    /// flows depending on it fail their own start.
    pub async fn from_config(specs: &[ConnectorSpec], engine: &EngineConfig) -> Result<Self> {
        let adapters = Self::new();
        for spec in specs {
            let connection = create_connector(spec, engine)?;
            adapters
                .register_instance(&spec.name, &spec.plugin, spec.config.clone(), connection)
                .await?;
        }
        Ok(adapters)
    }

    /// Register and initialise a connector under `name`
    pub async fn register_instance(
        &self,
        name: &str,
        plugin: &str,
        config: Value,
        connection: Arc<dyn Connector>,
    ) -> Result<Arc<ConnectorInstance>> {
        if self.instances.contains_key(name) {
            return Err(FlowError::InvalidOperation(format!(
                "connector '{}' is already registered",
                name
            )));
        }

        let instance = Arc::new(ConnectorInstance {
            name: name.to_string(),
            plugin: plugin.to_string(),
            config,
            state: RwLock::new(ConnectorState::Init),
            connection,
        });
        self.instances.insert(name.to_string(), instance.clone());

        match instance.connection.init().await {
            Ok(()) => {
                instance.set_state(ConnectorState::Running);
                tracing::info!("Connector '{}' ({}) is running", name, plugin);
            }
            Err(e) => {
                instance.set_state(ConnectorState::InitFailed);
                tracing::error!("Connector '{}' ({}) failed to initialise: {}", name, plugin, e);
            }
        }
        Ok(instance)
    }

    pub fn get_instance(&self, name: &str) -> Option<Arc<ConnectorInstance>> {
        self.instances.get(name).map(|entry| entry.value().clone())
    }

    /// Stop and unregister an instance; absent names are ignored
    pub async fn remove_instance(&self, name: &str) {
        if let Some((_, instance)) = self.instances.remove(name) {
            instance.connection.stop().await;
            instance.set_state(ConnectorState::Stopped);
            tracing::info!("Connector '{}' removed", name);
        }
    }

    /// Instances ordered by name
    pub fn list(&self) -> Vec<ConnectorView> {
        let mut views: Vec<ConnectorView> = self.instances.iter().map(|entry| entry.view()).collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    /// Typed handle to a RUNNING connector
    pub fn connection<T: Connector>(&self, name: &str) -> Result<Arc<T>> {
        let instance = self
            .get_instance(name)
            .ok_or_else(|| FlowError::NotFound(format!("connector '{}'", name)))?;

        let state = instance.state();
        if state != ConnectorState::Running {
            return Err(FlowError::connector(name, format!("state is {:?}", state)));
        }

        instance
            .connection()
            .as_any()
            .downcast::<T>()
            .map_err(|_| FlowError::connector(name, format!("plugin '{}' has an unexpected type", instance.plugin)))
    }

    pub async fn stop_all(&self) {
        let instances: Vec<Arc<ConnectorInstance>> =
            self.instances.iter().map(|entry| entry.value().clone()).collect();
        for instance in instances {
            if instance.state() == ConnectorState::Running {
                instance.connection.stop().await;
            }
            instance.set_state(ConnectorState::Stopped);
        }
        tracing::info!("All connectors stopped");
    }
}

/// Plugin factory keyed by plugin name
fn create_connector(spec: &ConnectorSpec, engine: &EngineConfig) -> Result<Arc<dyn Connector>> {
    let decode = |e: serde_json::Error| FlowError::connector(&spec.name, format!("bad config: {}", e));
    let config = if spec.config.is_null() {
        Value::Object(Default::default())
    } else {
        spec.config.clone()
    };

    match spec.plugin.as_str() {
        "bus" => {
            let config: bus::BusConfig = serde_json::from_value(config).map_err(decode)?;
            Ok(Arc::new(MessageBus::new(config)))
        }
        "http" => {
            let mut config: http::HttpConfig = serde_json::from_value(config).map_err(decode)?;
            if config.request_timeout_secs == 0 {
                config.request_timeout_secs = engine.default_request_timeout_secs;
            }
            Ok(Arc::new(HttpConnector::new(config)))
        }
        "scheduler" => Ok(Arc::new(CronScheduler::new())),
        other => Err(FlowError::connector(&spec.name, format!("unknown plugin '{}'", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl Connector for Broken {
        fn plugin(&self) -> &'static str {
            "broken"
        }

        async fn init(&self) -> Result<()> {
            Err(FlowError::connector("broken", "no route to host"))
        }

        async fn stop(&self) {}

        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[tokio::test]
    async fn running_connector_is_reachable_by_type() {
        let adapters = Adapters::new();
        adapters
            .register_instance("msgbus", "bus", Value::Null, Arc::new(MessageBus::default()))
            .await
            .unwrap();

        assert!(adapters.connection::<MessageBus>("msgbus").is_ok());
        assert!(matches!(
            adapters.connection::<CronScheduler>("msgbus"),
            Err(FlowError::ConnectorInit { .. })
        ));
        assert!(adapters.connection::<MessageBus>("other").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn failed_init_marks_instance_and_blocks_lookups() {
        let adapters = Adapters::new();
        let instance = adapters
            .register_instance("db", "broken", Value::Null, Arc::new(Broken))
            .await
            .unwrap();

        assert_eq!(instance.state(), ConnectorState::InitFailed);
        assert!(matches!(
            adapters.connection::<Broken>("db"),
            Err(FlowError::ConnectorInit { .. })
        ));
    }

    #[tokio::test]
    async fn removed_instance_is_stopped_and_gone() {
        let adapters = Adapters::new();
        let instance = adapters
            .register_instance("msgbus", "bus", Value::Null, Arc::new(MessageBus::default()))
            .await
            .unwrap();
        adapters.remove_instance("msgbus").await;

        assert_eq!(instance.state(), ConnectorState::Stopped);
        assert!(adapters.get_instance("msgbus").is_none());
        assert!(adapters.list().is_empty());
    }

    #[tokio::test]
    async fn duplicate_names_are_rejected() {
        let adapters = Adapters::new();
        let bus = Arc::new(MessageBus::default());
        adapters.register_instance("msgbus", "bus", Value::Null, bus.clone()).await.unwrap();
        assert!(adapters.register_instance("msgbus", "bus", Value::Null, bus).await.is_err());
    }

    #[test]
    fn unknown_plugin_is_a_connector_error() {
        let spec = ConnectorSpec {
            name: "x".into(),
            plugin: "influx".into(),
            config: Value::Null,
        };
        assert!(matches!(
            create_connector(&spec, &EngineConfig::default()),
            Err(FlowError::ConnectorInit { .. })
        ));
    }
}
