/// Server setup and initialization
///
/// Wires together all components: context store, connectors, flow manager,
/// the bus control API and the REST router.
use crate::{
    api::{create_flow_routes, AppState, BusApi},
    config::Config,
    connector::{Adapters, MessageBus},
    context::ContextStore,
    flow::{FlowStorage, Manager},
    logging,
    node::{NodeRegistry, DEFAULT_BUS},
};
use anyhow::Result;
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;

/// Fully initialised engine, ready to be served
pub struct App {
    pub router: Router,
    pub manager: Arc<Manager>,
    bus_api: Option<BusApi>,
}

impl App {
    /// Stop the bus API, every flow and every connector
    pub async fn shutdown(self) {
        if let Some(api) = self.bus_api {
            api.stop().await;
        }
        self.manager.shutdown().await;
    }
}

/// Build the engine from configuration
///
/// Opens the context store, registers connectors, loads every stored flow and
/// attaches the control surfaces.
pub async fn create_app(config: &Config) -> Result<App> {
    tracing::info!("Opening context store at {}", config.storage.context_db_path);
    let context = Arc::new(
        ContextStore::open(&config.storage.context_db_path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open context store: {}", e))?,
    );

    tracing::info!("Registering {} connectors", config.connectors.len());
    let adapters = Arc::new(
        Adapters::from_config(&config.connectors, &config.engine)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create connectors: {}", e))?,
    );

    let manager = Arc::new(Manager::new(
        FlowStorage::new(&config.storage.flow_storage_dir),
        context,
        adapters.clone(),
        Arc::new(NodeRegistry::with_builtin()),
        config.engine,
    ));

    tracing::info!("Loading flows from {}", config.storage.flow_storage_dir);
    manager
        .load_all_flows_from_storage()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load flows: {}", e))?;

    let bus_api = match adapters.connection::<MessageBus>(DEFAULT_BUS) {
        Ok(bus) => Some(BusApi::start(manager.clone(), bus, &config.instance_address)),
        Err(e) => {
            tracing::warn!("Bus control API disabled: {}", e);
            None
        }
    };

    let router = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_flow_routes().with_state(AppState {
            manager: manager.clone(),
        }));

    tracing::info!("Application initialized");
    Ok(App {
        router,
        manager,
        bus_api,
    })
}

/// Start the engine and serve the REST API until Ctrl-C
pub async fn start_server(config: Config) -> Result<()> {
    logging::init(&config.logging);
    tracing::info!("Starting flowway...");

    let app = create_app(&config).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Control API listening on http://{}", bind_addr);

    axum::serve(listener, app.router.clone().into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down");
    app.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::FlowMeta;

    #[tokio::test]
    async fn app_loads_stored_flows() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage.flow_storage_dir = dir.path().join("flows").display().to_string();
        config.storage.context_db_path = dir.path().join("context.db").display().to_string();
        config.connectors.retain(|c| c.plugin == "bus");

        FlowStorage::new(&config.storage.flow_storage_dir)
            .save(&FlowMeta::skeleton("stored"))
            .await
            .unwrap();

        let app = create_app(&config).await.unwrap();
        assert_eq!(app.manager.get_flow_list().len(), 1);
        app.shutdown().await;
    }
}
