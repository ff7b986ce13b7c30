/// Control surfaces
///
/// The same manager operations are exposed twice:
/// - REST endpoints under /api (axum)
/// - command/event messages on the bus, with `RemoteClient` as the typed caller

// REST endpoints for flow, context and connector management
pub mod flows;

// Bus command handler
pub mod bus;

// Typed client for the bus API
pub mod client;

use axum::{http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{collections::BTreeMap, time::Duration};

use crate::error::{FlowError, Result};
use crate::flow::Manager;

pub use bus::{command_topic, event_topic, BusApi};
pub use client::RemoteClient;
pub use flows::{create_flow_routes, AppState};

/// HTTP status matching an engine error
pub fn status_for(err: &FlowError) -> StatusCode {
    match err {
        FlowError::Decode(_)
        | FlowError::Validation(_)
        | FlowError::ConfigDecode { .. }
        | FlowError::InvalidOperation(_) => StatusCode::BAD_REQUEST,
        FlowError::NotFound(_) => StatusCode::NOT_FOUND,
        FlowError::InvalidStateTransition { .. } => StatusCode::CONFLICT,
        FlowError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        FlowError::ConnectorInit { .. } => StatusCode::SERVICE_UNAVAILABLE,
        FlowError::NodeExecution { .. } | FlowError::Io(_) | FlowError::Storage(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Error body returned by every failing endpoint
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(err: FlowError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!("API request failed: {}", err);
    } else {
        tracing::debug!("API request rejected: {}", err);
    }
    (status, Json(json!({ "error": err.to_string() })))
}

/// Where to fetch a definition from, for `import_from_url` on either surface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportFromUrlRequest {
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

const IMPORT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Download a definition and import it; returns the flow id
pub async fn import_from_url(manager: &Manager, request: &ImportFromUrlRequest) -> Result<String> {
    if request.url.is_empty() {
        return Err(FlowError::Decode("import_from_url needs a url".into()));
    }
    let client = reqwest::Client::builder()
        .timeout(IMPORT_FETCH_TIMEOUT)
        .build()
        .map_err(|e| FlowError::InvalidOperation(e.to_string()))?;
    let mut builder = client.get(&request.url);
    for (key, value) in &request.headers {
        builder = builder.header(key, value);
    }

    let response = builder
        .send()
        .await
        .map_err(|e| FlowError::InvalidOperation(format!("can't fetch {}: {}", request.url, e)))?;
    if !response.status().is_success() {
        return Err(FlowError::InvalidOperation(format!(
            "{} answered {}",
            request.url,
            response.status()
        )));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| FlowError::InvalidOperation(e.to_string()))?;

    let id = manager.import_flow(&body).await?;
    tracing::info!("Flow {} imported from {}", id, request.url);
    Ok(id)
}
