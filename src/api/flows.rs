/// Flow management REST API endpoints
///
/// Every change goes through the manager, so definitions are validated,
/// persisted and hot-swapped exactly as on the bus API.
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::api::{api_error, import_from_url, ApiError, ImportFromUrlRequest};
use crate::context::Scope;
use crate::error::FlowError;
use crate::flow::{FlowControlOp, Manager};

/// Application state shared by the handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
}

/// Create flow management routes
pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", get(list_flows))
        .route("/api/flows/import", put(import_flow))
        .route("/api/flows/import_from_url", put(import_flow_from_url))
        .route("/api/flows/{id}", get(get_flow).post(update_flow).delete(delete_flow))
        .route("/api/flows/{id}/ctrl/{op}", post(control_flow))
        .route("/api/context/{scope}", get(get_context))
        .route("/api/connectors", get(list_connectors))
}

/// GET /api/flows
async fn list_flows(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "flows": state.manager.get_flow_list() }))
}

/// GET /api/flows/{id}
///
/// `-` returns a fresh skeleton with a new id; nothing is stored until it is posted back.
async fn get_flow(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    if id == "-" {
        return Ok(Json(json!(state.manager.generate_new_flow())));
    }
    let flow = state
        .manager
        .get_flow_by_id(&id)
        .ok_or_else(|| api_error(FlowError::NotFound(format!("flow '{}'", id))))?;

    Ok(Json(json!({
        "definition": flow.definition(),
        "state": flow.state(),
        "last_error": flow.last_error(),
        "subscriptions": flow.active_subscriptions().await,
    })))
}

/// POST /api/flows/{id}
/// Body: full flow definition
async fn update_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    state
        .manager
        .update_flow_from_json_and_save_to_storage(&id, &body)
        .await
        .map_err(api_error)?;
    tracing::info!("Flow {} updated over REST", id);
    Ok(Json(json!({ "id": id, "state": state.manager.get_flow_by_id(&id).map(|f| f.state()) })))
}

/// PUT /api/flows/import
async fn import_flow(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let id = state.manager.import_flow(&body).await.map_err(api_error)?;
    Ok(Json(json!({ "id": id })))
}

/// PUT /api/flows/import_from_url
/// Body: { "url": "...", "headers": { ... } }
async fn import_flow_from_url(
    State(state): State<AppState>,
    Json(request): Json<ImportFromUrlRequest>,
) -> Result<Json<Value>, ApiError> {
    let id = import_from_url(&state.manager, &request).await.map_err(api_error)?;
    Ok(Json(json!({ "id": id })))
}

/// POST /api/flows/{id}/ctrl/{op}
async fn control_flow(
    State(state): State<AppState>,
    Path((id, op)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let op: FlowControlOp = op.parse().map_err(api_error)?;
    state.manager.control_flow(op, &id).await.map_err(api_error)?;
    let flow_state = state.manager.get_flow_by_id(&id).map(|f| f.state());
    Ok(Json(json!({ "id": id, "op": op, "state": flow_state })))
}

/// DELETE /api/flows/{id}
async fn delete_flow(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, ApiError> {
    state.manager.delete_flow_from_storage(&id).await.map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/context/{scope}
///
/// `global` or a flow id
async fn get_context(State(state): State<AppState>, Path(scope): Path<String>) -> Json<Value> {
    let scope = Scope::from(scope.as_str());
    Json(json!({ "scope": scope.as_str(), "records": state.manager.context().get_records(&scope) }))
}

/// GET /api/connectors
async fn list_connectors(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "connectors": state.manager.adapters().list() }))
}
