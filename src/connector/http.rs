//! HTTP / WebSocket bridge connector
//!
//! Exposes `/flow/{id}/rest` and `/flow/{id}/ws` for flows that register an
//! HTTP trigger. Every inbound request gets a request id and is forwarded to
//! the flow's trigger node; the handler then waits for
//! [`HttpConnector::reply_to_request`] or gives up after the request timeout.
//! The server starts with the first registered flow and stops with the last.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Router,
};
use dashmap::DashMap;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    any::Any,
    collections::HashMap,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::connector::Connector;
use crate::context::Variable;
use crate::error::{FlowError, Result};
use crate::flow::types::NodeId;
use crate::message::{Address, Message, Payload, Pipeline, ReactorEvent};

pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8082";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind_address: String,
    /// 0 means "use the engine default"
    pub request_timeout_secs: u64,
    /// Applied to flows that don't configure their own auth
    pub global_auth: AuthConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            request_timeout_secs: 0,
            global_auth: AuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    #[default]
    None,
    Bearer,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub auth_type: AuthType,
    pub token: String,
}

impl AuthConfig {
    fn allows(&self, headers: &HeaderMap) -> bool {
        match self.auth_type {
            AuthType::None => true,
            AuthType::Bearer => headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .is_some_and(|token| token == self.token),
        }
    }
}

/// How a flow wants its HTTP traffic delivered
#[derive(Debug, Clone)]
pub struct FlowStream {
    /// Trigger node receiving the requests
    pub node_id: NodeId,
    pub pipeline: Pipeline,
    /// Caller waits for a reply from the flow
    pub is_sync: bool,
    pub is_ws: bool,
    /// Flow only pushes to WebSocket clients and never receives
    pub publish_only: bool,
    /// Usable in the URL instead of the flow id
    pub alias: String,
    pub name: String,
    pub auth: AuthConfig,
}

/// Reply handed back to a waiting HTTP handler
#[derive(Debug)]
struct HttpReply {
    body: Vec<u8>,
    content_type: String,
}

enum LiveKind {
    Http(oneshot::Sender<HttpReply>),
    Ws(mpsc::Sender<String>),
}

struct LiveConnection {
    flow_id: String,
    kind: LiveKind,
}

struct ServerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    local_addr: SocketAddr,
}

pub struct HttpConnector {
    config: HttpConfig,
    streams: RwLock<HashMap<String, FlowStream>>,
    live: DashMap<u32, LiveConnection>,
    next_request_id: AtomicU32,
    server: Mutex<Option<ServerHandle>>,
}

impl HttpConnector {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            config,
            streams: RwLock::new(HashMap::new()),
            live: DashMap::new(),
            next_request_id: AtomicU32::new(1),
            server: Mutex::new(None),
        }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    /// Request ids are never 0
    fn next_id(&self) -> u32 {
        loop {
            let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register a flow's stream, starting the server if this is the first one.
    /// A flow has one route, so a second trigger node of the same flow is rejected.
    pub async fn register_flow(self: &Arc<Self>, flow_id: &str, stream: FlowStream) -> Result<()> {
        {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = streams.get(flow_id) {
                if existing.node_id != stream.node_id {
                    return Err(FlowError::InvalidOperation(format!(
                        "flow '{}' already has HTTP trigger '{}'",
                        flow_id, existing.node_id
                    )));
                }
            }
            streams.insert(flow_id.to_string(), stream);
        }
        if let Err(e) = self.ensure_server().await {
            self.streams
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(flow_id);
            return Err(e);
        }
        tracing::debug!("HTTP stream registered for flow {}", flow_id);
        Ok(())
    }

    /// Drop a flow's stream and close its live connections
    pub async fn unregister_flow(&self, flow_id: &str) {
        // Dropping the senders wakes waiting handlers (503) and ends WS loops.
        self.live.retain(|_, conn| conn.flow_id != flow_id);

        let empty = {
            let mut streams = self.streams.write().unwrap_or_else(PoisonError::into_inner);
            streams.remove(flow_id);
            streams.is_empty()
        };
        tracing::debug!("HTTP stream unregistered for flow {}", flow_id);

        if empty {
            tracing::info!("No HTTP flows left, shutting down HTTP server");
            self.shutdown_server().await;
        }
    }

    /// Answer a pending request. Returns false if nobody is waiting for it.
    pub fn reply_to_request(&self, request_id: u32, payload: Vec<u8>, content_type: &str) -> bool {
        if request_id == 0 {
            return false;
        }
        let ws_sender = match self.live.get(&request_id) {
            None => return false,
            Some(entry) => match &entry.kind {
                LiveKind::Ws(tx) => Some(tx.clone()),
                LiveKind::Http(_) => None,
            },
        };

        if let Some(tx) = ws_sender {
            return tx.try_send(String::from_utf8_lossy(&payload).into_owned()).is_ok();
        }
        match self.live.remove(&request_id) {
            Some((_, LiveConnection { kind: LiveKind::Http(tx), .. })) => {
                tracing::debug!("Sending HTTP reply, payload size = {}", payload.len());
                tx.send(HttpReply {
                    body: payload,
                    content_type: content_type.to_string(),
                })
                .is_ok()
            }
            _ => false,
        }
    }

    /// Push a message to every WebSocket client of a flow
    pub fn publish_ws(&self, flow_id: &str, payload: Vec<u8>) -> usize {
        let text = String::from_utf8_lossy(&payload).into_owned();
        let senders: Vec<mpsc::Sender<String>> = self
            .live
            .iter()
            .filter(|entry| entry.flow_id == flow_id)
            .filter_map(|entry| match &entry.kind {
                LiveKind::Ws(tx) => Some(tx.clone()),
                LiveKind::Http(_) => None,
            })
            .collect();

        senders
            .into_iter()
            .filter(|tx| match tx.try_send(text.clone()) {
                Ok(()) => true,
                Err(e) => {
                    tracing::info!("Can't write to WS connection of flow {}: {}", flow_id, e);
                    false
                }
            })
            .count()
    }

    /// Address the server is bound to, when running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.local_addr)
    }

    pub fn live_connection_count(&self) -> usize {
        self.live.len()
    }

    fn lookup(&self, id: &str) -> Option<(String, FlowStream)> {
        let streams = self.streams.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(stream) = streams.get(id) {
            return Some((id.to_string(), stream.clone()));
        }
        streams
            .iter()
            .find(|(_, s)| !s.alias.is_empty() && s.alias == id)
            .map(|(flow_id, s)| (flow_id.clone(), s.clone()))
    }

    fn is_allowed(&self, stream: &FlowStream, headers: &HeaderMap) -> bool {
        if stream.auth.auth_type != AuthType::None {
            stream.auth.allows(headers)
        } else {
            self.config.global_auth.allows(headers)
        }
    }

    fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/flow/{id}/rest", any(rest_handler))
            .route("/flow/{id}/ws", get(ws_handler))
            .with_state(self.clone())
    }

    async fn ensure_server(self: &Arc<Self>) -> Result<()> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        tracing::info!("Starting HTTP server on {}", self.config.bind_address);
        let listener = TcpListener::bind(&self.config.bind_address)
            .await
            .map_err(|e| FlowError::connector("http", format!("can't bind {}: {}", self.config.bind_address, e)))?;
        let local_addr = listener.local_addr()?;

        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        let app = self.router();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!("HTTP server failed: {}", e);
            }
        });

        *server = Some(ServerHandle {
            cancel,
            task,
            local_addr,
        });
        Ok(())
    }

    async fn shutdown_server(&self) {
        let handle = self.server.lock().await.take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let abort = handle.task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(2), handle.task).await.is_err() {
                tracing::warn!("HTTP server didn't stop in time, aborting");
                abort.abort();
            }
        }
    }

    fn request_message(flow_id: &str, payload: Payload) -> Message {
        let topic = Address::new("evt", "app", "http", flow_id).to_topic();
        Message::new(topic, payload)
    }

    async fn serve_ws(self: Arc<Self>, flow_id: String, stream: FlowStream, socket: WebSocket) {
        let request_id = self.next_id();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
        self.live.insert(
            request_id,
            LiveConnection {
                flow_id: flow_id.clone(),
                kind: LiveKind::Ws(out_tx),
            },
        );
        tracing::debug!("WS connection {} opened for flow {}", request_id, flow_id);

        let (mut sink, mut incoming) = socket.split();
        loop {
            tokio::select! {
                outbound = out_rx.recv() => match outbound {
                    Some(text) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            tracing::debug!("WS write failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
                inbound = incoming.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if stream.publish_only {
                            continue;
                        }
                        let payload = Payload::from_variable("evt.ws.msg", "ws", &body_variable(text.as_str().as_bytes()));
                        let msg = Self::request_message(&flow_id, payload).with_request_id(request_id);
                        if stream.pipeline.send(ReactorEvent::input(stream.node_id.clone(), msg)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Binary(_))) => tracing::debug!("Ignoring binary WS message"),
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WS read error: {}", e);
                        break;
                    }
                },
            }
        }

        let _ = sink.close().await;
        self.live.remove(&request_id);
        tracing::debug!("WS connection {} closed", request_id);
    }
}

/// Decode a request body: JSON when it parses, text otherwise, null when empty
fn body_variable(body: &[u8]) -> Variable {
    if body.is_empty() {
        return Variable::new("null", Value::Null);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => Variable::infer(value),
        Err(_) => Variable::string(String::from_utf8_lossy(body)),
    }
}

async fn rest_handler(
    State(conn): State<Arc<HttpConnector>>,
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some((flow_id, stream)) = conn.lookup(&id) else {
        tracing::debug!("No HTTP stream for {}", id);
        return StatusCode::NOT_FOUND.into_response();
    };
    if !conn.is_allowed(&stream, &headers) {
        tracing::debug!("Request to flow {} is not allowed", flow_id);
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if stream.publish_only {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    if is_json && !body.is_empty() && serde_json::from_slice::<Value>(&body).is_err() {
        return (StatusCode::BAD_REQUEST, "malformed JSON body").into_response();
    }

    let mut payload = Payload::from_variable("evt.http.request", "http", &body_variable(&body));
    payload.props.insert("method".into(), method.to_string());
    for (key, value) in query {
        payload.props.insert(format!("q.{}", key), value);
    }
    let msg = HttpConnector::request_message(&flow_id, payload);

    if !stream.is_sync {
        return match stream.pipeline.try_send(ReactorEvent::input(stream.node_id.clone(), msg)) {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        };
    }

    let request_id = conn.next_id();
    let (tx, rx) = oneshot::channel();
    conn.live.insert(
        request_id,
        LiveConnection {
            flow_id: flow_id.clone(),
            kind: LiveKind::Http(tx),
        },
    );

    let event = ReactorEvent::input(stream.node_id.clone(), msg.with_request_id(request_id));
    if stream.pipeline.send(event).await.is_err() {
        conn.live.remove(&request_id);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match tokio::time::timeout(conn.request_timeout(), rx).await {
        Ok(Ok(reply)) => ([(header::CONTENT_TYPE, reply.content_type)], reply.body).into_response(),
        // flow unregistered while the caller was waiting
        Ok(Err(_)) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(_) => {
            conn.live.remove(&request_id);
            tracing::debug!("HTTP request {} to flow {} timed out", request_id, flow_id);
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

async fn ws_handler(
    State(conn): State<Arc<HttpConnector>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let Some((flow_id, stream)) = conn.lookup(&id) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !conn.is_allowed(&stream, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !stream.is_ws {
        tracing::info!("Stream of flow {} doesn't support WS", flow_id);
        return StatusCode::BAD_REQUEST.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let fid = flow_id.clone();
        let outcome = AssertUnwindSafe(conn.serve_ws(flow_id, stream, socket))
            .catch_unwind()
            .await;
        if outcome.is_err() {
            tracing::error!("WS connection of flow {} failed with a panic", fid);
        }
    })
}

#[async_trait]
impl Connector for HttpConnector {
    fn plugin(&self) -> &'static str {
        "http"
    }

    async fn init(&self) -> Result<()> {
        // Server is started lazily by the first registered flow.
        Ok(())
    }

    async fn stop(&self) {
        self.live.clear();
        self.streams.write().unwrap_or_else(PoisonError::into_inner).clear();
        self.shutdown_server().await;
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::EventKind;
    use serde_json::json;

    fn connector(timeout_secs: u64) -> Arc<HttpConnector> {
        Arc::new(HttpConnector::new(HttpConfig {
            bind_address: "127.0.0.1:0".into(),
            request_timeout_secs: timeout_secs,
            global_auth: AuthConfig::default(),
        }))
    }

    fn stream(pipeline: Pipeline, is_sync: bool) -> FlowStream {
        FlowStream {
            node_id: "http_in".into(),
            pipeline,
            is_sync,
            is_ws: true,
            publish_only: false,
            alias: "lights".into(),
            name: "Lights".into(),
            auth: AuthConfig::default(),
        }
    }

    async fn url(conn: &HttpConnector, path: &str) -> String {
        format!("http://{}{}", conn.local_addr().await.unwrap(), path)
    }

    #[tokio::test]
    async fn sync_request_gets_reply_from_flow() {
        let conn = connector(5);
        let (tx, mut rx) = mpsc::channel(8);
        conn.register_flow("f1", stream(tx, true)).await.unwrap();

        let responder = conn.clone();
        tokio::spawn(async move {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.kind, EventKind::Input);
            assert_eq!(event.msg.payload.value, json!({"on": true}));
            let id = event.msg.request_id.unwrap();
            assert!(responder.reply_to_request(id, br#"{"ok":true}"#.to_vec(), "application/json"));
        });

        let resp = reqwest::Client::new()
            .post(url(&conn, "/flow/lights/rest").await)
            .json(&json!({"on": true}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.json::<Value>().await.unwrap(), json!({"ok": true}));
        assert_eq!(conn.live_connection_count(), 0);
    }

    #[tokio::test]
    async fn second_trigger_of_a_flow_is_rejected() {
        let conn = connector(5);
        let (tx, _rx) = mpsc::channel(8);
        conn.register_flow("f1", stream(tx.clone(), false)).await.unwrap();

        let mut other = stream(tx.clone(), false);
        other.node_id = "http_in_2".into();
        let err = conn.register_flow("f1", other).await.unwrap_err();
        assert!(matches!(err, FlowError::InvalidOperation(_)));

        // the same node may re-register
        conn.register_flow("f1", stream(tx, true)).await.unwrap();
        conn.unregister_flow("f1").await;
    }

    #[tokio::test]
    async fn unknown_flow_is_404_and_async_stream_is_202() {
        let conn = connector(5);
        let (tx, mut rx) = mpsc::channel(8);
        conn.register_flow("f1", stream(tx, false)).await.unwrap();

        let client = reqwest::Client::new();
        let resp = client.get(url(&conn, "/flow/nope/rest").await).send().await.unwrap();
        assert_eq!(resp.status(), 404);

        let resp = client.get(url(&conn, "/flow/f1/rest?room=kitchen").await).send().await.unwrap();
        assert_eq!(resp.status(), 202);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.msg.payload.props.get("q.room").map(String::as_str), Some("kitchen"));
        assert!(event.msg.request_id.is_none());
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let conn = connector(1);
        let (tx, _rx) = mpsc::channel(8);
        conn.register_flow("f1", stream(tx, true)).await.unwrap();

        let resp = reqwest::get(url(&conn, "/flow/f1/rest").await).await.unwrap();
        assert_eq!(resp.status(), 504);
        assert_eq!(conn.live_connection_count(), 0);
    }

    #[tokio::test]
    async fn bearer_auth_rejects_wrong_token() {
        let conn = connector(5);
        let (tx, _rx) = mpsc::channel(8);
        let mut s = stream(tx, false);
        s.auth = AuthConfig {
            auth_type: AuthType::Bearer,
            token: "secret".into(),
        };
        conn.register_flow("f1", s).await.unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .get(url(&conn, "/flow/f1/rest").await)
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
        let resp = client
            .get(url(&conn, "/flow/f1/rest").await)
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
    }

    #[tokio::test]
    async fn unregister_releases_waiting_caller_and_stops_server() {
        let conn = connector(10);
        let (tx, mut rx) = mpsc::channel(8);
        conn.register_flow("f1", stream(tx, true)).await.unwrap();
        let target = url(&conn, "/flow/f1/rest").await;

        let caller = tokio::spawn(async move { reqwest::get(target).await.unwrap().status() });
        rx.recv().await.unwrap();
        conn.unregister_flow("f1").await;

        assert_eq!(caller.await.unwrap(), 503);
        assert!(conn.local_addr().await.is_none());
    }

    #[test]
    fn body_decoding_prefers_json() {
        assert_eq!(body_variable(b"").value_type, "null");
        assert_eq!(body_variable(b"42").value, json!(42));
        assert_eq!(body_variable(b"hello").value, json!("hello"));
    }
}
