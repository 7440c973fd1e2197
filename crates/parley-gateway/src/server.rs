//! HTTP and WebSocket surface
//!
//! Routes:
//! - `GET  /health`
//! - `GET  /ws`: the hub (see [`crate::protocol`])
//! - `GET  /api/approvals/pending`
//! - `POST /api/approvals/approve/{id}` and `/api/approvals/reject/{id}`
//! - `POST /api/elicitations/{id}`
//! - `POST /api/groups/{group}/publish`

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use parley_core::PendingCallView;
use parley_mcp::ElicitResult;

use crate::protocol::{
    CancelParams, ERR_INVALID_METHOD, ERR_INVALID_PARAMS, GatewayEvent, GatewayRequest,
    GatewayResponse, GroupParams, events, methods,
};
use crate::stream::{SessionRequest, StreamSession};
use crate::wire;

/// Background housekeeping intervals
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Unresolved approvals older than this are expired
    pub approval_timeout: Duration,
    pub approval_sweep_interval: Duration,
    pub thread_sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            approval_timeout: Duration::from_secs(600),
            approval_sweep_interval: Duration::from_secs(60),
            thread_sweep_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone)]
struct GatewayState {
    session: StreamSession,
    shutdown: CancellationToken,
}

pub struct GatewayServer {
    session: StreamSession,
    config: GatewayConfig,
}

impl GatewayServer {
    pub fn new(session: StreamSession, config: GatewayConfig) -> Self {
        Self { session, config }
    }

    /// The full router; WebSocket connections close when `shutdown` fires
    pub fn router(&self, shutdown: CancellationToken) -> Router {
        let state = GatewayState {
            session: self.session.clone(),
            shutdown,
        };
        Router::new()
            .route("/health", get(health))
            .route("/ws", get(ws_upgrade))
            .route("/api/approvals/pending", get(list_pending))
            .route("/api/approvals/approve/{id}", post(approve))
            .route("/api/approvals/reject/{id}", post(reject))
            .route("/api/elicitations/{id}", post(answer_elicitation))
            .route("/api/groups/{group}/publish", post(publish))
            .with_state(state)
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
    }

    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind gateway to {addr}"))?;
        self.run_on(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` fires
    pub async fn run_on(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let addr = listener.local_addr().context("Listener has no local address")?;
        let sweeper = self.session.gate().spawn_sweeper(
            self.config.approval_timeout,
            self.config.approval_sweep_interval,
            shutdown.clone(),
        );
        let janitor = self
            .session
            .threads()
            .spawn_janitor(self.config.thread_sweep_interval, shutdown.clone());

        let app = self.router(shutdown.clone());
        info!("Gateway listening on http://{}", addr);
        let served = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Gateway server error");

        sweeper.abort();
        janitor.abort();
        info!("Gateway stopped");
        served
    }
}

async fn health(State(state): State<GatewayState>) -> Json<Value> {
    let session = &state.session;
    Json(json!({
        "status": "ok",
        "pendingApprovals": session.gate().len(),
        "pendingElicitations": session.catalog().elicitations().pending_count(),
        "groups": session.broadcast().group_count(),
    }))
}

async fn list_pending(State(state): State<GatewayState>) -> Json<Vec<PendingCallView>> {
    Json(state.session.gate().list_pending())
}

async fn approve(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    decide(&state, &id, true)
}

async fn reject(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    decide(&state, &id, false)
}

fn decide(state: &GatewayState, id: &str, approved: bool) -> Result<Json<Value>, ApiError> {
    if !state.session.gate().resolve(id, approved) {
        return Err(ApiError::NotFound(format!("no pending call '{id}'")));
    }
    let decision = if approved { "approved" } else { "rejected" };
    Ok(Json(json!({ "id": id, "decision": decision })))
}

async fn answer_elicitation(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    Json(answer): Json<ElicitResult>,
) -> Result<Json<Value>, ApiError> {
    if !state.session.catalog().elicitations().respond(&id, answer) {
        return Err(ApiError::NotFound(format!("no pending elicitation '{id}'")));
    }
    Ok(Json(json!({ "id": id })))
}

async fn publish(
    State(state): State<GatewayState>,
    Path(group): Path<String>,
    payload: String,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let fragment = wire::decode(&payload).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let delivered = state.session.broadcast().publish(&group, fragment);
    debug!(group = %group, "Published to {} subscriber(s)", delivered);
    Ok((StatusCode::ACCEPTED, Json(json!({ "delivered": delivered }))))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> Response {
    ws.on_upgrade(move |socket| hub_connection(socket, state))
}

async fn hub_connection(socket: WebSocket, state: GatewayState) {
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(String, u64)>();
    let mut hub = HubConnection {
        connection: state.shutdown.child_token(),
        state,
        out: out_tx,
        done: done_tx,
        streams: HashMap::new(),
        next_stream: 0,
        groups: HashMap::new(),
    };
    let connection = hub.connection.clone();
    debug!("Hub client connected");

    loop {
        tokio::select! {
            _ = connection.cancelled() => break,
            Some(frame) = out_rx.recv() => {
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            Some((id, generation)) = done_rx.recv() => {
                hub.finish_stream(&id, generation);
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let response = hub.handle(text.as_str());
                    let Ok(frame) = serde_json::to_string(&response) else {
                        continue;
                    };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Hub socket error: {}", e);
                    break;
                }
            }
        }
    }

    hub.close();
    let _ = sink.close().await;
    debug!("Hub client disconnected");
}

/// A running stream; `generation` tells apart reuses of the same request id
struct ActiveStream {
    generation: u64,
    token: CancellationToken,
}

/// Per-socket state: in-flight streams and joined groups
struct HubConnection {
    state: GatewayState,
    connection: CancellationToken,
    out: mpsc::UnboundedSender<String>,
    done: mpsc::UnboundedSender<(String, u64)>,
    streams: HashMap<String, ActiveStream>,
    next_stream: u64,
    groups: HashMap<String, JoinHandle<()>>,
}

impl HubConnection {
    fn handle(&mut self, text: &str) -> GatewayResponse {
        let request: GatewayRequest = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                return GatewayResponse::err(None, ERR_INVALID_PARAMS, format!("invalid frame: {e}"));
            }
        };
        let id = request.id.clone();
        match request.method.as_str() {
            methods::MESSAGE_STREAM => self.start_stream(id, request.params),
            methods::MESSAGE_CANCEL => match serde_json::from_value::<CancelParams>(request.params) {
                Ok(params) => match self.streams.remove(&params.id) {
                    Some(active) => {
                        active.token.cancel();
                        GatewayResponse::ok(id, json!({ "cancelled": params.id }))
                    }
                    None => GatewayResponse::err(
                        id,
                        ERR_INVALID_PARAMS,
                        format!("no active stream '{}'", params.id),
                    ),
                },
                Err(e) => GatewayResponse::err(id, ERR_INVALID_PARAMS, e.to_string()),
            },
            methods::GROUP_JOIN => match serde_json::from_value::<GroupParams>(request.params) {
                Ok(params) => {
                    self.join(&params.group);
                    GatewayResponse::ok(id, json!({ "joined": params.group }))
                }
                Err(e) => GatewayResponse::err(id, ERR_INVALID_PARAMS, e.to_string()),
            },
            methods::GROUP_LEAVE => match serde_json::from_value::<GroupParams>(request.params) {
                Ok(params) => {
                    let left = self.leave(&params.group);
                    GatewayResponse::ok(id, json!({ "left": left }))
                }
                Err(e) => GatewayResponse::err(id, ERR_INVALID_PARAMS, e.to_string()),
            },
            other => {
                warn!("Unknown hub method: {}", other);
                GatewayResponse::err(id, ERR_INVALID_METHOD, format!("unknown method '{other}'"))
            }
        }
    }

    fn start_stream(&mut self, id: Option<String>, params: Value) -> GatewayResponse {
        let request: SessionRequest = match serde_json::from_value(params) {
            Ok(request) => request,
            Err(e) => return GatewayResponse::err(id, ERR_INVALID_PARAMS, e.to_string()),
        };
        let stream_id = id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if self.streams.contains_key(&stream_id) {
            return GatewayResponse::err(
                id,
                ERR_INVALID_PARAMS,
                format!("stream '{stream_id}' is already running"),
            );
        }

        let token = self.connection.child_token();
        let mut fragments = self.state.session.stream(request, &token);
        let generation = self.next_stream;
        self.next_stream += 1;
        self.streams
            .insert(stream_id.clone(), ActiveStream { generation, token });

        let out = self.out.clone();
        let done = self.done.clone();
        let task_id = stream_id.clone();
        tokio::spawn(async move {
            while let Some(fragment) = fragments.next().await {
                let Some(frame) = event_frame(events::MESSAGE_FRAGMENT, &fragment) else {
                    continue;
                };
                if out.send(frame).is_err() {
                    return;
                }
            }
            let end = json!({ "id": task_id, "cancelled": fragments.is_cancelled() });
            if let Some(frame) = event_frame(events::MESSAGE_END, &end) {
                let _ = out.send(frame);
            }
            let _ = done.send((task_id, generation));
        });

        GatewayResponse::ok(id, json!({ "id": stream_id }))
    }

    /// Forget a finished stream unless its id was already reused
    fn finish_stream(&mut self, id: &str, generation: u64) {
        if self
            .streams
            .get(id)
            .is_some_and(|active| active.generation == generation)
        {
            self.streams.remove(id);
        }
    }

    fn join(&mut self, group: &str) {
        if self.groups.contains_key(group) {
            return;
        }
        let mut subscription = self.state.session.broadcast().subscribe(group);
        let out = self.out.clone();
        let name = group.to_string();
        let forward = tokio::spawn(async move {
            while let Some(fragment) = subscription.recv().await {
                let data = json!({ "group": name, "fragment": fragment });
                let Some(frame) = event_frame(events::GROUP_MESSAGE, &data) else {
                    continue;
                };
                if out.send(frame).is_err() {
                    break;
                }
            }
        });
        self.groups.insert(group.to_string(), forward);
        info!(
            group = %group,
            subscribers = self.state.session.broadcast().subscriber_count(group),
            "Hub client joined group"
        );
    }

    fn leave(&mut self, group: &str) -> bool {
        match self.groups.remove(group) {
            Some(forward) => {
                forward.abort();
                info!(group = %group, "Hub client left group");
                true
            }
            None => false,
        }
    }

    fn close(&mut self) {
        self.connection.cancel();
        self.streams.clear();
        for (_, forward) in self.groups.drain() {
            forward.abort();
        }
    }
}

fn event_frame(event: &str, data: &impl Serialize) -> Option<String> {
    let data = serde_json::to_value(data).ok()?;
    serde_json::to_string(&GatewayEvent::new(event, data)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_frame_shape() {
        let frame = event_frame(events::MESSAGE_END, &json!({"id": "s1"})).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "message.end");
        assert_eq!(value["data"]["id"], "s1");
    }

    #[test]
    fn test_api_error_status() {
        let response = ApiError::NotFound("x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response = ApiError::BadRequest("x".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
