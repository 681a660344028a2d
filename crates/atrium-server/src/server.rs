use std::sync::Arc;
use std::time::Duration;

use atrium_core::launcher::TaskCallback;
use atrium_core::UserId;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ClientId, ClientRegistry};
use crate::event_bridge;
use crate::handlers::{self, SendMessageParams, ThreadParams};
use crate::notify::BroadcastNotifier;
use crate::orchestrator::{Orchestrator, ScheduledTask};
use crate::response::ApiResponse;
use crate::rpc::{RpcRequest, RpcResponse};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 9191,
            max_send_queue: 256,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub clients: Arc<ClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/rpc", post(rpc_handler))
        .route("/v1/messages", post(send_message))
        .route("/v1/threads/enter", post(enter_thread))
        .route("/v1/threads/leave", post(leave_thread))
        .route("/v1/threads/reset", post(reset_thread))
        .route("/v1/streams/stop", post(stop_streaming))
        .route("/v1/schedule/tick", post(schedule_tick))
        .route("/v1/callbacks/external-task", post(external_task_callback))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind, spawn the event bridge and socket plumbing, and serve until shut down.
pub async fn start(
    config: ServerConfig,
    orchestrator: Arc<Orchestrator>,
    notifier: &BroadcastNotifier,
) -> Result<ServerHandle, std::io::Error> {
    let clients = Arc::new(ClientRegistry::new(config.max_send_queue));
    let bridge = event_bridge::start_bridge(Arc::clone(&clients), notifier.subscribe());
    let cleanup = client::start_cleanup_task(Arc::clone(&clients), Duration::from_secs(60));

    let (message_tx, message_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let rpc = tokio::spawn(process_rpc_messages(
        message_rx,
        Arc::clone(&orchestrator),
        Arc::clone(&clients),
    ));

    let state = AppState {
        orchestrator,
        clients,
        message_tx,
    };
    let router = build_router(state, Duration::from_secs(config.request_timeout_secs));

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "atrium server listening");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server exited with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
        background: vec![bridge, cleanup, rpc],
    })
}

/// Keeps the server and its background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
    background: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task did not finish cleanly");
        }
        for task in self.background {
            task.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsParams {
    #[serde(alias = "userId")]
    user_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let user_id = UserId::from_raw(params.user_id.as_str());
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: UserId, state: AppState) {
    let (client_id, rx) = state.clients.register(user_id.clone());
    tracing::info!(client_id = %client_id, user_id = %user_id, "socket connected");
    client::handle_ws_connection(socket, client_id.clone(), rx, state.clients, state.message_tx).await;
    tracing::info!(client_id = %client_id, "socket closed");
}

/// Socket frames are JSON-RPC calls made on behalf of the socket's user.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    orchestrator: Arc<Orchestrator>,
    clients: Arc<ClientRegistry>,
) {
    while let Some((client_id, raw)) = rx.recv().await {
        let Some(user_id) = clients.user_of(&client_id) else {
            continue;
        };
        let orchestrator = Arc::clone(&orchestrator);
        let clients = Arc::clone(&clients);
        // Turns can be long; one slow call must not hold up the socket's other frames.
        tokio::spawn(async move {
            let response = match serde_json::from_str::<RpcRequest>(&raw) {
                Ok(req) => match bind_user(req.params.unwrap_or_else(|| serde_json::json!({})), &user_id) {
                    Ok(params) => handlers::dispatch(&orchestrator, &req.method, params, req.id).await,
                    Err(e) => RpcResponse::invalid_params(req.id, e),
                },
                Err(_) => RpcResponse::parse_error(),
            };
            if let Ok(json) = serde_json::to_string(&response) {
                clients.send_to(&client_id, json);
            }
        });
    }
}

/// Default `user_id` to the socket's user and refuse calls for anyone else.
fn bind_user(mut params: Value, user_id: &UserId) -> Result<Value, String> {
    let Some(obj) = params.as_object_mut() else {
        return Err("params must be an object".into());
    };
    let given = obj
        .get("user_id")
        .or_else(|| obj.get("userId"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    match given {
        Some(given) if given != user_id.as_str() => return Err("user_id does not match the connection".into()),
        Some(_) => {}
        None => {
            obj.insert("user_id".into(), Value::String(user_id.as_str().to_string()));
        }
    }
    Ok(params)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    state.orchestrator.health().into_response()
}

async fn rpc_handler(State(state): State<AppState>, body: Result<Json<RpcRequest>, JsonRejection>) -> Response {
    let req = match body {
        Ok(Json(req)) => req,
        Err(_) => return Json(RpcResponse::parse_error()).into_response(),
    };
    let params = req.params.unwrap_or_else(|| serde_json::json!({}));
    Json(handlers::dispatch(&state.orchestrator, &req.method, params, req.id).await).into_response()
}

fn invalid(message: impl Into<String>) -> Response {
    ApiResponse::<()>::failure("invalid_params", message).into_response()
}

fn thread_body(body: Result<Json<ThreadParams>, JsonRejection>) -> Result<ThreadParams, Response> {
    let Json(p) = body.map_err(|e| invalid(e.body_text()))?;
    p.validate().map_err(invalid)?;
    Ok(p)
}

async fn send_message(
    State(state): State<AppState>,
    body: Result<Json<SendMessageParams>, JsonRejection>,
) -> Response {
    let p = match body {
        Ok(Json(p)) => p,
        Err(e) => return invalid(e.body_text()),
    };
    if let Err(e) = p.thread.validate() {
        return invalid(e);
    }
    state
        .orchestrator
        .send_message(p.thread.tenant(), p.thread.thread(), p.text)
        .await
        .into_response()
}

async fn enter_thread(State(state): State<AppState>, body: Result<Json<ThreadParams>, JsonRejection>) -> Response {
    match thread_body(body) {
        Ok(p) => state.orchestrator.enter_thread(p.tenant(), p.thread()).await.into_response(),
        Err(resp) => resp,
    }
}

async fn leave_thread(State(state): State<AppState>, body: Result<Json<ThreadParams>, JsonRejection>) -> Response {
    match thread_body(body) {
        Ok(p) => state.orchestrator.leave_thread(p.tenant(), p.thread()).await.into_response(),
        Err(resp) => resp,
    }
}

async fn reset_thread(State(state): State<AppState>, body: Result<Json<ThreadParams>, JsonRejection>) -> Response {
    match thread_body(body) {
        Ok(p) => state.orchestrator.reset_thread(p.tenant(), p.thread()).await.into_response(),
        Err(resp) => resp,
    }
}

async fn stop_streaming(State(state): State<AppState>, body: Result<Json<ThreadParams>, JsonRejection>) -> Response {
    match thread_body(body) {
        Ok(p) => state.orchestrator.stop_streaming(p.tenant(), p.thread()).await.into_response(),
        Err(resp) => resp,
    }
}

async fn schedule_tick(State(state): State<AppState>, body: Result<Json<ScheduledTask>, JsonRejection>) -> Response {
    match body {
        Ok(Json(task)) => state.orchestrator.run_scheduled_task_tick(task).await.into_response(),
        Err(e) => invalid(e.body_text()),
    }
}

/// Webhook for the external task launcher.
async fn external_task_callback(
    State(state): State<AppState>,
    body: Result<Json<TaskCallback>, JsonRejection>,
) -> Response {
    match body {
        Ok(Json(callback)) => state
            .orchestrator
            .resolve_external_task_callback(callback)
            .await
            .into_response(),
        Err(e) => invalid(e.body_text()),
    }
}
