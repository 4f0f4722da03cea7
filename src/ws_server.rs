//! HTTP/WebSocket front of the presence service using Axum.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::presence::{ClientEvent, RoomInfo, RoomRegistry, SessionId};
use crate::state::AppState;

/// Routes of the presence service.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/rooms", get(list_rooms))
        .route("/rooms/:id", get(get_room))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

/// Periodically disconnect sessions whose socket task is gone.
pub fn spawn_reaper(registry: Arc<RoomRegistry>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(every);
        loop {
            interval.tick().await;
            let reaped = registry.reap_closed().await;
            if reaped > 0 {
                info!(reaped, "reaped dead sessions");
            }
        }
    })
}

/// Run the presence server until Ctrl-C.
pub async fn run_server(state: AppState) -> std::io::Result<()> {
    let reaper = spawn_reaper(state.registry.clone(), state.config.reap_interval);
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting presence server on {}", addr);

    let registry = state.registry.clone();
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            registry.shutdown().await;
        })
        .await?;
    reaper.abort();
    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {error}");
    }
    info!("shutdown signal received");
}

async fn health() -> &'static str {
    "OK"
}

async fn list_rooms(State(state): State<AppState>) -> Json<Vec<RoomInfo>> {
    Json(state.registry.rooms().await)
}

async fn get_room(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RoomInfo>, StatusCode> {
    state
        .registry
        .rooms()
        .await
        .into_iter()
        .find(|r| r.project_id == id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, registry))
}

async fn handle_socket(socket: WebSocket, registry: Arc<RoomRegistry>) {
    let (session, mut outbound) = registry.connect().await;
    let (mut sink, mut stream) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode event: {e}");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => handle_client_message(&registry, session, &text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(session_id = %session, "socket error: {e}");
                break;
            }
        }
    }

    registry.disconnect(session).await;
    send_task.abort();
}

async fn handle_client_message(registry: &RoomRegistry, session: SessionId, text: &str) {
    let event: ClientEvent = match serde_json::from_str(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(session_id = %session, "invalid message: {e}");
            registry
                .notify_error(session, format!("invalid message: {e}"))
                .await;
            return;
        }
    };
    let result = match event {
        ClientEvent::JoinProject(project_id) => {
            registry.join(session, &project_id).await.map(|_| ())
        }
        ClientEvent::LeaveProject(project_id) => {
            registry.leave(session, &project_id).await.map(|_| ())
        }
        ClientEvent::FileChange {
            project_id,
            path,
            content,
        } => registry
            .publish_file_change(session, &project_id, &path, &content)
            .await
            .map(|_| ()),
        ClientEvent::TerminalInput { project_id, data } => registry
            .publish_terminal_data(session, &project_id, &data)
            .await
            .map(|_| ()),
    };
    if let Err(err) = result {
        debug!(session_id = %session, error = %err, "rejected client event");
        registry.notify_error(session, err.to_string()).await;
    }
}
