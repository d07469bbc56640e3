//! ==============================================================================
//! server.rs - web server for live subscribers
//! ==============================================================================
//!
//! routes:
//!     GET /ws          websocket; one hub subscriber per connection
//!     GET /api/state   json: connection status, subscriber count, latest snapshot
//!     *                static dashboard assets from `server.static_dir`
//!
//! relationships:
//!     - uses: hub.rs (HubHandle, ChannelSubscriber)
//!     - used by: main.rs
//!
//! ==============================================================================

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, services::ServeDir};
use tracing::{debug, info, warn};

use crate::hub::{ChannelSubscriber, HubHandle, SubscriberEvent};

#[derive(Clone)]
pub struct ServerState {
    pub hub: HubHandle,
    pub queue_depth: usize,
}

pub fn router(state: ServerState, static_dir: &Path) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/state", get(state_handler))
        .fallback_service(ServeDir::new(static_dir))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn run_server(
    state: ServerState,
    static_dir: &Path,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(state, static_dir);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!("[STARTUP] ✓ Relay live at http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("web server error")?;
    Ok(())
}

/// json api endpoint for programmatic access
async fn state_handler(State(state): State<ServerState>) -> Response {
    match state.hub.state().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, format!("{e:#}")).into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: ServerState) {
    let (tx, mut rx) = mpsc::channel(state.queue_depth);
    let id = match state.hub.join(ChannelSubscriber::new(tx)).await {
        Ok(id) => id,
        Err(e) => {
            warn!("rejecting web client: {:#}", e);
            let _ = socket.close().await;
            return;
        }
    };
    info!(%id, "Web client connected");

    loop {
        tokio::select! {
            event = rx.recv() => {
                // None: the hub dropped us (closed or too slow); the client reconnects for a replay
                let Some(event) = event else { break };
                if let Err(e) = forward(&mut socket, &event).await {
                    debug!(%id, "send failed: {}", e);
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                // pings are answered by axum; client text is ignored
                Some(Ok(_)) => {}
            },
        }
    }

    if let Err(e) = state.hub.leave(id).await {
        debug!(%id, "leave after hub shutdown: {:#}", e);
    }
    info!(%id, "Web client disconnected");
}

async fn forward(socket: &mut WebSocket, event: &SubscriberEvent) -> Result<()> {
    let text = serde_json::to_string(event).context("failed to encode subscriber event")?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}
