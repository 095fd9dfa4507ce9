//! Client transport: WebSocket endpoint for direction events
//!
//! Every connection on `/ws` is registered with the [`ClientRegistry`] and
//! receives each broadcast frame as a text message. The protocol is push-only;
//! anything a client sends is ignored apart from `Close`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broadcast::{ClientId, ClientRegistry, Frame};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind_addr: SocketAddr,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9876)),
        }
    }
}

// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Cannot bind client endpoint {addr}: {reason}")]
    TransportUnavailable { addr: SocketAddr, reason: String },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// State shared by all connection handlers
#[derive(Clone, Debug)]
pub struct AppState {
    pub registry: ClientRegistry,
    pub client_buffer: usize,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Health {
    pub status: String,
    pub clients: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(handle_websocket))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Binds the listener up front so a taken port is reported before anything
/// else starts.
pub async fn bind(settings: &ServerSettings) -> Result<TcpListener, ServerError> {
    let listener = TcpListener::bind(settings.bind_addr)
        .await
        .map_err(|e| ServerError::TransportUnavailable {
            addr: settings.bind_addr,
            reason: e.to_string(),
        })?;
    info!("Client endpoint listening on ws://{}/ws", settings.bind_addr);
    Ok(listener)
}

/// Serves until cancelled, then clears the registry.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    cancel: CancellationToken,
) -> Result<(), ServerError> {
    let registry = state.registry.clone();
    let app = router(state);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    info!("Client endpoint stopped");
    registry.clear();
    Ok(())
}

async fn health_check(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
        clients: state.registry.len(),
    })
}

async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (outbound_tx, outbound_rx) = mpsc::channel(state.client_buffer.max(1));
    let id = state.registry.register(outbound_tx);
    info!("New WebSocket connection established as {}", id);

    pump(socket, outbound_rx, id).await;

    state.registry.unregister(id);
    info!("WebSocket connection {} terminated", id);
}

/// Forwards broadcast frames to the socket until either side goes away.
async fn pump(socket: WebSocket, mut outbound: mpsc::Receiver<Frame>, id: ClientId) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    debug!("{} dropped from registry, closing", id);
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                if let Err(e) = sender.send(Message::Text(frame.to_string().into())).await {
                    warn!("Failed to send to {}: {}", id, e);
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("{} closed the connection", id);
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sender.send(Message::Pong(data)).await {
                            error!("Failed to send pong to {}: {}", id, e);
                            break;
                        }
                    }
                    Some(Ok(_)) => debug!("Ignoring inbound message from {}", id),
                    Some(Err(e)) => {
                        warn!("WebSocket error on {}: {}", id, e);
                        break;
                    }
                }
            }
        }
    }
}
