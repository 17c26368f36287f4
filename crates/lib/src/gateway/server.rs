//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config};
use crate::gateway::protocol::{ClientFrame, HelloPayload, ServerFrame, PROTOCOL_VERSION};
use crate::room::RoomBroadcaster;
use crate::session::Session;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Shared state for the gateway (config and the process-wide broadcaster).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub broadcaster: Arc<RoomBroadcaster>,
}

impl GatewayState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            broadcaster: Arc::new(RoomBroadcaster::default()),
        }
    }
}

/// Routes: `GET /` health, `GET /ws` chat socket.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// Blocks until shutdown (e.g. Ctrl+C), then tells every connection to close.
pub async fn run_gateway(config: Config) -> Result<()> {
    config.validate().context("invalid gateway config")?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        log::warn!(
            "gateway bound to non-loopback address {}; usernames are unauthenticated labels",
            bind
        );
    }

    let state = GatewayState::new(config);
    let broadcaster = state.broadcaster.clone();
    let bind_addr = format!("{}:{}", bind, state.config.gateway.port);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(broadcaster))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Queues a shutdown event to every connection and tears down all rooms.
async fn shutdown_signal(broadcaster: Arc<RoomBroadcaster>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing connections");
    broadcaster.shutdown().await;
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "connections": state.broadcaster.connection_count().await,
        "rooms": state.broadcaster.room_sizes().await,
    }))
}

/// GET /ws upgrades to WebSocket. The server speaks first with `hello`.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let broadcaster = state.broadcaster.as_ref();
    let (outbox_tx, mut outbox_rx) =
        mpsc::channel::<ServerFrame>(state.config.relay.outbound_buffer);
    let id = broadcaster.register(outbox_tx).await;
    let mut session = Session::new(id.clone(), state.config.relay.default_room.clone());

    let hello = ServerFrame::Hello(HelloPayload {
        connection_id: id.clone(),
        protocol: PROTOCOL_VERSION,
    });
    if socket.send(Message::Text(hello.to_text())).await.is_err() {
        session.close(broadcaster).await;
        return;
    }

    let idle_timeout = state.config.relay.idle_timeout_secs.map(Duration::from_secs);
    let mut last_seen = Instant::now();

    loop {
        let deadline = idle_timeout.map(|d| last_seen + d);
        let idle_expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;

            frame = outbox_rx.recv() => {
                // None: the broadcaster dropped this connection (evicted or shut down).
                let Some(frame) = frame else { break };
                let is_shutdown = frame.is_shutdown();
                if let Err(e) = socket.send(Message::Text(frame.to_text())).await {
                    log::warn!("{}: outbound write failed: {}", id, e);
                    break;
                }
                if is_shutdown {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                last_seen = Instant::now();
                match msg {
                    Message::Text(text) => match ClientFrame::parse(&text) {
                        Ok(frame) => session.handle(broadcaster, frame).await,
                        Err(e) => log::debug!("{}: ignoring frame: {}", id, e),
                    },
                    Message::Close(_) => break,
                    _ => continue,
                }
            }
            _ = idle_expired => {
                log::info!("{}: idle timeout, closing", id);
                break;
            }
        }
    }

    session.close(broadcaster).await;
    log::debug!("{}: connection closed", id);
}
