//! WebSocket endpoint for remote data-plane agents.
//!
//! Each connection authenticates with its first frame, then the socket is
//! pumped both ways: gateway frames out, agent events in. The gateway owns
//! all session state; this adapter only moves frames.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::models::AgentToGateway;
use crate::services::gateway::AgentGateway;

pub fn router(gateway: Arc<AgentGateway>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/agent", get(ws_agent))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Bind and serve until the shutdown future resolves.
pub async fn serve(
    addr: SocketAddr,
    gateway: Arc<AgentGateway>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "agent channel listening");
    axum::serve(listener, router(gateway).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({ "status": "ok" }))
}

async fn ws_agent(
    State(gateway): State<Arc<AgentGateway>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_agent_socket(socket, gateway, remote, user_agent))
}

async fn handle_agent_socket(
    socket: WebSocket,
    gateway: Arc<AgentGateway>,
    remote: SocketAddr,
    user_agent: Option<String>,
) {
    let socket_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();

    // The first frame must be the auth handshake.
    let api_key = loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<AgentToGateway>(&text) {
                    Ok(AgentToGateway::Auth { api_key }) => break api_key,
                    _ => {
                        let _ = sender
                            .send(Message::Text(
                                json!({"event": "error", "data": {"message": "auth required"}})
                                    .to_string(),
                            ))
                            .await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::channel(64);
    if let Err(e) = gateway
        .register(&socket_id, &api_key, Some(remote.to_string()), user_agent, outbound_tx)
        .await
    {
        warn!(%remote, error = %e, "agent authentication failed");
        let _ = sender
            .send(Message::Text(
                json!({"event": "error", "data": {"message": e.to_string()}}).to_string(),
            ))
            .await;
        return;
    }

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                if sender.send(Message::Text(text)).await.is_err() {
                    debug!(socket_id, "agent send failed; closing");
                    break;
                }
            }

            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<AgentToGateway>(&text) {
                            Ok(AgentToGateway::Heartbeat(payload)) => {
                                gateway.heartbeat(&socket_id, &payload);
                            }
                            Ok(AgentToGateway::CommandResponse { command_id, response }) => {
                                gateway.handle_response(&command_id, response);
                            }
                            Ok(AgentToGateway::SchemaDiscovered { schema }) => {
                                gateway.schema_discovered(&socket_id, schema);
                            }
                            // Repeated auth frames are ignored.
                            Ok(AgentToGateway::Auth { .. }) => {}
                            Err(e) => {
                                warn!(socket_id, error = %e, "unparseable agent frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(socket_id, error = %e, "agent socket error");
                        break;
                    }
                }
            }
        }
    }

    gateway.disconnect(&socket_id);
}
