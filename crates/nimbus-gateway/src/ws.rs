// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! WebSocket bridge — translates a browser/CLI WebSocket connection into
//! `ClientMessage`/`ServerEnvelope` calls against a [`GatewayService`].
//!
//! # Wire format
//!
//! JSON over WebSocket (text frames). Comfortable for browsers and avoids
//! pulling a binary codec into the web UI bundle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::{
    ws::{Message, WebSocket, WebSocketUpgrade},
    ConnectInfo, State,
};
use axum::response::Response;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::protocol::{ClientMessage, ServerEnvelope};
use crate::service::GatewayService;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// HTTP handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(service): State<GatewayService>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, service, peer))
}

/// Bridges one WebSocket connection to the gateway service for its lifetime.
pub async fn handle_socket(mut socket: WebSocket, service: GatewayService, peer: SocketAddr) {
    let client_id = format!("ws-{}", NEXT_CLIENT_ID.fetch_add(1, Ordering::SeqCst));
    info!(%peer, client = %client_id, "WebSocket client connected");
    service.client_connected();
    let mut events = service.subscribe();

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(parsed) => {
                                log_message(&parsed, &client_id);
                                service.handle_client_message(&client_id, parsed).await;
                            }
                            Err(e) => {
                                warn!(client = %client_id, "invalid client message JSON: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary frames ignored
                    Some(Err(e)) => {
                        debug!(client = %client_id, "WebSocket recv error: {e}");
                        break;
                    }
                }
            }
            result = events.recv() => {
                match result {
                    Ok(envelope) => send_envelope(&mut socket, &envelope).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(client = %client_id, "WebSocket client lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    service.client_disconnected(&client_id).await;
    info!(%peer, client = %client_id, "WebSocket client disconnected");
}

/// Logged at a level matched to sensitivity — chat content is truncated so
/// a long prompt doesn't flood the log.
fn log_message(msg: &ClientMessage, client_id: &str) {
    match msg {
        ClientMessage::Ping => {}
        ClientMessage::ChatRequest { request_id, content, .. } => {
            let preview: String = content.chars().take(80).collect();
            let truncated = if content.len() > 80 { "…" } else { "" };
            info!(client = %client_id, request = %request_id, content = ?format!("{preview}{truncated}"), "chat request");
        }
        ClientMessage::SystemCommand { command, .. } => {
            info!(client = %client_id, ?command, "system command");
        }
        ClientMessage::ApprovalResponse { approval_id, decision } => {
            info!(client = %client_id, approval = %approval_id, ?decision, "approval response");
        }
    }
}

async fn send_envelope(socket: &mut WebSocket, envelope: &ServerEnvelope) {
    if let Ok(json) = serde_json::to_string(envelope) {
        let _ = socket.send(Message::Text(json)).await;
    }
}
