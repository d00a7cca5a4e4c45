// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod error;
mod protocol;
mod service;
mod ws;

pub use error::GatewayError;
pub use protocol::{
    ClientApprovalDecision, ClientMessage, LogLevel, ServerEnvelope, ServerMessage,
    SystemCommandKind, SystemStatusKind, TierWire, WorkerStatusPayload,
};
pub use service::GatewayService;
pub use ws::ws_handler;

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;

/// Builds the axum router: `GET /ws` upgrades to the WebSocket bridge, the
/// service is shared as router state.
pub fn router(service: GatewayService) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Binds and serves the gateway on `addr` until the process is signalled to
/// stop. Returns once the listener closes.
pub async fn serve(addr: SocketAddr, service: GatewayService) -> anyhow::Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "gateway listening");
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, make_service).await.map_err(anyhow::Error::from)
}
