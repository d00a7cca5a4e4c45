// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP server error: {0}")]
    Http(#[from] std::io::Error),

    #[error("malformed client message: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("lane rejected the request: {0}")]
    Lane(#[from] nimbus_core::LaneQueueError),
}
