// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Wire protocol between a local client (the web UI, a CLI, a notebook) and
//! the daemon's WebSocket gateway.
//!
//! All types derive `Serialize`/`Deserialize` and are encoded as JSON text
//! frames. Messages are discriminated by `type` and carry their fields under
//! `payload`; server messages additionally carry an ISO-8601 `timestamp`.
//!
//! # Typical session flow
//!
//! ```text
//! Client                              Gateway / Daemon
//!    │                                     │
//!    │── chat:request {requestId} ────────►│  enqueued on the client's lane
//!    │◄─ chat:stream:chunk {delta} ─────────│  ... N times ...
//!    │◄─ chat:tool:call {toolName} ─────────│  (if a tool is invoked)
//!    │◄─ approval:request {approvalId} ─────│  (if the tool needs approval)
//!    │── approval:response {decision} ─────►│
//!    │◄─ chat:tool:result {success} ────────│
//!    │◄─ chat:stream:done {fullText} ───────│
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nimbus_core::{ApprovalDecision, ApprovalReason, DaemonState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemStatusKind {
    Starting,
    Ready,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierWire {
    Tier1,
    Tier2,
    Worker,
}

impl From<TierWire> for nimbus_core::Tier {
    fn from(tier: TierWire) -> Self {
        match tier {
            TierWire::Tier1 => nimbus_core::Tier::Tier1,
            TierWire::Tier2 => nimbus_core::Tier::Tier2,
            TierWire::Worker => nimbus_core::Tier::Worker,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusPayload {
    pub enabled: bool,
    pub model: Option<String>,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Messages the daemon pushes to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    #[serde(rename = "heartbeat")]
    Heartbeat {
        uptime_ms: u64,
        pid: u32,
        port: u16,
        state: DaemonState,
        active_tasks: usize,
        pending_tasks: usize,
        awaiting_approval: bool,
        connected_clients: usize,
        tick: u64,
        worker_status: Option<WorkerStatusPayload>,
    },
    #[serde(rename = "log")]
    Log { level: LogLevel, source: String, message: String },
    #[serde(rename = "system:status")]
    SystemStatus { status: SystemStatusKind },
    #[serde(rename = "chat:stream:chunk")]
    ChatStreamChunk { request_id: String, delta: String },
    #[serde(rename = "chat:stream:done")]
    ChatStreamDone { request_id: String, full_text: String, tier: String, model: String },
    #[serde(rename = "chat:error")]
    ChatError { request_id: String, error: String },
    #[serde(rename = "chat:tool:call")]
    ChatToolCall { request_id: String, tool_name: String, args: serde_json::Value },
    #[serde(rename = "chat:tool:result")]
    ChatToolResult { request_id: String, tool_name: String, success: bool, result: String },
    #[serde(rename = "approval:request")]
    ApprovalRequest {
        approval_id: String,
        tool_name: String,
        description: String,
        reason: ApprovalReason,
        args: serde_json::Value,
        expires_at_ms: i64,
    },
    #[serde(rename = "approval:resolved")]
    ApprovalResolved { approval_id: String, decision: ApprovalDecision },
    #[serde(rename = "worker_task_completed")]
    WorkerTaskCompleted { task_id: String, description: String, task_type: String, result_length: usize },
    #[serde(rename = "worker_task_failed")]
    WorkerTaskFailed { task_id: String, description: String, error: String },
}

/// A `ServerMessage` wrapped with the envelope timestamp every server push
/// carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEnvelope {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub message: ServerMessage,
}

impl ServerEnvelope {
    pub fn now(message: ServerMessage) -> Self {
        Self { timestamp: Utc::now(), message }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SystemCommandKind {
    ForceLocal,
    AutoRoute,
    SwitchCloud,
    Status,
    SetDefaultTier,
    ForceWorker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientApprovalDecision {
    AllowOnce,
    Deny,
}

/// Messages a client sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "chat:request")]
    ChatRequest {
        request_id: String,
        content: String,
        tier: Option<TierWire>,
        #[serde(default)]
        is_onboarding: bool,
        messages: Option<Vec<serde_json::Value>>,
    },
    #[serde(rename = "system:command")]
    SystemCommand { command: SystemCommandKind, args: Option<serde_json::Value> },
    #[serde(rename = "approval:response")]
    ApprovalResponse { approval_id: String, decision: ClientApprovalDecision },
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_stream_chunk_serializes_with_tag_and_payload() {
        let msg = ServerMessage::ChatStreamChunk { request_id: "r1".into(), delta: "hi".into() };
        let json = serde_json::to_value(ServerEnvelope::now(msg)).unwrap();
        assert_eq!(json["type"], "chat:stream:chunk");
        assert_eq!(json["payload"]["requestId"], "r1");
        assert_eq!(json["payload"]["delta"], "hi");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn client_chat_request_round_trips() {
        let json = r#"{"type":"chat:request","payload":{"requestId":"r1","content":"hello"}}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        match parsed {
            ClientMessage::ChatRequest { request_id, content, is_onboarding, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(content, "hello");
                assert!(!is_onboarding);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ping_has_no_payload_fields() {
        let json = serde_json::to_value(ClientMessage::Ping).unwrap();
        assert_eq!(json["type"], "ping");
    }

    #[test]
    fn approval_response_decision_is_kebab_case() {
        let json = serde_json::to_value(ClientMessage::ApprovalResponse {
            approval_id: "a1".into(),
            decision: ClientApprovalDecision::AllowOnce,
        })
        .unwrap();
        assert_eq!(json["payload"]["decision"], "allow-once");
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let json = r#"{"type":"not:a:real:type","payload":{}}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }
}
