// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! `GatewayService` — the hub that connects WebSocket clients to the chat
//! handler, the heartbeat, the approval gate, and the cron scheduler.
//!
//! # Design
//!
//! ```text
//!   ws_handler (per connection) ──► service.handle_client_message() ──► ChatHandler::handle
//!                                │                                           │
//!                                └── broadcast::Receiver<ServerEnvelope> ◄───┘
//! ```
//!
//! Unlike a single non-reentrant agent, `ChatHandler` is itself safe for
//! concurrent calls (each turn is serialized only within its own lane), so
//! the service does not funnel commands through a single sequential loop —
//! each inbound `chat:request` is handled on its own task, and lane
//! ordering is enforced by `LaneQueue` underneath.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use nimbus_config::ModelCandidate;
use nimbus_core::{
    ApprovalDecision, ApprovalEvent, ChatHandler, ChatRequest, HeartbeatMessage, Tier, WorkerEvent,
};
use nimbus_scheduler::CronScheduler;
use tokio::sync::{broadcast, Mutex};
use tracing::warn;

use crate::protocol::{
    ClientApprovalDecision, ClientMessage, ServerEnvelope, ServerMessage, SystemCommandKind,
    SystemStatusKind, WorkerStatusPayload,
};

/// Cheap-to-clone handle shared by every transport handler (currently just
/// the WebSocket bridge, but the split mirrors how a second transport would
/// plug in without touching the dispatch logic).
#[derive(Clone)]
pub struct GatewayService {
    inner: Arc<Inner>,
}

struct Inner {
    chat_handler: Arc<ChatHandler>,
    approvals: Arc<nimbus_core::ApprovalGate>,
    heartbeat: Arc<nimbus_core::Heartbeat>,
    scheduler: Arc<CronScheduler>,
    candidates: (ModelCandidate, Vec<ModelCandidate>),
    lane_max_concurrent: usize,
    connected_clients: AtomicUsize,
    events_tx: broadcast::Sender<ServerEnvelope>,
    /// Per-connection default tier override set by `system:command`.
    default_tiers: Mutex<std::collections::HashMap<String, Tier>>,
}

impl GatewayService {
    pub fn new(
        chat_handler: Arc<ChatHandler>,
        approvals: Arc<nimbus_core::ApprovalGate>,
        heartbeat: Arc<nimbus_core::Heartbeat>,
        scheduler: Arc<CronScheduler>,
        candidates: (ModelCandidate, Vec<ModelCandidate>),
        lane_max_concurrent: usize,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(256);
        let service = Self {
            inner: Arc::new(Inner {
                chat_handler,
                approvals,
                heartbeat,
                scheduler,
                candidates,
                lane_max_concurrent,
                connected_clients: AtomicUsize::new(0),
                events_tx,
                default_tiers: Mutex::new(std::collections::HashMap::new()),
            }),
        };
        service.spawn_relays();
        service
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEnvelope> {
        self.inner.events_tx.subscribe()
    }

    pub fn client_connected(&self) -> usize {
        self.inner.heartbeat.client_connected();
        self.inner.connected_clients.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn client_disconnected(&self, client_id: &str) {
        self.inner.heartbeat.client_disconnected();
        self.inner.connected_clients.fetch_sub(1, Ordering::SeqCst);
        self.inner.chat_handler.on_disconnect(client_id, &self.inner.approvals).await;
        self.inner.default_tiers.lock().await.remove(client_id);
    }

    fn emit(&self, message: ServerMessage) {
        let _ = self.inner.events_tx.send(ServerEnvelope::now(message));
    }

    /// Forward heartbeat ticks, worker-queue events, and approval events
    /// onto the client-facing broadcast channel for the lifetime of the
    /// service. Spawned once in `new`.
    fn spawn_relays(&self) {
        let heartbeat_relay = self.clone();
        let mut heartbeat_rx = self.inner.heartbeat.subscribe_heartbeat();
        tokio::spawn(async move {
            while let Ok(msg) = heartbeat_rx.recv().await {
                heartbeat_relay.emit(heartbeat_message_to_wire(msg));
            }
        });

        let worker_relay = self.clone();
        let mut worker_rx = self.inner.heartbeat.subscribe_worker();
        tokio::spawn(async move {
            while let Ok(ev) = worker_rx.recv().await {
                worker_relay.emit(worker_event_to_wire(ev));
            }
        });

        let approval_relay = self.clone();
        let mut approval_rx = self.inner.approvals.subscribe();
        tokio::spawn(async move {
            while let Ok(ev) = approval_rx.recv().await {
                approval_relay.emit(approval_event_to_wire(ev));
            }
        });
    }

    /// Dispatch one parsed client message. `client_id` identifies the
    /// connection (used to derive the session lane and as the approval
    /// session prefix).
    pub async fn handle_client_message(&self, client_id: &str, message: ClientMessage) {
        match message {
            ClientMessage::Ping => {}
            ClientMessage::ChatRequest { request_id, content, tier, is_onboarding: _, messages: _ } => {
                self.handle_chat_request(client_id, request_id, content, tier).await;
            }
            ClientMessage::SystemCommand { command, args } => {
                self.handle_system_command(client_id, command, args).await;
            }
            ClientMessage::ApprovalResponse { approval_id, decision } => {
                let decision = match decision {
                    ClientApprovalDecision::AllowOnce => ApprovalDecision::AllowOnce,
                    ClientApprovalDecision::Deny => ApprovalDecision::Deny,
                };
                let session_id = format!("session:{client_id}");
                self.inner.approvals.resolve(&approval_id, decision, Some(&session_id)).await;
            }
        }
    }

    async fn handle_chat_request(&self, client_id: &str, request_id: String, content: String, tier: Option<crate::protocol::TierWire>) {
        let forced_tier = match tier {
            Some(t) => Some(t.into()),
            None => self.inner.default_tiers.lock().await.get(client_id).copied(),
        };
        let request = ChatRequest {
            request_id: request_id.clone(),
            client_id: Some(client_id.to_string()),
            content,
            forced_tier,
            lane_override: None,
        };
        let service = self.clone();
        let candidates = self.inner.candidates.clone();
        let lane_max_concurrent = self.inner.lane_max_concurrent;
        let chat_handler = self.inner.chat_handler.clone();
        let client_id = client_id.to_string();
        let stream_request_id = request_id.clone();
        tokio::spawn(async move {
            let emit_service = service.clone();
            let result = chat_handler
                .handle(request, candidates, lane_max_concurrent, move |event| {
                    if let Some(msg) = agent_event_to_wire(&stream_request_id, event) {
                        emit_service.emit(msg);
                    }
                })
                .await;
            match result {
                Ok(outcome) => service.emit(ServerMessage::ChatStreamDone {
                    request_id: outcome.request_id,
                    full_text: outcome.full_text,
                    tier: outcome.tier,
                    model: outcome.model,
                }),
                Err(e) => {
                    warn!(client = %client_id, error = %e, "chat turn failed");
                    service.emit(ServerMessage::ChatError { request_id, error: e.to_string() });
                }
            }
        });
    }

    async fn handle_system_command(&self, client_id: &str, command: SystemCommandKind, args: Option<serde_json::Value>) {
        let mut tiers = self.inner.default_tiers.lock().await;
        match command {
            SystemCommandKind::ForceLocal => {
                tiers.insert(client_id.to_string(), Tier::Tier1);
            }
            SystemCommandKind::SwitchCloud => {
                tiers.insert(client_id.to_string(), Tier::Tier2);
            }
            SystemCommandKind::ForceWorker => {
                tiers.insert(client_id.to_string(), Tier::Worker);
            }
            SystemCommandKind::AutoRoute => {
                tiers.remove(client_id);
            }
            SystemCommandKind::SetDefaultTier => {
                let requested = args.as_ref().and_then(|v| v.get("tier")).and_then(|v| v.as_str());
                match requested {
                    Some("tier1") => {
                        tiers.insert(client_id.to_string(), Tier::Tier1);
                    }
                    Some("tier2") => {
                        tiers.insert(client_id.to_string(), Tier::Tier2);
                    }
                    Some("worker") => {
                        tiers.insert(client_id.to_string(), Tier::Worker);
                    }
                    _ => warn!(client = %client_id, "set-default-tier with missing/invalid tier arg"),
                }
            }
            SystemCommandKind::Status => {
                drop(tiers);
                self.emit(ServerMessage::SystemStatus { status: SystemStatusKind::Ready });
                return;
            }
        }
    }

    pub fn scheduler(&self) -> &Arc<CronScheduler> {
        &self.inner.scheduler
    }
}

fn heartbeat_message_to_wire(msg: HeartbeatMessage) -> ServerMessage {
    let s = msg.snapshot;
    ServerMessage::Heartbeat {
        uptime_ms: msg.uptime_ms,
        pid: msg.pid,
        port: msg.port,
        state: s.state,
        active_tasks: s.active_tasks,
        pending_tasks: s.pending_tasks,
        awaiting_approval: s.awaiting_approval,
        connected_clients: s.connected_clients,
        tick: msg.tick,
        worker_status: Some(WorkerStatusPayload {
            enabled: s.worker_enabled,
            model: s.worker_model,
            pending: s.worker_pending,
            running: s.worker_running,
            completed: s.worker_completed,
            failed: s.worker_failed,
        }),
    }
}

fn worker_event_to_wire(ev: WorkerEvent) -> ServerMessage {
    match ev {
        WorkerEvent::TaskCompleted { task_id, description, result_len } => ServerMessage::WorkerTaskCompleted {
            task_id,
            description,
            task_type: "general".into(),
            result_length: result_len,
        },
        WorkerEvent::TaskFailed { task_id, description, error } => {
            ServerMessage::WorkerTaskFailed { task_id, description, error }
        }
    }
}

fn approval_event_to_wire(ev: ApprovalEvent) -> ServerMessage {
    match ev {
        ApprovalEvent::Requested(req) => ServerMessage::ApprovalRequest {
            approval_id: req.id,
            tool_name: req.tool_name,
            description: req.description,
            reason: req.reason,
            args: req.args,
            expires_at_ms: req.expires_at_ms as i64,
        },
        ApprovalEvent::Resolved { approval_id, decision } => {
            ServerMessage::ApprovalResolved { approval_id, decision }
        }
    }
}

/// Maps one router-level event onto its wire equivalent. Events with no
/// wire counterpart (thinking deltas, token usage, todo updates, context
/// compaction, turn-complete) are swallowed here; `ChatStreamDone` is
/// synthesized separately from the turn's final `TurnOutcome`.
fn agent_event_to_wire(request_id: &str, event: nimbus_core::AgentEvent) -> Option<ServerMessage> {
    use nimbus_core::AgentEvent as E;
    match event {
        E::TextDelta(delta) => Some(ServerMessage::ChatStreamChunk { request_id: request_id.to_string(), delta }),
        E::ToolCallStarted(call) => Some(ServerMessage::ChatToolCall {
            request_id: request_id.to_string(),
            tool_name: call.name,
            args: call.args,
        }),
        E::ToolCallFinished { tool_name, output, is_error, .. } => Some(ServerMessage::ChatToolResult {
            request_id: request_id.to_string(),
            tool_name,
            success: !is_error,
            result: output,
        }),
        E::Error(message) => Some(ServerMessage::ChatError { request_id: request_id.to_string(), error: message }),
        E::TextComplete(_)
        | E::ThinkingDelta(_)
        | E::ThinkingComplete(_)
        | E::ContextCompacted { .. }
        | E::TokenUsage { .. }
        | E::TurnComplete
        | E::TodoUpdate(_)
        | E::Question { .. }
        | E::QuestionAnswer { .. } => None,
    }
}
