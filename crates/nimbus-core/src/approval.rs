// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Human-in-the-loop approval gate: pauses a flagged tool call pending a
//! client decision, with expiry, plus a per-tool flag registry.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalReason {
    Destructive,
    Intrusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalDecision {
    AllowOnce,
    AllowAlways,
    Deny,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub tool_name: String,
    pub description: String,
    pub reason: ApprovalReason,
    pub args: serde_json::Value,
    pub expires_at_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ToolFlags {
    pub destructive: bool,
    pub intrusive: bool,
}

impl ToolFlags {
    pub fn needs_approval(&self) -> bool {
        self.destructive || self.intrusive
    }
}

/// Maps a tool identifier to its destructive/intrusive flags.
#[derive(Debug, Default)]
pub struct ToolFlagRegistry {
    flags: Mutex<HashMap<String, ToolFlags>>,
}

impl ToolFlagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, tool_name: impl Into<String>, flags: ToolFlags) {
        self.flags.lock().await.insert(tool_name.into(), flags);
    }

    pub async fn get(&self, tool_name: &str) -> ToolFlags {
        self.flags.lock().await.get(tool_name).cloned().unwrap_or_default()
    }
}

struct Pending {
    request: ApprovalRequest,
    responder: Option<oneshot::Sender<bool>>,
    expiry: tokio::task::JoinHandle<()>,
}

/// Emitted to the transport on state changes; the gateway crate translates
/// these into `approval:request` / `approval:resolved` wire messages.
#[derive(Debug, Clone)]
pub enum ApprovalEvent {
    Requested(ApprovalRequest),
    Resolved { approval_id: String, decision: ApprovalDecision },
}

pub struct ApprovalGate {
    pending: Arc<Mutex<HashMap<String, Pending>>>,
    /// Session-scoped `allow-always` remembers: (session_id, tool_name).
    remembered: Mutex<std::collections::HashSet<(String, String)>>,
    events_tx: tokio::sync::broadcast::Sender<ApprovalEvent>,
}

impl Default for ApprovalGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalGate {
    pub fn new() -> Self {
        let (events_tx, _) = tokio::sync::broadcast::channel(64);
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            remembered: Mutex::new(Default::default()),
            events_tx,
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ApprovalEvent> {
        self.events_tx.subscribe()
    }

    pub async fn has_pending(&self) -> bool {
        !self.pending.lock().await.is_empty()
    }

    /// `allow-always` recorded previously for this session/tool combination.
    pub async fn is_remembered(&self, session_id: &str, tool_name: &str) -> bool {
        self.remembered
            .lock()
            .await
            .contains(&(session_id.to_string(), tool_name.to_string()))
    }

    /// Drop every `allow-always` remember for a session (called on disconnect).
    pub async fn forget_session(&self, session_id: &str) {
        self.remembered.lock().await.retain(|(s, _)| s != session_id);
    }

    /// Deny and remove every pending request belonging to `session_id`
    /// (called on client disconnect, per §5).
    pub async fn deny_session(&self, session_id_prefix: &str) {
        let ids: Vec<String> = {
            let pending = self.pending.lock().await;
            pending
                .iter()
                .filter(|(id, _)| id.starts_with(session_id_prefix))
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.resolve(&id, ApprovalDecision::Deny, None).await;
        }
    }

    pub async fn request_approval(
        &self,
        id: impl Into<String>,
        tool_name: impl Into<String>,
        description: impl Into<String>,
        reason: ApprovalReason,
        args: serde_json::Value,
        ttl: Duration,
    ) -> oneshot::Receiver<bool> {
        let id = id.into();
        let request = ApprovalRequest {
            id: id.clone(),
            tool_name: tool_name.into(),
            description: description.into(),
            reason,
            args,
            expires_at_ms: (std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                + ttl)
                .as_millis() as u64,
        };
        let _ = self.events_tx.send(ApprovalEvent::Requested(request.clone()));

        let (tx, rx) = oneshot::channel();
        let pending_ref = self.pending.clone();
        let events_tx = self.events_tx.clone();
        let expiry_id = id.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let entry = pending_ref.lock().await.remove(&expiry_id);
            if let Some(entry) = entry {
                if let Some(responder) = entry.responder {
                    let _ = responder.send(false);
                }
                let _ = events_tx.send(ApprovalEvent::Resolved {
                    approval_id: expiry_id,
                    decision: ApprovalDecision::Expired,
                });
            }
        });

        self.pending.lock().await.insert(
            id,
            Pending { request, responder: Some(tx), expiry },
        );
        rx
    }

    /// Resolve a pending request from a client decision, or internally
    /// (e.g. session disconnect) by passing `session_id = None`.
    pub async fn resolve(&self, approval_id: &str, decision: ApprovalDecision, session_id: Option<&str>) {
        let entry = self.pending.lock().await.remove(approval_id);
        let Some(mut entry) = entry else { return };
        entry.expiry.abort();
        let allow = matches!(decision, ApprovalDecision::AllowOnce | ApprovalDecision::AllowAlways);
        if decision == ApprovalDecision::AllowAlways {
            if let Some(session_id) = session_id {
                self.remembered
                    .lock()
                    .await
                    .insert((session_id.to_string(), entry.request.tool_name.clone()));
            }
        }
        if let Some(responder) = entry.responder.take() {
            let _ = responder.send(allow);
        }
        let _ = self.events_tx.send(ApprovalEvent::Resolved { approval_id: approval_id.to_string(), decision });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn has_pending_false_initially() {
        let gate = ApprovalGate::new();
        assert!(!gate.has_pending().await);
    }

    #[tokio::test]
    async fn request_then_allow_once_resolves_true() {
        let gate = ApprovalGate::new();
        let rx = gate
            .request_approval("a1", "shell", "run rm", ApprovalReason::Destructive, serde_json::json!({}), Duration::from_secs(5))
            .await;
        assert!(gate.has_pending().await);
        gate.resolve("a1", ApprovalDecision::AllowOnce, Some("sess1")).await;
        assert!(rx.await.unwrap());
        assert!(!gate.has_pending().await);
    }

    #[tokio::test]
    async fn request_then_deny_resolves_false() {
        let gate = ApprovalGate::new();
        let rx = gate
            .request_approval("a2", "shell", "run rm", ApprovalReason::Destructive, serde_json::json!({}), Duration::from_secs(5))
            .await;
        gate.resolve("a2", ApprovalDecision::Deny, Some("sess1")).await;
        assert!(!rx.await.unwrap());
    }

    #[tokio::test]
    async fn expiry_resolves_as_deny() {
        let gate = ApprovalGate::new();
        let rx = gate
            .request_approval("a3", "shell", "run rm", ApprovalReason::Destructive, serde_json::json!({}), Duration::from_millis(20))
            .await;
        let allowed = rx.await.unwrap();
        assert!(!allowed);
        assert!(!gate.has_pending().await);
    }

    #[tokio::test]
    async fn allow_always_is_remembered_for_session() {
        let gate = ApprovalGate::new();
        let rx = gate
            .request_approval("a4", "shell", "run rm", ApprovalReason::Destructive, serde_json::json!({}), Duration::from_secs(5))
            .await;
        gate.resolve("a4", ApprovalDecision::AllowAlways, Some("sess1")).await;
        rx.await.unwrap();
        assert!(gate.is_remembered("sess1", "shell").await);
        assert!(!gate.is_remembered("sess2", "shell").await);
    }

    #[tokio::test]
    async fn forget_session_clears_remembers() {
        let gate = ApprovalGate::new();
        let rx = gate
            .request_approval("a5", "shell", "d", ApprovalReason::Destructive, serde_json::json!({}), Duration::from_secs(5))
            .await;
        gate.resolve("a5", ApprovalDecision::AllowAlways, Some("sess1")).await;
        rx.await.unwrap();
        gate.forget_session("sess1").await;
        assert!(!gate.is_remembered("sess1", "shell").await);
    }

    #[tokio::test]
    async fn flag_registry_defaults_to_no_approval_needed() {
        let reg = ToolFlagRegistry::new();
        let flags = reg.get("read_file").await;
        assert!(!flags.needs_approval());
    }

    #[tokio::test]
    async fn flag_registry_honors_set_flags() {
        let reg = ToolFlagRegistry::new();
        reg.set("shell", ToolFlags { destructive: true, intrusive: false }).await;
        assert!(reg.get("shell").await.needs_approval());
    }
}
