// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Binds a client chat request to the router, approval gate, and lane
//! queue, and emits events for the transport adapter to translate into
//! wire messages.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use nimbus_config::ModelCandidate;
use tokio::sync::Mutex;

use crate::events::AgentEvent;
use crate::heartbeat::Heartbeat;
use crate::lanes::{LaneQueue, DEFAULT_LANE};
use crate::prompts::Tier;
use crate::router::{CognitiveRouter, TurnOutcome};
use crate::session::Session;

pub struct ChatRequest {
    pub request_id: String,
    pub client_id: Option<String>,
    pub content: String,
    pub forced_tier: Option<Tier>,
    /// Pins the request to a specific lane instead of deriving one from
    /// `client_id`. Used by the cron scheduler to route synthetic prompts
    /// onto the `cron` lane so they never race a live user turn.
    pub lane_override: Option<String>,
}

fn lane_for(client_id: Option<&str>) -> String {
    match client_id {
        Some(id) => format!("session:{id}"),
        None => DEFAULT_LANE.to_string(),
    }
}

/// Owns per-session conversation state and wires a request through the
/// lane queue, the heartbeat's thinking flag, and the router.
pub struct ChatHandler {
    lanes: Arc<LaneQueue>,
    heartbeat: Arc<Heartbeat>,
    router: Arc<CognitiveRouter>,
    sessions: Mutex<HashMap<String, Session>>,
    max_tokens: usize,
    lane_warn_after: Duration,
}

impl ChatHandler {
    pub fn new(lanes: Arc<LaneQueue>, heartbeat: Arc<Heartbeat>, router: Arc<CognitiveRouter>, max_tokens: usize) -> Self {
        Self {
            lanes,
            heartbeat,
            router,
            sessions: Mutex::new(HashMap::new()),
            max_tokens,
            lane_warn_after: Duration::from_millis(2000),
        }
    }

    async fn session_history(&self, session_key: &str) -> Vec<nimbus_model::Message> {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_key.to_string())
            .or_insert_with(|| Session::new(self.max_tokens))
            .messages
            .clone()
    }

    async fn save_history(&self, session_key: &str, messages: Vec<nimbus_model::Message>) {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(session_key.to_string())
            .or_insert_with(|| Session::new(self.max_tokens))
            .replace_messages(messages);
    }

    /// Handle one inbound `chat:request`: enqueue on the session's lane,
    /// flip `thinking` for the heartbeat's duration, run the router, and
    /// guarantee `thinking` is cleared even on error.
    pub async fn handle(
        &self,
        request: ChatRequest,
        candidates: (ModelCandidate, Vec<ModelCandidate>),
        lane_max_concurrent: usize,
        emit: impl Fn(AgentEvent) + Send + Sync + 'static,
    ) -> anyhow::Result<TurnOutcome> {
        let lane = request
            .lane_override
            .clone()
            .unwrap_or_else(|| lane_for(request.client_id.as_deref()));
        let session_key = lane.clone();
        let router = self.router.clone();
        let heartbeat = self.heartbeat.clone();
        let request_id = request.request_id.clone();
        let content = request.content.clone();
        let forced_tier = request.forced_tier;
        let mut history = self.session_history(&session_key).await;
        let session_key_for_turn = session_key.clone();

        heartbeat.set_thinking(true);
        let run_result = self
            .lanes
            .enqueue(&lane, lane_max_concurrent, self.lane_warn_after, async move {
                let tier = crate::router::select_tier(forced_tier, &content, &history, router.config.tier2_threshold as usize);
                let outcome = router
                    .run_turn(
                        &request_id,
                        session_key_for_turn.as_str(),
                        tier,
                        &candidates,
                        "",
                        &mut history,
                        &content,
                        |event| emit(event),
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(serde_json::to_string(&(outcome, history)).unwrap_or_default())
            })
            .await;
        heartbeat.set_thinking(false);

        match run_result {
            Ok(serialized) => {
                let (outcome, history): (TurnOutcome, Vec<nimbus_model::Message>) =
                    serde_json::from_str(&serialized).map_err(|e| anyhow::anyhow!(e))?;
                self.save_history(&session_key, history).await;
                Ok(outcome)
            }
            Err(e) => Err(anyhow::anyhow!(e.to_string())),
        }
    }

    /// Called on client disconnect: clear the session lane and release
    /// any approvals belonging to it (treated as denial).
    pub async fn on_disconnect(&self, client_id: &str, approvals: &crate::approval::ApprovalGate) {
        let lane = lane_for(Some(client_id));
        self.lanes.clear_lane(&lane).await;
        approvals.deny_session(&format!("{lane}:")).await;
        approvals.forget_session(&lane).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalGate;
    use crate::heavy_task::HeavyTaskQueue;
    use crate::memory::InMemoryMemory;
    use crate::router::DefaultProviderFactory;
    use nimbus_config::RouterConfig;
    use std::sync::Arc as StdArc;

    fn candidate(name: &str) -> ModelCandidate {
        ModelCandidate { provider: "mock".into(), name: name.into(), api_key_env: None, base_url: None, max_tokens: 4096 }
    }

    async fn test_handler() -> ChatHandler {
        let lanes = StdArc::new(LaneQueue::new());
        let approvals = StdArc::new(ApprovalGate::new());
        let heavy = StdArc::new(HeavyTaskQueue::new());
        let heartbeat = StdArc::new(Heartbeat::new(
            18080,
            lanes.clone(),
            approvals.clone(),
            heavy,
            Duration::from_secs(1),
            Duration::from_secs(3),
            true,
        ));
        let registry = StdArc::new(nimbus_tools::ToolRegistry::new());
        let flags = StdArc::new(crate::approval::ToolFlagRegistry::new());
        let memory = StdArc::new(InMemoryMemory::new());
        let factory = StdArc::new(DefaultProviderFactory);
        let router = StdArc::new(CognitiveRouter::new(
            registry,
            flags,
            approvals,
            memory,
            factory,
            RouterConfig::default(),
            Duration::from_secs(120),
        ));
        ChatHandler::new(lanes, heartbeat, router, 32_000)
    }

    #[tokio::test]
    async fn handle_runs_turn_and_saves_history() {
        let handler = test_handler().await;
        let request = ChatRequest {
            request_id: "r1".into(),
            client_id: Some("c1".into()),
            content: "hello".into(),
            forced_tier: Some(Tier::Tier1),
            lane_override: None,
        };
        let outcome = handler
            .handle(request, (candidate("tier1-mock"), vec![]), 1, |_e| {})
            .await
            .unwrap();
        assert_eq!(outcome.tier, "tier1");
        let history = handler.session_history("session:c1").await;
        assert!(!history.is_empty());
    }
}
