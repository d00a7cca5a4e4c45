// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Per-tier backend selection, prompt assembly, streaming, tool-call
//! bridging, Auto-RAG pre-injection, and post-stream wisdom distillation.
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use nimbus_config::{ModelCandidate, RouterConfig};
use nimbus_model::{CompletionRequest, Message, ModelProvider, ResponseEvent};
use nimbus_tools::{ToolCall, ToolRegistry};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalReason, ToolFlagRegistry};
use crate::events::AgentEvent;
use crate::memory::{self, MemoryInterface};
use crate::prompts::{self, Tier, ToolSummary};
use crate::repair;
use crate::retry::{self, CooldownMap, RetryPolicy};

pub const DEFAULT_STEPWISE_CAP: usize = 5;

/// Coding/infrastructure and analytical keyword lists used by the tier heuristic.
const CODE_KEYWORDS: &[&str] = &["function", "code", "bug", "compile", "rust", "python", "refactor", "stack trace", "error:"];
const ANALYTICAL_KEYWORDS: &[&str] = &["analyze", "compare", "explain why", "trade-off", "architecture", "design"];

/// Resolve the backend constructor for a provider string. The only bundled
/// provider is `mock`; real providers are external, pluggable `ModelProvider`
/// implementations supplied by the caller through [`ProviderFactory`].
pub trait ProviderFactory: Send + Sync {
    fn build(&self, candidate: &ModelCandidate) -> anyhow::Result<Box<dyn ModelProvider>>;
}

pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn build(&self, candidate: &ModelCandidate) -> anyhow::Result<Box<dyn ModelProvider>> {
        nimbus_model::from_candidate(candidate)
    }
}

/// Score the raw prompt and recent history to decide tier1 vs tier2.
/// Score ≥ `threshold` routes to tier2; otherwise tier1.
pub fn score_prompt(prompt: &str, recent_history: &[Message], threshold: usize) -> usize {
    let mut score = 0usize;
    if prompt.len() > 200 {
        score += 1;
    }
    let lower = prompt.to_lowercase();
    if CODE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 2;
    }
    if ANALYTICAL_KEYWORDS.iter().any(|k| lower.contains(k)) {
        score += 2;
    }
    let has_code_or_tool_markers = recent_history.iter().rev().take(4).any(|m| {
        m.as_text().is_some_and(|t| t.contains("```"))
            || matches!(m.content, nimbus_model::MessageContent::ToolResult { .. })
    });
    if has_code_or_tool_markers {
        score += 1;
    }
    let _ = threshold;
    score
}

pub fn select_tier(forced: Option<Tier>, prompt: &str, recent_history: &[Message], threshold: usize) -> Tier {
    if let Some(tier) = forced {
        return tier;
    }
    if score_prompt(prompt, recent_history, threshold) >= threshold {
        Tier::Tier2
    } else {
        Tier::Tier1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnOutcome {
    pub request_id: String,
    pub full_text: String,
    pub tier: String,
    pub model: String,
}

/// Ties together tool registry, flags, approvals, memory, and per-tier
/// model candidates for one daemon instance.
pub struct CognitiveRouter {
    pub tools: Arc<ToolRegistry>,
    pub flags: Arc<ToolFlagRegistry>,
    pub approvals: Arc<ApprovalGate>,
    pub memory: Arc<dyn MemoryInterface>,
    pub factory: Arc<dyn ProviderFactory>,
    pub config: RouterConfig,
    pub approval_ttl: Duration,
    cooldowns: Mutex<CooldownMap>,
}

impl CognitiveRouter {
    pub fn new(
        tools: Arc<ToolRegistry>,
        flags: Arc<ToolFlagRegistry>,
        approvals: Arc<ApprovalGate>,
        memory: Arc<dyn MemoryInterface>,
        factory: Arc<dyn ProviderFactory>,
        config: RouterConfig,
        approval_ttl: Duration,
    ) -> Self {
        Self { tools, flags, approvals, memory, factory, config, approval_ttl, cooldowns: Mutex::new(CooldownMap::new()) }
    }

    fn tool_summaries(&self) -> Vec<ToolSummary> {
        self.tools
            .schemas()
            .into_iter()
            .map(|s| ToolSummary { name: s.name, description: s.description })
            .collect()
    }

    async fn assemble_prompt(&self, tier: Tier, core_memory: &str) -> String {
        let wisdom = self
            .memory
            .search_memory(memory::WISDOM_CATEGORY, "", 5)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.content)
            .collect::<Vec<_>>();
        let categories = self.memory.cognitive_map().await.unwrap_or_default();
        let pb = prompts::build_prompt(
            tier,
            core_memory,
            self.config.core_memory_token_cap,
            &self.tool_summaries(),
            &wisdom,
            &categories,
        );
        pb.render()
    }

    /// Run one turn: assemble the prompt, Auto-RAG the user message, stream
    /// the backend response (with fallback+retry), bridge tool calls through
    /// the approval gate, and forward every event via `emit`.
    pub async fn run_turn(
        &self,
        request_id: &str,
        session_id: &str,
        tier: Tier,
        candidates: &(ModelCandidate, Vec<ModelCandidate>),
        core_memory: &str,
        history: &mut Vec<Message>,
        user_message: &str,
        mut emit: impl FnMut(AgentEvent),
    ) -> anyhow::Result<TurnOutcome> {
        let augmented = memory::auto_rag_prepend(
            self.memory.as_ref(),
            user_message,
            self.config.auto_rag_top_k,
            self.config.auto_rag_top_n,
        )
        .await;

        let system_prompt = self.assemble_prompt(tier, core_memory).await;
        history.push(Message::user(augmented));

        let mut full_text = String::new();
        let mut any_tool_called = false;
        let mut steps = 0usize;
        let (primary, fallbacks) = candidates;

        let mut final_provider_info = (String::new(), String::new());
        loop {
            steps += 1;
            if steps > (self.config.stepwise_cap.max(1) as usize) {
                emit(AgentEvent::Error("stepwise tool-call cap reached".into()));
                break;
            }

            let (stripped, _, repair_report) = repair::repair_transcript(
                history.clone(),
                3000,
                |name| self.tools.output_category(name),
            );
            if repair_report.synthesized > 0 || repair_report.dropped_orphans > 0 {
                emit(AgentEvent::ContextCompacted {
                    tokens_before: history.len(),
                    tokens_after: stripped.len(),
                });
            }
            *history = stripped;

            let mut messages = vec![Message::system(system_prompt.clone())];
            messages.extend(history.iter().cloned());

            let req = CompletionRequest {
                messages,
                tools: self.tools.schemas().into_iter().map(|s| nimbus_model::ToolSchema {
                    name: s.name,
                    description: s.description,
                    parameters: s.parameters,
                }).collect(),
                stream: true,
                system_dynamic_suffix: None,
            };

            let mut cooldowns = self.cooldowns.lock().await;
            let policy = RetryPolicy::default();
            let factory = self.factory.clone();
            let req_for_attempt = req.clone();
            let outcome = retry::run_with_model_fallback(
                primary,
                fallbacks,
                &mut cooldowns,
                &policy,
                move |candidate| {
                    let factory = factory.clone();
                    let req = req_for_attempt.clone();
                    let candidate = candidate.clone();
                    async move {
                        let provider = factory.build(&candidate)?;
                        let mut stream = provider.complete(req).await?;
                        let mut text = String::new();
                        let mut tool_calls: Vec<ToolCall> = Vec::new();
                        while let Some(event) = stream.next().await {
                            match event? {
                                ResponseEvent::TextDelta(d) => text.push_str(&d),
                                ResponseEvent::ToolCall { id, name, arguments } => {
                                    let args = serde_json::from_str(&arguments).unwrap_or(serde_json::Value::Null);
                                    tool_calls.push(ToolCall { id, name, args });
                                }
                                ResponseEvent::ThinkingDelta(_) => {}
                                ResponseEvent::Usage { .. } => {}
                                ResponseEvent::Done => break,
                                ResponseEvent::Error(e) => anyhow::bail!(e),
                            }
                        }
                        Ok::<_, anyhow::Error>((text, tool_calls))
                    }
                },
            )
            .await?;
            drop(cooldowns);

            let (text, tool_calls) = outcome.result;
            final_provider_info = (outcome.provider.clone(), outcome.model.clone());

            if !text.is_empty() {
                emit(AgentEvent::TextDelta(text.clone()));
                full_text.push_str(&text);
            }
            if tool_calls.is_empty() {
                history.push(Message::assistant(full_text.clone()));
                break;
            }

            any_tool_called = true;
            for call in tool_calls {
                emit(AgentEvent::ToolCallStarted(call.clone()));
                history.push(Message {
                    role: nimbus_model::Role::Assistant,
                    content: nimbus_model::MessageContent::ToolCall {
                        tool_call_id: call.id.clone(),
                        function: nimbus_model::FunctionCall {
                            name: call.name.clone(),
                            arguments: call.args.to_string(),
                        },
                    },
                });

                let flags = self.flags.get(&call.name).await;
                let remembered = self.approvals.is_remembered(session_id, &call.name).await;
                let output = if flags.needs_approval() && !remembered {
                    let reason = if flags.destructive {
                        ApprovalReason::Destructive
                    } else {
                        ApprovalReason::Intrusive
                    };
                    let approval_id = format!("{session_id}:{}", call.id);
                    let rx = self
                        .approvals
                        .request_approval(
                            approval_id,
                            call.name.clone(),
                            format!("Run tool {}", call.name),
                            reason,
                            call.args.clone(),
                            self.approval_ttl,
                        )
                        .await;
                    let allowed = rx.await.unwrap_or(false);
                    if allowed {
                        self.tools.execute(&call).await
                    } else {
                        nimbus_tools::ToolOutput::err(&call.id, "tool call was denied by the user")
                    }
                } else {
                    self.tools.execute(&call).await
                };

                emit(AgentEvent::ToolCallFinished {
                    call_id: output.call_id.clone(),
                    tool_name: call.name.clone(),
                    output: output.content.clone(),
                    is_error: output.is_error,
                });
                history.push(Message::tool_result(output.call_id.clone(), output.content.clone()));
            }
        }

        emit(AgentEvent::TurnComplete);
        memory::distill_wisdom(self.memory.as_ref(), user_message, &full_text, any_tool_called, self.config.distillation_min_chars).await;

        Ok(TurnOutcome {
            request_id: request_id.to_string(),
            full_text,
            tier: match tier {
                Tier::Tier1 => "tier1".into(),
                Tier::Tier2 => "tier2".into(),
                Tier::Worker => "worker".into(),
            },
            model: final_provider_info.1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nimbus_config::ToolsConfig;
    use nimbus_tools::policy::ToolPolicy;

    fn candidate(provider: &str, name: &str) -> ModelCandidate {
        ModelCandidate {
            provider: provider.into(),
            name: name.into(),
            api_key_env: None,
            base_url: None,
            max_tokens: 4096,
        }
    }

    #[test]
    fn score_prompt_flags_long_prompts() {
        let long = "x".repeat(300);
        assert!(score_prompt(&long, &[], 100) >= 1);
    }

    #[test]
    fn score_prompt_flags_code_keywords() {
        let score = score_prompt("please fix this bug in the rust compile step", &[], 100);
        assert!(score >= 2);
    }

    #[test]
    fn select_tier_forced_ignores_heuristic() {
        assert_eq!(select_tier(Some(Tier::Tier2), "hi", &[], 0), Tier::Tier2);
    }

    #[test]
    fn select_tier_routes_low_score_to_tier1() {
        assert_eq!(select_tier(None, "hi", &[], 50), Tier::Tier1);
    }

    #[test]
    fn select_tier_routes_high_score_to_tier2() {
        let prompt = "please analyze and compare the architecture trade-off here and explain why";
        assert_eq!(select_tier(None, prompt, &[], 2), Tier::Tier2);
    }

    fn test_router() -> CognitiveRouter {
        let mut registry = ToolRegistry::new();
        registry.register(nimbus_tools::builtin::read_file::ReadFileTool);
        let tools = Arc::new(registry);
        let flags = Arc::new(ToolFlagRegistry::new());
        let approvals = Arc::new(ApprovalGate::new());
        let memory = Arc::new(memory::InMemoryMemory::new());
        let factory = Arc::new(DefaultProviderFactory);
        let _policy = ToolPolicy::from_config(&ToolsConfig::default());
        CognitiveRouter::new(tools, flags, approvals, memory, factory, RouterConfig::default(), Duration::from_secs(120))
    }

    #[tokio::test]
    async fn run_turn_with_mock_backend_completes_without_tool_calls() {
        let router = test_router();
        let mut history = Vec::new();
        let mut events = Vec::new();
        let primary = candidate("mock", "tier1-mock");
        let outcome = router
            .run_turn(
                "req1",
                "sess1",
                Tier::Tier1,
                &(primary, vec![]),
                "",
                &mut history,
                "hello there",
                |e| events.push(e),
            )
            .await
            .unwrap();
        assert_eq!(outcome.tier, "tier1");
        assert!(events.iter().any(|e| matches!(e, AgentEvent::TurnComplete)));
    }

    #[tokio::test]
    async fn run_turn_unknown_provider_errors() {
        let router = test_router();
        let mut history = Vec::new();
        let primary = candidate("nonexistent", "x");
        let result = router
            .run_turn("req2", "sess1", Tier::Tier1, &(primary, vec![]), "", &mut history, "hi", |_| {})
            .await;
        assert!(result.is_err());
    }
}
