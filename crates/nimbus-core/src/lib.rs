// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod approval;
mod chat_handler;
mod events;
mod heartbeat;
mod heavy_task;
mod lanes;
mod memory;
mod prompts;
mod repair;
mod retry;
mod router;
mod session;

pub use approval::{ApprovalDecision, ApprovalEvent, ApprovalGate, ApprovalReason, ApprovalRequest, ToolFlagRegistry, ToolFlags};
pub use chat_handler::{ChatHandler, ChatRequest};
pub use events::AgentEvent;
pub use heartbeat::{DaemonState, Heartbeat, HeartbeatMessage, StateSnapshot, WorkerEvent};
pub use heavy_task::{HeavyTask, HeavyTaskQueue, HeavyTaskStatus, HeavyTaskType, WorkerOutcome, WorkerStatus};
pub use lanes::{LaneQueue, LaneQueueError, DEFAULT_LANE};
pub use memory::{auto_rag_prepend, distill_wisdom, InMemoryMemory, MemoryChunk, MemoryInterface, WISDOM_CATEGORY};
pub use prompts::{build_prompt, PromptBuilder, Tier, ToolSummary};
pub use repair::{repair_transcript, smart_truncate, RepairReport};
pub use retry::{is_retryable, CooldownMap, FallbackOutcome, RetryPolicy};
pub use router::{score_prompt, select_tier, CognitiveRouter, DefaultProviderFactory, ProviderFactory, TurnOutcome};
pub use session::{Session, TurnRecord};
