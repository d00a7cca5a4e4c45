// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! In-memory FIFO queue for CPU-bound background work, drained one task at
//! a time by the heartbeat's worker-tick so it never blocks the interactive lane.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use nimbus_model::ModelProvider;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeavyTaskType {
    DistillMemory,
    DeepAnalysis,
    CodeReview,
    General,
}

impl Default for HeavyTaskType {
    fn default() -> Self {
        Self::General
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeavyTaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeavyTask {
    pub id: String,
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub task_type: HeavyTaskType,
    pub status: HeavyTaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

pub enum WorkerOutcome {
    Completed(String),
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct WorkerStatus {
    pub enabled: bool,
    pub model: Option<String>,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

struct State {
    tasks: VecDeque<HeavyTask>,
    running: bool,
}

/// FIFO heavy-task queue. `worker` is the worker-engine backend (out of
/// scope for this crate's interface — any [`ModelProvider`] works, including
/// the mock one used in tests).
pub struct HeavyTaskQueue {
    state: Mutex<State>,
    next_id: AtomicU64,
    worker: Mutex<Option<Box<dyn ModelProvider>>>,
}

impl Default for HeavyTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl HeavyTaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State { tasks: VecDeque::new(), running: false }),
            next_id: AtomicU64::new(1),
            worker: Mutex::new(None),
        }
    }

    pub async fn set_worker(&self, worker: Box<dyn ModelProvider>) {
        *self.worker.lock().await = Some(worker);
    }

    pub async fn enqueue(&self, description: impl Into<String>, prompt: impl Into<String>, task_type: HeavyTaskType) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let id = format!("heavy-{n}-{timestamp}");
        let task = HeavyTask {
            id: id.clone(),
            description: description.into(),
            prompt: prompt.into(),
            task_type,
            status: HeavyTaskStatus::Pending,
            result: None,
            error: None,
        };
        self.state.lock().await.tasks.push_back(task);
        id
    }

    /// Pop the first `pending` task and mark it `running`. At most one task
    /// is ever dequeued while another is in flight (guarded by `running`).
    pub async fn dequeue(&self) -> Option<HeavyTask> {
        let mut state = self.state.lock().await;
        if state.running {
            return None;
        }
        let idx = state.tasks.iter().position(|t| t.status == HeavyTaskStatus::Pending)?;
        state.tasks[idx].status = HeavyTaskStatus::Running;
        state.running = true;
        Some(state.tasks[idx].clone())
    }

    async fn complete(&self, id: &str, result: String) {
        let mut state = self.state.lock().await;
        if let Some(t) = state.tasks.iter_mut().find(|t| t.id == id) {
            t.status = HeavyTaskStatus::Completed;
            t.result = Some(result);
        }
        state.running = false;
    }

    async fn fail(&self, id: &str, error: String) {
        let mut state = self.state.lock().await;
        if let Some(t) = state.tasks.iter_mut().find(|t| t.id == id) {
            t.status = HeavyTaskStatus::Failed;
            t.error = Some(error);
        }
        state.running = false;
    }

    /// Run the worker-engine backend for a dequeued task and record its outcome.
    pub async fn run_worker(&self, task: &HeavyTask) -> WorkerOutcome {
        let worker = self.worker.lock().await;
        let Some(worker) = worker.as_ref() else {
            drop(worker);
            self.fail(&task.id, "no worker backend configured".into()).await;
            return WorkerOutcome::Failed("no worker backend configured".into());
        };
        let req = nimbus_model::CompletionRequest {
            messages: vec![nimbus_model::Message::user(task.prompt.clone())],
            ..Default::default()
        };
        let result = run_to_completion(worker.as_ref(), req).await;
        drop(worker);
        match result {
            Ok(text) => {
                self.complete(&task.id, text.clone()).await;
                WorkerOutcome::Completed(text)
            }
            Err(e) => {
                let msg = e.to_string();
                self.fail(&task.id, msg.clone()).await;
                WorkerOutcome::Failed(msg)
            }
        }
    }

    pub async fn has_pending(&self) -> bool {
        self.state.lock().await.tasks.iter().any(|t| t.status == HeavyTaskStatus::Pending)
    }

    pub async fn has_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn status(&self) -> WorkerStatus {
        let state = self.state.lock().await;
        let mut status = WorkerStatus::default();
        for t in &state.tasks {
            match t.status {
                HeavyTaskStatus::Pending => status.pending += 1,
                HeavyTaskStatus::Running => status.running += 1,
                HeavyTaskStatus::Completed => status.completed += 1,
                HeavyTaskStatus::Failed => status.failed += 1,
            }
        }
        drop(state);
        let worker = self.worker.lock().await;
        status.enabled = worker.is_some();
        status.model = worker.as_ref().map(|w| w.model_name().to_string());
        status
    }

    /// Drop every task in a terminal state (`completed` or `failed`).
    pub async fn prune(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.tasks.len();
        state.tasks.retain(|t| !matches!(t.status, HeavyTaskStatus::Completed | HeavyTaskStatus::Failed));
        before - state.tasks.len()
    }
}

async fn run_to_completion(provider: &dyn ModelProvider, req: nimbus_model::CompletionRequest) -> anyhow::Result<String> {
    use futures::StreamExt;
    let mut stream = provider.complete(req).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            nimbus_model::ResponseEvent::TextDelta(chunk) => text.push_str(&chunk),
            nimbus_model::ResponseEvent::Done => break,
            nimbus_model::ResponseEvent::Error(e) => anyhow::bail!(e),
            _ => {}
        }
    }
    Ok(text)
}
