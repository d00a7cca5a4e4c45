// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Aggregates subsystem signals into a single `DaemonState` and broadcasts
//! telemetry at a fixed interval, with change-suppression. A second,
//! coarser tick drains the heavy-task queue one task at a time.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::approval::ApprovalGate;
use crate::heavy_task::{HeavyTaskQueue, WorkerOutcome};
use crate::lanes::LaneQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DaemonState {
    Idle,
    Thinking,
    ExecutingTool,
    BlockedWaitingUser,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub state: DaemonState,
    pub active_tasks: usize,
    pub pending_tasks: usize,
    pub awaiting_approval: bool,
    pub connected_clients: usize,
    pub worker_enabled: bool,
    pub worker_model: Option<String>,
    pub worker_pending: usize,
    pub worker_running: usize,
    pub worker_completed: usize,
    pub worker_failed: usize,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMessage {
    pub uptime_ms: u64,
    pub pid: u32,
    pub port: u16,
    pub snapshot: StateSnapshot,
    pub tick: u64,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    TaskCompleted { task_id: String, description: String, result_len: usize },
    TaskFailed { task_id: String, description: String, error: String },
}

/// Computes the precedence ordering from §3: `BLOCKED_WAITING_USER` beats
/// `THINKING` beats `EXECUTING_TOOL` beats `IDLE`.
pub fn compute_state(thinking: bool, active_tasks: usize, awaiting_approval: bool) -> DaemonState {
    if awaiting_approval {
        DaemonState::BlockedWaitingUser
    } else if thinking {
        DaemonState::Thinking
    } else if active_tasks > 0 {
        DaemonState::ExecutingTool
    } else {
        DaemonState::Idle
    }
}

struct Shared {
    thinking: AtomicBool,
    connected_clients: AtomicU64,
    port: u16,
    pid: u32,
    started_at: std::time::Instant,
    tick: AtomicU64,
    last_snapshot: Mutex<Option<StateSnapshot>>,
}

/// Owns the heartbeat/worker-tick loops for one daemon instance.
pub struct Heartbeat {
    shared: Arc<Shared>,
    lanes: Arc<LaneQueue>,
    approvals: Arc<ApprovalGate>,
    heavy: Arc<HeavyTaskQueue>,
    heartbeat_tx: broadcast::Sender<HeartbeatMessage>,
    worker_tx: broadcast::Sender<WorkerEvent>,
    suppress_unchanged: bool,
    interval: Duration,
    worker_tick: Duration,
    running: Mutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl Heartbeat {
    pub fn new(
        port: u16,
        lanes: Arc<LaneQueue>,
        approvals: Arc<ApprovalGate>,
        heavy: Arc<HeavyTaskQueue>,
        interval: Duration,
        worker_tick: Duration,
        suppress_unchanged: bool,
    ) -> Self {
        let (heartbeat_tx, _) = broadcast::channel(64);
        let (worker_tx, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                thinking: AtomicBool::new(false),
                connected_clients: AtomicU64::new(0),
                port,
                pid: std::process::id(),
                started_at: std::time::Instant::now(),
                tick: AtomicU64::new(0),
                last_snapshot: Mutex::new(None),
            }),
            lanes,
            approvals,
            heavy,
            heartbeat_tx,
            worker_tx,
            suppress_unchanged,
            interval,
            worker_tick,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe_heartbeat(&self) -> broadcast::Receiver<HeartbeatMessage> {
        self.heartbeat_tx.subscribe()
    }

    pub fn subscribe_worker(&self) -> broadcast::Receiver<WorkerEvent> {
        self.worker_tx.subscribe()
    }

    pub fn set_thinking(&self, active: bool) {
        self.shared.thinking.store(active, Ordering::SeqCst);
    }

    pub fn client_connected(&self) {
        self.shared.connected_clients.fetch_add(1, Ordering::SeqCst);
    }

    pub fn client_disconnected(&self) {
        self.shared.connected_clients.fetch_sub(1, Ordering::SeqCst);
    }

    async fn snapshot(&self) -> StateSnapshot {
        let active = self.lanes.active_count().await;
        let pending = self.lanes.total_size().await;
        let awaiting_approval = self.approvals.has_pending().await;
        let thinking = self.shared.thinking.load(Ordering::SeqCst);
        let worker_status = self.heavy.status().await;
        StateSnapshot {
            state: compute_state(thinking, active, awaiting_approval),
            active_tasks: active,
            pending_tasks: pending,
            awaiting_approval,
            connected_clients: self.shared.connected_clients.load(Ordering::SeqCst) as usize,
            worker_enabled: worker_status.enabled,
            worker_model: worker_status.model,
            worker_pending: worker_status.pending,
            worker_running: worker_status.running,
            worker_completed: worker_status.completed,
            worker_failed: worker_status.failed,
        }
    }

    /// Starts the heartbeat and worker-tick loops. Idempotent: calling
    /// `start` twice while already running is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return;
        }
        let hb = self.clone();
        let heartbeat_handle = tokio::spawn(async move { hb.heartbeat_loop().await });
        let w = self.clone();
        let worker_handle = tokio::spawn(async move { w.worker_loop().await });
        *running = Some((heartbeat_handle, worker_handle));
    }

    pub async fn stop(&self) {
        if let Some((h, w)) = self.running.lock().await.take() {
            h.abort();
            w.abort();
        }
    }

    async fn heartbeat_loop(&self) {
        let mut interval = tokio::time::interval(self.interval);
        loop {
            interval.tick().await;
            let tick = self.shared.tick.fetch_add(1, Ordering::SeqCst) + 1;
            let snapshot = self.snapshot().await;
            let mut last = self.shared.last_snapshot.lock().await;
            if self.suppress_unchanged && last.as_ref() == Some(&snapshot) {
                continue;
            }
            *last = Some(snapshot.clone());
            drop(last);
            let msg = HeartbeatMessage {
                uptime_ms: self.shared.started_at.elapsed().as_millis() as u64,
                pid: self.shared.pid,
                port: self.shared.port,
                snapshot,
                tick,
            };
            let _ = self.heartbeat_tx.send(msg);
        }
    }

    async fn worker_loop(&self) {
        let mut interval = tokio::time::interval(self.worker_tick);
        loop {
            interval.tick().await;
            let Some(task) = self.heavy.dequeue().await else { continue };
            let id = task.id.clone();
            let desc = task.description.clone();
            match self.heavy.run_worker(&task).await {
                WorkerOutcome::Completed(result) => {
                    let _ = self.worker_tx.send(WorkerEvent::TaskCompleted {
                        task_id: id,
                        description: desc,
                        result_len: result.len(),
                    });
                }
                WorkerOutcome::Failed(error) => {
                    let _ = self.worker_tx.send(WorkerEvent::TaskFailed {
                        task_id: id,
                        description: desc,
                        error,
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence_blocked_beats_everything() {
        assert_eq!(compute_state(true, 5, true), DaemonState::BlockedWaitingUser);
    }

    #[test]
    fn precedence_thinking_beats_executing() {
        assert_eq!(compute_state(true, 2, false), DaemonState::Thinking);
    }

    #[test]
    fn precedence_executing_when_active_tasks() {
        assert_eq!(compute_state(false, 1, false), DaemonState::ExecutingTool);
    }

    #[test]
    fn precedence_idle_when_nothing_happening() {
        assert_eq!(compute_state(false, 0, false), DaemonState::Idle);
    }

    #[tokio::test]
    async fn start_twice_is_idempotent() {
        let lanes = Arc::new(LaneQueue::new());
        let approvals = Arc::new(ApprovalGate::new());
        let heavy = Arc::new(HeavyTaskQueue::new());
        let hb = Arc::new(Heartbeat::new(
            18080,
            lanes,
            approvals,
            heavy,
            Duration::from_millis(20),
            Duration::from_millis(50),
            true,
        ));
        hb.start().await;
        hb.start().await;
        assert!(hb.running.lock().await.is_some());
        hb.stop().await;
    }

    #[tokio::test]
    async fn suppression_skips_identical_snapshots() {
        let lanes = Arc::new(LaneQueue::new());
        let approvals = Arc::new(ApprovalGate::new());
        let heavy = Arc::new(HeavyTaskQueue::new());
        let hb = Arc::new(Heartbeat::new(
            18080,
            lanes,
            approvals,
            heavy,
            Duration::from_millis(15),
            Duration::from_secs(10),
            true,
        ));
        let mut rx = hb.subscribe_heartbeat();
        hb.start().await;
        let first = rx.recv().await.unwrap();
        assert_eq!(first.tick, 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
        hb.set_thinking(true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let changed = rx.recv().await.unwrap();
        assert_eq!(changed.snapshot.state, DaemonState::Thinking);
        hb.stop().await;
    }

    #[tokio::test]
    async fn tick_counter_is_monotonic() {
        let lanes = Arc::new(LaneQueue::new());
        let approvals = Arc::new(ApprovalGate::new());
        let heavy = Arc::new(HeavyTaskQueue::new());
        let hb = Arc::new(Heartbeat::new(
            18080,
            lanes,
            approvals,
            heavy,
            Duration::from_millis(10),
            Duration::from_secs(10),
            false,
        ));
        let mut rx = hb.subscribe_heartbeat();
        hb.start().await;
        let a = rx.recv().await.unwrap().tick;
        let b = rx.recv().await.unwrap().tick;
        assert!(a < b);
        hb.stop().await;
    }
}
