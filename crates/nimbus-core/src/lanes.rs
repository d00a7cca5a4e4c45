// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Named serial-or-bounded-parallel work lanes.
//!
//! A lane is a FIFO of tasks with its own concurrency cap. Lanes run in
//! parallel with each other; within a lane, start order equals enqueue order.
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::warn;

pub const DEFAULT_LANE: &str = "main";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LaneQueueError {
    #[error("gateway is draining, no new work is accepted")]
    GatewayDraining,
    #[error("lane was cleared while this task was still queued")]
    LaneCleared,
    #[error("task failed: {0}")]
    TaskFailed(String),
}

type BoxedTask = Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

struct QueueEntry {
    id: u64,
    enqueued_at: Instant,
    warn_after: Duration,
    task: BoxedTask,
    responder: oneshot::Sender<Result<String, LaneQueueError>>,
}

struct Lane {
    queue: VecDeque<QueueEntry>,
    active: std::collections::HashSet<u64>,
    max_concurrent: usize,
    generation: u64,
    draining: bool,
}

impl Lane {
    fn new(max_concurrent: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            active: Default::default(),
            max_concurrent: max_concurrent.max(1),
            generation: 0,
            draining: false,
        }
    }
}

/// Owning value for every named lane in a daemon instance. No process-global
/// state: callers hold an `Arc<LaneQueue>` and pass it explicitly.
pub struct LaneQueue {
    lanes: Mutex<HashMap<String, Lane>>,
    next_id: AtomicU64,
    gateway_draining: std::sync::atomic::AtomicBool,
    notify: Notify,
}

impl Default for LaneQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LaneQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            gateway_draining: std::sync::atomic::AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn mark_gateway_draining(&self) {
        self.gateway_draining.store(true, Ordering::SeqCst);
    }

    /// Enqueue `task` on `lane`, returning its eventual result. `max_concurrent`
    /// is only consulted the first time a lane is created (lazily, on first
    /// enqueue); use [`Self::set_lane_concurrency`] to change it afterwards.
    pub async fn enqueue<F>(
        &self,
        lane: &str,
        max_concurrent: usize,
        warn_after: Duration,
        task: F,
    ) -> Result<String, LaneQueueError>
    where
        F: Future<Output = Result<String, String>> + Send + 'static,
    {
        if self.gateway_draining.load(Ordering::SeqCst) {
            return Err(LaneQueueError::GatewayDraining);
        }
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut lanes = self.lanes.lock().await;
            let entry = lanes
                .entry(lane.to_string())
                .or_insert_with(|| Lane::new(max_concurrent));
            entry.queue.push_back(QueueEntry {
                id,
                enqueued_at: Instant::now(),
                warn_after,
                task: Box::pin(task),
                responder: tx,
            });
        }
        self.pump(lane).await;
        rx.await.unwrap_or(Err(LaneQueueError::LaneCleared))
    }

    pub async fn enqueue_in_default<F>(
        &self,
        max_concurrent: usize,
        warn_after: Duration,
        task: F,
    ) -> Result<String, LaneQueueError>
    where
        F: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.enqueue(DEFAULT_LANE, max_concurrent, warn_after, task).await
    }

    /// Pump loop: while the lane has capacity and queued work, pop the head
    /// and spawn it. Guarded against reentrancy by the lane's `draining` flag
    /// (repurposed here as "a pump is already running for this lane").
    async fn pump(&self, lane: &str) {
        loop {
            let (entry, generation, max_concurrent) = {
                let mut lanes = self.lanes.lock().await;
                let Some(l) = lanes.get_mut(lane) else { return };
                if l.draining {
                    return;
                }
                if l.active.len() >= l.max_concurrent || l.queue.is_empty() {
                    return;
                }
                l.draining = true;
                let Some(entry) = l.queue.pop_front() else {
                    l.draining = false;
                    return;
                };
                l.active.insert(entry.id);
                l.draining = false;
                (entry, l.generation, l.max_concurrent)
            };

            let waited = entry.enqueued_at.elapsed();
            if waited >= entry.warn_after {
                warn!(lane, id = entry.id, waited_ms = waited.as_millis() as u64, "lane wait exceeded warn threshold");
            }

            let id = entry.id;
            let lane_name = lane.to_string();
            let lanes_ref: &Mutex<HashMap<String, Lane>> = &self.lanes;
            // Run inline: the pump owns the await point, tasks across lanes
            // still run concurrently because each lane's pump is invoked from
            // its own enqueue call without holding the lanes lock across it.
            let result = entry.task.await;
            {
                let mut lanes = lanes_ref.lock().await;
                if let Some(l) = lanes.get_mut(&lane_name) {
                    if l.generation == generation {
                        l.active.remove(&id);
                    }
                }
            }
            let _ = entry.responder.send(result.map_err(LaneQueueError::TaskFailed));
            let _ = max_concurrent;
        }
    }

    pub async fn clear_lane(&self, lane: &str) -> usize {
        let mut lanes = self.lanes.lock().await;
        let Some(l) = lanes.get_mut(lane) else { return 0 };
        let drained: Vec<_> = l.queue.drain(..).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.responder.send(Err(LaneQueueError::LaneCleared));
        }
        count
    }

    pub async fn size(&self, lane: &str) -> usize {
        self.lanes.lock().await.get(lane).map(|l| l.queue.len()).unwrap_or(0)
    }

    pub async fn total_size(&self) -> usize {
        self.lanes.lock().await.values().map(|l| l.queue.len()).sum()
    }

    pub async fn active_count(&self) -> usize {
        self.lanes.lock().await.values().map(|l| l.active.len()).sum()
    }

    pub async fn set_lane_concurrency(&self, lane: &str, n: usize) {
        {
            let mut lanes = self.lanes.lock().await;
            let entry = lanes.entry(lane.to_string()).or_insert_with(|| Lane::new(n));
            entry.max_concurrent = n.max(1);
        }
        self.pump(lane).await;
    }

    /// Clear `gatewayDraining`, bump every lane's generation, clear every
    /// `active` set, and re-pump any lane with queued work. Queued entries survive.
    pub async fn reset_all(&self) {
        self.gateway_draining.store(false, Ordering::SeqCst);
        let lane_names: Vec<String> = {
            let mut lanes = self.lanes.lock().await;
            for l in lanes.values_mut() {
                l.generation += 1;
                l.active.clear();
            }
            lanes.keys().cloned().collect()
        };
        for name in lane_names {
            self.pump(&name).await;
        }
        self.notify.notify_waiters();
    }

    /// Poll until no task remains active in `lane`, or `timeout` elapses.
    pub async fn wait_for_active(&self, lane: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let empty = self.lanes.lock().await.get(lane).map(|l| l.active.is_empty()).unwrap_or(true);
            if empty {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Poll until no task remains active in any lane, or `timeout` elapses.
    /// Used on shutdown, after [`Self::mark_gateway_draining`], to let
    /// in-flight turns finish rather than dropping them mid-run.
    pub async fn wait_for_all_active(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let empty = self.lanes.lock().await.values().all(|l| l.active.is_empty());
            if empty {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
