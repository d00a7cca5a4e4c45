// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Persistent cron scheduler (§4.6): arms a `tokio` timer per enabled job
//! and, on fire, persists `lastRunAt` and pushes a synthetic chat request
//! onto the `cron` lane. The scheduler never talks to a model itself —
//! that guarantees a live user turn is never preempted by a scheduled one.
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use nimbus_config::ModelCandidate;
use nimbus_core::{ChatHandler, ChatRequest};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::job_store::{CronJobRecord, JobStore};

pub const CRON_LANE: &str = "cron";

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid cron expression: {0}")]
    InvalidExpr(String),
}

/// A scheduled job plus its next computed fire time, for `listScheduledTasks`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScheduledTaskView {
    #[serde(flatten)]
    pub record: CronJobRecord,
    pub next_run: Option<chrono::DateTime<Utc>>,
}

/// Standard 5-field unix cron has no seconds column; the `cron` crate
/// requires one, so a bare 5-field expression is widened with a leading
/// `"0 "` before parsing.
fn normalize_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

fn parse_schedule(expr: &str) -> Result<Schedule, SchedulerError> {
    Schedule::from_str(&normalize_expr(expr)).map_err(|_| SchedulerError::InvalidExpr(expr.to_string()))
}

fn next_run(record: &CronJobRecord) -> Option<chrono::DateTime<Utc>> {
    parse_schedule(&record.cron_expr).ok()?.upcoming(Utc).next()
}

/// `lowercase(prompt[..40]).replace(/\s+/, '-')`: first 40 chars, lowercased,
/// with every run of whitespace collapsed to a single dash.
fn derive_alias(prompt: &str) -> String {
    let truncated: String = prompt.to_lowercase().chars().take(40).collect();
    let mut alias = String::with_capacity(truncated.len());
    let mut in_whitespace_run = false;
    for ch in truncated.chars() {
        if ch.is_whitespace() {
            if !in_whitespace_run {
                alias.push('-');
                in_whitespace_run = true;
            }
        } else {
            alias.push(ch);
            in_whitespace_run = false;
        }
    }
    alias
}

pub struct CronScheduler {
    store: Arc<JobStore>,
    chat_handler: Arc<ChatHandler>,
    lane_max_concurrent: usize,
    candidates: (ModelCandidate, Vec<ModelCandidate>),
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(
        store: Arc<JobStore>,
        chat_handler: Arc<ChatHandler>,
        lane_max_concurrent: usize,
        candidates: (ModelCandidate, Vec<ModelCandidate>),
    ) -> Self {
        Self { store, chat_handler, lane_max_concurrent, candidates, timers: Mutex::new(HashMap::new()) }
    }

    /// Re-arm every enabled job loaded from disk. Call once at startup.
    pub async fn init(&self) -> anyhow::Result<()> {
        for record in self.store.all().await {
            if record.enabled {
                self.arm(record).await;
            }
        }
        Ok(())
    }

    pub async fn schedule_task(
        &self,
        cron_expr: &str,
        prompt: &str,
        alias: Option<String>,
        existing_id: Option<String>,
    ) -> Result<String, SchedulerError> {
        parse_schedule(cron_expr)?;

        let id = existing_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        // Replacing a live job: at most one timer per id (invariant).
        if let Some(handle) = self.stop_timer(&id).await {
            handle.abort();
        }

        let record = CronJobRecord {
            id: id.clone(),
            alias: alias.unwrap_or_else(|| derive_alias(prompt)),
            cron_expr: cron_expr.to_string(),
            prompt: prompt.to_string(),
            enabled: true,
            created_at: Utc::now(),
            last_run_at: None,
        };
        self.store.upsert(record.clone()).await;
        self.arm(record).await;
        Ok(id)
    }

    pub async fn list_scheduled_tasks(&self) -> Vec<ScheduledTaskView> {
        self.store
            .all()
            .await
            .into_iter()
            .map(|record| {
                let next_run = next_run(&record);
                ScheduledTaskView { record, next_run }
            })
            .collect()
    }

    /// Matches by id first, then by alias. Stops the live timer (if any)
    /// and rewrites the persisted file.
    pub async fn delete_task(&self, id_or_alias: &str) -> bool {
        let target_id = if self.store.get(id_or_alias).await.is_some() {
            Some(id_or_alias.to_string())
        } else {
            self.store.find_by_alias(id_or_alias).await.map(|r| r.id)
        };
        let Some(id) = target_id else { return false };

        if let Some(handle) = self.stop_timer(&id).await {
            handle.abort();
        }
        self.store.remove(&id).await
    }

    /// Stop every live timer without touching persisted state. Used on
    /// daemon shutdown — in-flight synthetic turns already enqueued on the
    /// `cron` lane are left to finish; only future firings are cancelled.
    pub async fn stop_all(&self) {
        let mut timers = self.timers.lock().await;
        for (_, handle) in timers.drain() {
            handle.abort();
        }
    }

    async fn stop_timer(&self, id: &str) -> Option<JoinHandle<()>> {
        self.timers.lock().await.remove(id)
    }

    async fn arm(&self, record: CronJobRecord) {
        let schedule = match parse_schedule(&record.cron_expr) {
            Ok(s) => s,
            Err(e) => {
                warn!(id = %record.id, error = %e, "refusing to arm job with invalid expression");
                return;
            }
        };
        let store = self.store.clone();
        let chat_handler = self.chat_handler.clone();
        let lane_max_concurrent = self.lane_max_concurrent;
        let candidates = self.candidates.clone();
        let id = record.id.clone();
        let alias = record.alias.clone();
        let prompt = record.prompt.clone();

        let handle = tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else { break };
                let delta = (next - Utc::now()).to_std().unwrap_or(std::time::Duration::from_secs(0));
                tokio::time::sleep(delta).await;

                let now = Utc::now();
                store.set_last_run(&id, now).await;
                info!(id = %id, alias = %alias, "cron job fired");

                let request = ChatRequest {
                    request_id: format!("cron-{id}-{}", now.timestamp_millis()),
                    client_id: None,
                    content: format!("[SCHEDULED TASK: {alias}] {prompt}"),
                    forced_tier: None,
                    lane_override: Some(CRON_LANE.to_string()),
                };
                if let Err(e) = chat_handler
                    .handle(request, candidates.clone(), lane_max_concurrent, |_event| {})
                    .await
                {
                    warn!(id = %id, error = %e, "scheduled turn failed");
                }
            }
        });
        self.timers.lock().await.insert(record.id, handle);
    }
}
