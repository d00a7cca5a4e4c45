// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! On-disk persistence for cron job records. Writes are crash-atomic
//! (temp file + rename); a missing file reads back as an empty store.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobRecord {
    pub id: String,
    pub alias: String,
    #[serde(rename = "cronExpr")]
    pub cron_expr: String,
    pub prompt: String,
    pub enabled: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastRunAt")]
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobsFile {
    version: u32,
    jobs: Vec<CronJobRecord>,
}

/// In-memory map of cron jobs backed by `cron_jobs.json`. Every mutation
/// persists the full file before returning.
pub struct JobStore {
    path: PathBuf,
    jobs: Mutex<HashMap<String, CronJobRecord>>,
}

impl JobStore {
    /// Load from `path`. A missing file is treated as an empty store —
    /// callers must tolerate first-run with no persisted jobs.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let jobs = if path.exists() {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let file: JobsFile =
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
            file.jobs.into_iter().map(|j| (j.id.clone(), j)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self { path: path.to_path_buf(), jobs: Mutex::new(jobs) })
    }

    pub async fn get(&self, id: &str) -> Option<CronJobRecord> {
        self.jobs.lock().await.get(id).cloned()
    }

    pub async fn find_by_alias(&self, alias: &str) -> Option<CronJobRecord> {
        self.jobs.lock().await.values().find(|j| j.alias == alias).cloned()
    }

    pub async fn all(&self) -> Vec<CronJobRecord> {
        self.jobs.lock().await.values().cloned().collect()
    }

    /// Persistence failures here are logged, not propagated: a write that
    /// fails leaves the in-memory record intact and is retried on the next
    /// mutation, matching `PersistenceError` policy (never crashes the daemon).
    pub async fn upsert(&self, record: CronJobRecord) {
        let mut jobs = self.jobs.lock().await;
        jobs.insert(record.id.clone(), record);
        self.persist_locked(&jobs).await;
    }

    pub async fn set_last_run(&self, id: &str, at: DateTime<Utc>) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(id) {
            job.last_run_at = Some(at);
        }
        self.persist_locked(&jobs).await;
    }

    pub async fn remove(&self, id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.remove(id).is_some();
        if removed {
            self.persist_locked(&jobs).await;
        }
        removed
    }

    async fn persist_locked(&self, jobs: &HashMap<String, CronJobRecord>) {
        if let Err(e) = self.try_persist(jobs).await {
            tracing::error!(path = %self.path.display(), error = %e, "failed to persist cron jobs");
        }
    }

    async fn try_persist(&self, jobs: &HashMap<String, CronJobRecord>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating dir {}", parent.display()))?;
        }
        let file = JobsFile { version: 1, jobs: jobs.values().cloned().collect() };
        let text = serde_json::to_string_pretty(&file).context("serializing cron jobs")?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, text.as_bytes())
            .await
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(id: &str, alias: &str) -> CronJobRecord {
        CronJobRecord {
            id: id.into(),
            alias: alias.into(),
            cron_expr: "0 0 * * * *".into(),
            prompt: "check health".into(),
            enabled: true,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            last_run_at: None,
        }
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(&dir.path().join("cron_jobs.json")).await.unwrap();
        assert!(store.all().await.is_empty());
    }

    #[tokio::test]
    async fn upsert_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron_jobs.json");
        let store = JobStore::load(&path).await.unwrap();
        store.upsert(record("j1", "hc")).await;

        let reloaded = JobStore::load(&path).await.unwrap();
        let job = reloaded.get("j1").await.unwrap();
        assert_eq!(job.alias, "hc");
    }

    #[tokio::test]
    async fn find_by_alias_matches_stored_alias() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(&dir.path().join("cron_jobs.json")).await.unwrap();
        store.upsert(record("j1", "hc")).await;
        assert!(store.find_by_alias("hc").await.is_some());
        assert!(store.find_by_alias("missing").await.is_none());
    }

    #[tokio::test]
    async fn set_last_run_updates_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let store = JobStore::load(&dir.path().join("cron_jobs.json")).await.unwrap();
        store.upsert(record("j1", "hc")).await;
        let now = Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).unwrap();
        store.set_last_run("j1", now).await;
        assert_eq!(store.get("j1").await.unwrap().last_run_at, Some(now));
    }

    #[tokio::test]
    async fn remove_nonexistent_returns_false_and_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron_jobs.json");
        let store = JobStore::load(&path).await.unwrap();
        assert!(!store.remove("nope").await);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn remove_existing_persists_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cron_jobs.json");
        let store = JobStore::load(&path).await.unwrap();
        store.upsert(record("j1", "hc")).await;
        assert!(store.remove("j1").await);

        let reloaded = JobStore::load(&path).await.unwrap();
        assert!(reloaded.all().await.is_empty());
    }
}
