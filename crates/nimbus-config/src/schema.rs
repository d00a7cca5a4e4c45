// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub lanes: LaneConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub approvals: ApprovalConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Local WebSocket port the gateway binds.
    #[serde(default = "DaemonConfig::default_port")]
    pub port: u16,
    /// Directory holding persisted state (`cron_jobs.json`, `daemon.pid`,
    /// core-memory text). Defaults to the XDG state dir.
    pub state_dir: Option<String>,
}

impl DaemonConfig {
    fn default_port() -> u16 {
        18080
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
            state_dir: None,
        }
    }
}

/// A single named backend candidate: `{provider, model}` plus the wire
/// parameters forwarded to the model backend interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCandidate {
    pub provider: String,
    pub name: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "ModelCandidate::default_max_tokens")]
    pub max_tokens: u32,
}

impl ModelCandidate {
    fn default_max_tokens() -> u32 {
        4096
    }
}

/// Per-tier backend selection: each tier has a primary candidate and an
/// ordered list of fallbacks consulted by `runWithModelFallback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierModels {
    pub primary: ModelCandidate,
    #[serde(default)]
    pub fallbacks: Vec<ModelCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub tier1: TierModels,
    pub tier2: TierModels,
    pub worker: TierModels,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        let mock = |name: &str| ModelCandidate {
            provider: "mock".into(),
            name: name.into(),
            api_key_env: None,
            base_url: None,
            max_tokens: ModelCandidate::default_max_tokens(),
        };
        Self {
            tier1: TierModels {
                primary: mock("tier1-mock"),
                fallbacks: Vec::new(),
            },
            tier2: TierModels {
                primary: mock("tier2-mock"),
                fallbacks: Vec::new(),
            },
            worker: TierModels {
                primary: mock("worker-mock"),
                fallbacks: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneConfig {
    /// Default `maxConcurrent` for lanes created without an explicit override.
    #[serde(default = "LaneConfig::default_max_concurrent")]
    pub default_max_concurrent: usize,
    /// Per-lane `maxConcurrent` overrides, keyed by lane name.
    #[serde(default)]
    pub overrides: std::collections::HashMap<String, usize>,
    /// Wait-warning threshold in milliseconds (§5 default 2000 ms).
    #[serde(default = "LaneConfig::default_warn_after_ms")]
    pub warn_after_ms: u64,
}

impl LaneConfig {
    fn default_max_concurrent() -> usize {
        1
    }
    fn default_warn_after_ms() -> u64 {
        2000
    }
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: Self::default_max_concurrent(),
            overrides: std::collections::HashMap::new(),
            warn_after_ms: Self::default_warn_after_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "HeartbeatConfig::default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "HeartbeatConfig::default_worker_tick_ms")]
    pub worker_tick_ms: u64,
    #[serde(default = "default_true")]
    pub suppress_unchanged: bool,
}

impl HeartbeatConfig {
    fn default_interval_ms() -> u64 {
        1000
    }
    fn default_worker_tick_ms() -> u64 {
        3000
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: Self::default_interval_ms(),
            worker_tick_ms: Self::default_worker_tick_ms(),
            suppress_unchanged: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Default time-to-live for a pending approval request, in milliseconds.
    #[serde(default = "ApprovalConfig::default_ttl_ms")]
    pub default_ttl_ms: u64,
}

impl ApprovalConfig {
    fn default_ttl_ms() -> u64 {
        120_000
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: Self::default_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Directory holding `cron_jobs.json`. Defaults to `daemon.state_dir`.
    pub jobs_file: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { jobs_file: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Prompt-score threshold at or above which the heuristic routes to tier2.
    #[serde(default = "RouterConfig::default_tier2_threshold")]
    pub tier2_threshold: u32,
    /// Maximum tool-call rounds in a single streaming turn (§4.4 stepwise cap).
    #[serde(default = "RouterConfig::default_stepwise_cap")]
    pub stepwise_cap: u32,
    /// Top-N Auto-RAG chunks prepended to the user message (global, across categories).
    #[serde(default = "RouterConfig::default_auto_rag_top_n")]
    pub auto_rag_top_n: usize,
    /// Per-category top-K cap for Auto-RAG retrieval.
    #[serde(default = "RouterConfig::default_auto_rag_top_k")]
    pub auto_rag_top_k: usize,
    /// Path to the Core Working Memory text file, injected into every prompt.
    pub core_memory_file: Option<String>,
    /// Approximate token cap for the Core Working Memory block.
    #[serde(default = "RouterConfig::default_core_memory_token_cap")]
    pub core_memory_token_cap: usize,
    /// Character threshold above which a Tier-2 response triggers wisdom distillation.
    #[serde(default = "RouterConfig::default_distillation_min_chars")]
    pub distillation_min_chars: usize,
}

impl RouterConfig {
    fn default_tier2_threshold() -> u32 {
        5
    }
    fn default_stepwise_cap() -> u32 {
        5
    }
    fn default_auto_rag_top_n() -> usize {
        3
    }
    fn default_auto_rag_top_k() -> usize {
        2
    }
    fn default_core_memory_token_cap() -> usize {
        1000
    }
    fn default_distillation_min_chars() -> usize {
        800
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            tier2_threshold: Self::default_tier2_threshold(),
            stepwise_cap: Self::default_stepwise_cap(),
            auto_rag_top_n: Self::default_auto_rag_top_n(),
            auto_rag_top_k: Self::default_auto_rag_top_k(),
            core_memory_file: None,
            core_memory_token_cap: Self::default_core_memory_token_cap(),
            distillation_min_chars: Self::default_distillation_min_chars(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Automatically approve tool invocations matching these glob patterns.
    #[serde(default = "ToolsConfig::default_auto_approve")]
    pub auto_approve_patterns: Vec<String>,
    /// Deny tool invocations matching these glob patterns outright.
    #[serde(default = "ToolsConfig::default_deny")]
    pub deny_patterns: Vec<String>,
    /// Timeout in seconds for a single tool call.
    #[serde(default = "ToolsConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Per-result truncation cap (characters) applied by transcript repair's
    /// payload-strip pass (§4.8). A value of 0 disables truncation.
    #[serde(default = "ToolsConfig::default_max_result_chars")]
    pub max_result_chars: usize,
}

impl ToolsConfig {
    fn default_auto_approve() -> Vec<String> {
        vec!["read_file *".into(), "list_dir *".into(), "grep *".into()]
    }
    fn default_deny() -> Vec<String> {
        vec!["rm -rf /*".into()]
    }
    fn default_timeout_secs() -> u64 {
        30
    }
    fn default_max_result_chars() -> usize {
        3000
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: Self::default_auto_approve(),
            deny_patterns: Self::default_deny(),
            timeout_secs: Self::default_timeout_secs(),
            max_result_chars: Self::default_max_result_chars(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_daemon_port() {
        let c = Config::default();
        assert_eq!(c.daemon.port, 18080);
    }

    #[test]
    fn config_default_lane_max_concurrent_is_one() {
        let c = Config::default();
        assert_eq!(c.lanes.default_max_concurrent, 1);
    }

    #[test]
    fn config_default_heartbeat_interval() {
        let c = Config::default();
        assert_eq!(c.heartbeat.interval_ms, 1000);
        assert!(c.heartbeat.suppress_unchanged);
    }

    #[test]
    fn config_default_approval_ttl_positive() {
        let c = Config::default();
        assert!(c.approvals.default_ttl_ms > 0);
    }

    #[test]
    fn config_default_router_stepwise_cap_is_five() {
        let c = Config::default();
        assert_eq!(c.router.stepwise_cap, 5);
    }

    #[test]
    fn config_default_auto_rag_top_n_is_three() {
        let c = Config::default();
        assert_eq!(c.router.auto_rag_top_n, 3);
    }

    #[test]
    fn config_default_models_use_mock_provider() {
        let c = Config::default();
        assert_eq!(c.models.tier1.primary.provider, "mock");
        assert_eq!(c.models.tier2.primary.provider, "mock");
        assert_eq!(c.models.worker.primary.provider, "mock");
    }

    #[test]
    fn config_serialises_to_valid_yaml() {
        let c = Config::default();
        let yaml_str = serde_yaml::to_string(&c).unwrap();
        assert!(yaml_str.contains("tier1"));
        assert!(yaml_str.contains("port"));
    }

    #[test]
    fn config_deserialises_partial_yaml_fills_defaults() {
        let yaml_str = "daemon:\n  port: 9090\n";
        let c: Config = serde_yaml::from_str(yaml_str).unwrap();
        assert_eq!(c.daemon.port, 9090);
        assert_eq!(c.lanes.default_max_concurrent, LaneConfig::default().default_max_concurrent);
    }

    #[test]
    fn config_round_trip_lane_overrides() {
        let mut c = Config::default();
        c.lanes.overrides.insert("cron".into(), 1);
        c.lanes.overrides.insert("main".into(), 4);
        let yaml = serde_yaml::to_string(&c).unwrap();
        let back: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.lanes.overrides.get("main"), Some(&4));
    }

    #[test]
    fn config_default_tools_has_auto_approve_patterns() {
        let c = Config::default();
        assert!(!c.tools.auto_approve_patterns.is_empty());
    }

    #[test]
    fn config_default_scheduler_jobs_file_is_none() {
        let c = Config::default();
        assert!(c.scheduler.jobs_file.is_none());
    }
}
