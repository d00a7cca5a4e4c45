// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nimbus_config::{Config, ToolsConfig};
use nimbus_core::{
    ApprovalGate, ChatHandler, CognitiveRouter, DefaultProviderFactory, Heartbeat, InMemoryMemory,
    LaneQueue, ToolFlagRegistry, ToolFlags,
};
use nimbus_scheduler::{CronScheduler, JobStore};
use nimbus_tools::builtin::{read_file::ReadFileTool, shell::ShellTool, write::WriteTool};
use nimbus_tools::registry::ToolRegistry;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match &cli.command {
        Commands::Completions { shell } => {
            cli::print_completions(*shell);
            return Ok(());
        }
        Commands::ShowConfig => {
            let config = nimbus_config::load(cli.config.as_deref())?;
            print!("{}", serde_yaml::to_string(&config)?);
            return Ok(());
        }
        Commands::Serve { port } => {
            let runtime = tokio::runtime::Runtime::new().context("building tokio runtime")?;
            runtime.block_on(run_serve(cli.config.as_deref(), *port))
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

/// Resolves the daemon's state directory: the configured `daemon.state_dir`,
/// falling back to the XDG state dir (`~/.local/state/nimbus` on Linux).
fn state_dir(config: &Config) -> Result<PathBuf> {
    if let Some(dir) = &config.daemon.state_dir {
        return Ok(PathBuf::from(dir));
    }
    let base = dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .context("no state/data-local directory available on this platform")?;
    Ok(base.join("nimbus"))
}

/// Writes the daemon's pid as plain text. Removed again on clean shutdown;
/// a stale file left behind after a crash is harmless — nothing reads it
/// except an operator checking whether the daemon is (still) running.
async fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }
    tokio::fs::write(path, std::process::id().to_string())
        .await
        .with_context(|| format!("writing {}", path.display()))
}

fn register_builtin_tools(tools: &ToolsConfig) -> (ToolRegistry, Vec<(&'static str, ToolFlags)>) {
    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(ShellTool { timeout_secs: tools.timeout_secs });
    registry.register(WriteTool);

    // Shell and write both touch the host outside the model's sandboxed
    // context (arbitrary commands / filesystem mutation); read_file never
    // needs a human in the loop.
    let flags = vec![
        ("read_file", ToolFlags::default()),
        ("shell", ToolFlags { destructive: true, intrusive: false }),
        ("write", ToolFlags { destructive: true, intrusive: false }),
    ];
    (registry, flags)
}

async fn run_serve(config_path: Option<&Path>, port_override: Option<u16>) -> Result<()> {
    let mut config = nimbus_config::load(config_path)?;
    if let Some(port) = port_override {
        config.daemon.port = port;
    }

    let state_dir = state_dir(&config)?;
    tokio::fs::create_dir_all(&state_dir)
        .await
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;
    let pid_path = state_dir.join("daemon.pid");
    write_pid_file(&pid_path).await?;

    let lanes = Arc::new(LaneQueue::new());
    let approvals = Arc::new(ApprovalGate::new());
    let heavy = Arc::new(nimbus_core::HeavyTaskQueue::new());

    let worker_provider = nimbus_model::from_candidate(&config.models.worker.primary)
        .context("constructing worker-tier model provider")?;
    heavy.set_worker(worker_provider).await;

    let (tools, flag_list) = register_builtin_tools(&config.tools);
    let tools = Arc::new(tools);
    let flags = Arc::new(ToolFlagRegistry::new());
    for (name, flag) in flag_list {
        flags.set(name, flag).await;
    }

    let memory: Arc<dyn nimbus_core::MemoryInterface> = Arc::new(InMemoryMemory::new());
    let factory = Arc::new(DefaultProviderFactory);

    let router = Arc::new(CognitiveRouter::new(
        tools,
        flags,
        approvals.clone(),
        memory,
        factory,
        config.router.clone(),
        Duration::from_millis(config.approvals.default_ttl_ms),
    ));

    let heartbeat = Arc::new(Heartbeat::new(
        config.daemon.port,
        lanes.clone(),
        approvals.clone(),
        heavy,
        Duration::from_millis(config.heartbeat.interval_ms),
        Duration::from_millis(config.heartbeat.worker_tick_ms),
        config.heartbeat.suppress_unchanged,
    ));
    heartbeat.start().await;

    let max_tokens = config.models.tier1.primary.max_tokens.max(config.models.tier2.primary.max_tokens) as usize;
    let chat_handler = Arc::new(ChatHandler::new(lanes.clone(), heartbeat.clone(), router, max_tokens));

    let jobs_file = config
        .scheduler
        .jobs_file
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("cron_jobs.json"));
    let job_store = Arc::new(JobStore::load(&jobs_file).await.with_context(|| format!("loading {}", jobs_file.display()))?);

    let tier1_candidates = (config.models.tier1.primary.clone(), config.models.tier1.fallbacks.clone());
    let scheduler = Arc::new(CronScheduler::new(
        job_store,
        chat_handler.clone(),
        config.lanes.default_max_concurrent,
        tier1_candidates.clone(),
    ));
    scheduler.init().await.context("re-arming persisted cron jobs")?;

    let service = nimbus_gateway::GatewayService::new(
        chat_handler,
        approvals,
        heartbeat.clone(),
        scheduler,
        tier1_candidates,
        config.lanes.default_max_concurrent,
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.daemon.port));
    info!(%addr, state_dir = %state_dir.display(), "nimbusd starting");

    let result = tokio::select! {
        res = nimbus_gateway::serve(addr, service) => res,
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    lanes.mark_gateway_draining();
    if !lanes.wait_for_all_active(Duration::from_secs(10)).await {
        warn!("lane drain timed out with turns still active; shutting down anyway");
    }
    heartbeat.stop().await;
    if let Err(e) = tokio::fs::remove_file(&pid_path).await {
        warn!(error = %e, path = %pid_path.display(), "failed to remove pid file on shutdown");
    }
    if let Err(e) = &result {
        error!(error = %e, "gateway exited with error");
    }
    result
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
