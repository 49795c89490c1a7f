//! warden - AI-assisted alert remediation engine for a homelab fleet.
//!
//! Receives Alertmanager webhooks, diagnoses firing alerts with an LLM
//! tool-use loop, executes validated commands over SSH, verifies against the
//! metrics backend that the alert actually cleared, learns reusable patterns
//! from verified fixes, and escalates to chat when automation is exhausted.

mod agent;
mod alerts;
mod clients;
mod config;
mod correlate;
mod error;
mod escalate;
mod hints;
mod hosts;
mod learning;
mod metrics;
mod pipeline;
mod preservation;
mod proactive;
mod queue;
mod runbooks;
mod server;
mod ssh;
mod store;
mod suppress;
mod validator;
mod workflow;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agent::llm::AnthropicClient;
use agent::tools::ToolRouter;
use agent::RemediationAgent;
use clients::{LokiClient, PrometheusClient};
use config::Config;
use correlate::AlertCorrelator;
use escalate::Escalator;
use hosts::{HostId, HostMonitor};
use learning::LearningEngine;
use pipeline::Pipeline;
use preservation::PreservationManager;
use proactive::ProactiveMonitor;
use queue::AlertQueue;
use runbooks::RunbookManager;
use server::App;
use ssh::SshExecutor;
use store::Store;
use suppress::AlertSuppressor;
use workflow::WorkflowClient;

/// Fingerprint cache entries older than this are reaped.
const FINGERPRINT_MAX_AGE_HOURS: i64 = 24;
/// How often the fingerprint reaper runs.
const FINGERPRINT_REAP_INTERVAL: Duration = Duration::from_secs(3600);
/// How often the suppression summary sweep runs.
const SUPPRESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "warden", version, about = "Alert remediation engine")]
struct Cli {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    log_format: String,

    /// Log level filter
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the remediation engine (default)
    Serve,
}

fn init_tracing(format: &str, level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    if format == "console" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_format, &cli.log_level);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve().await,
    }
}

async fn serve() -> Result<()> {
    let config = Arc::new(Config::from_env().context("configuration")?);

    info!(
        version = %config.app_version,
        port = config.port,
        "Application starting"
    );

    if config.external_url.is_none() {
        warn!(
            fallback_url = %config.callback_base_url(),
            "WARDEN_EXTERNAL_URL not configured; orchestrator callbacks use the keep address"
        );
    }

    // --- Durable state -------------------------------------------------------
    let store = Arc::new(
        Store::connect(&config.database_url, config.database_pool_size)
            .await
            .map_err(|e| anyhow::anyhow!("database: {e}"))?,
    );
    metrics::set_database_up(true);

    // --- Notifications -------------------------------------------------------
    let notifier = Arc::new(notify::Notifier::from_env());

    // --- Degraded-mode queue -------------------------------------------------
    let queue = Arc::new(AlertQueue::new(Arc::clone(&store)));
    queue.start();

    // --- Host monitoring and SSH ---------------------------------------------
    let addresses: HashMap<HostId, String> = [
        (HostId::Forge, config.forge.address.clone()),
        (HostId::Haven, config.haven.address.clone()),
        (HostId::Outpost, config.outpost.address.clone()),
        (HostId::Keep, config.keep.address.clone()),
    ]
    .into_iter()
    .collect();

    let host_monitor = Arc::new(HostMonitor::new(
        Arc::clone(&store),
        Arc::clone(&notifier),
        addresses,
    ));
    host_monitor.start();

    let host_configs: HashMap<HostId, config::HostConfig> = [
        (HostId::Forge, config.forge.clone()),
        (HostId::Haven, config.haven.clone()),
        (HostId::Outpost, config.outpost.clone()),
        (HostId::Keep, config.keep.clone()),
    ]
    .into_iter()
    .collect();

    let ssh = Arc::new(SshExecutor::new(
        host_configs,
        config.ssh_connection_timeout,
        config.command_execution_timeout,
        Arc::clone(&host_monitor),
    ));

    // --- External backends ---------------------------------------------------
    let prometheus = PrometheusClient::with_base_url(&config.prometheus_url);
    let loki = LokiClient::with_base_url(&config.loki_url);
    let orchestrator = config.orchestrator_url.as_deref().map(|url| {
        Arc::new(WorkflowClient::new(
            url,
            config.orchestrator_api_key.clone(),
        ))
    });

    // --- Decision layer ------------------------------------------------------
    let suppressor = Arc::new(AlertSuppressor::new(
        Arc::clone(&host_monitor),
        Arc::clone(&notifier),
    ));
    let correlator = Arc::new(AlertCorrelator::new(Arc::clone(&store)));
    let learning = Arc::new(LearningEngine::new(Arc::clone(&store)));
    let escalator = Arc::new(Escalator::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&notifier),
        config.escalation_cooldown_hours,
    ));

    // --- Model agent ---------------------------------------------------------
    let llm = Arc::new(AnthropicClient::new(
        &config.llm_api_key,
        &config.llm_model,
        config.llm_max_tokens,
        config.llm_timeout,
    ));
    let tools = Arc::new(ToolRouter::new(
        Arc::clone(&ssh),
        loki.clone(),
        prometheus.clone(),
        config.home_automation_token.clone(),
        orchestrator.clone(),
    ));
    let remediation_agent = Arc::new(RemediationAgent::new(llm, tools));

    // --- Runbooks ------------------------------------------------------------
    let mut runbook_manager = RunbookManager::new(&config.runbook_dir);
    runbook_manager.load();
    let runbooks = Arc::new(std::sync::RwLock::new(runbook_manager));

    // --- Self-preservation ---------------------------------------------------
    let preservation = Arc::new(PreservationManager::new(
        Arc::clone(&store),
        orchestrator.clone(),
        Arc::clone(&notifier),
        config.callback_base_url(),
    ));

    // Startup recovery: time out stale handoffs, then complete the active
    // one if this process is the engine coming back from a restart.
    if let Some(handoff) = preservation
        .startup_recovery(config.stale_handoff_cleanup_minutes)
        .await
    {
        match preservation.resume_from_handoff(&handoff.handoff_id).await {
            Ok(context) => {
                info!(
                    handoff_id = %handoff.handoff_id,
                    resumed_alert = context.as_ref().map(|c| c.alert_name.clone()),
                    "Resumed from handoff on startup"
                );
            }
            Err(e) => warn!(handoff_id = %handoff.handoff_id, error = %e, "Startup resume failed"),
        }
    }

    // --- Proactive monitoring ------------------------------------------------
    let node_instances = vec![
        format!("{}:9100", config.forge.address),
        format!("{}:9100", config.haven.address),
        format!("{}:9100", config.keep.address),
    ];
    let proactive = Arc::new(ProactiveMonitor::new(
        prometheus.clone(),
        Arc::clone(&store),
        Arc::clone(&notifier),
        config.proactive_check_interval,
        node_instances,
    ));
    proactive.start();

    // --- Pipeline ------------------------------------------------------------
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&config),
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&suppressor),
        Arc::clone(&correlator),
        Arc::clone(&learning),
        remediation_agent,
        Arc::clone(&ssh),
        prometheus.clone(),
        Arc::clone(&escalator),
        Arc::clone(&notifier),
        Arc::clone(&runbooks),
    ));

    // --- Housekeeping tasks --------------------------------------------------
    let reaper = {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(FINGERPRINT_REAP_INTERVAL).await;
                if let Err(e) = store.cleanup_fingerprint_cache(FINGERPRINT_MAX_AGE_HOURS).await {
                    warn!(error = %e, "Fingerprint cache reap failed");
                }
            }
        })
    };
    let summary_sweep = {
        let suppressor = Arc::clone(&suppressor);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SUPPRESSION_SWEEP_INTERVAL).await;
                suppressor.periodic_summary_check().await;
            }
        })
    };

    // --- HTTP server ---------------------------------------------------------
    let app = Arc::new(App {
        config: Arc::clone(&config),
        store: Arc::clone(&store),
        queue: Arc::clone(&queue),
        pipeline,
        learning,
        preservation,
        runbooks,
        host_monitor: Arc::clone(&host_monitor),
        suppressor: Arc::clone(&suppressor),
        prometheus,
        loki,
        orchestrator,
        notifier,
    });

    let router = server::build_router(app);
    let bind_addr = format!("{}:{}", config.bind_host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("bind {bind_addr}"))?;

    info!(address = %bind_addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server")?;

    // --- Shutdown ------------------------------------------------------------
    reaper.abort();
    summary_sweep.abort();
    proactive.stop();
    host_monitor.stop();
    queue.stop().await;
    ssh.close_all().await;
    store.close().await;

    info!("Application shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
