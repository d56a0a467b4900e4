//! Shuttle Gateway binary
//!
//! # Usage
//!
//! ```bash
//! # Run with a seed configuration
//! shuttle-gateway --config gateway.toml
//!
//! # Volatile state store (no sled directory)
//! shuttle-gateway --config gateway.toml --memory-store
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: logging filter (default: info)
//! - `TCP_CONNECT_TIMEOUT` / `TCP_READ_TIMEOUT` / `TCP_WRITE_TIMEOUT`
//! - `SHUTTLE_LISTENER_PORT`, `SHUTTLE_TIMEOUT_SECONDS`
//! - `COMMAND_QUEUE_MAX_SIZE`, `COMMAND_PROCESSOR_WORKERS`
//! - `WMS_WEBHOOK_URL`: webhook endpoint for shuttle events

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use shuttle_gateway::api::{self, GatewayApiState};
use shuttle_gateway::dispatch::{CommandRegistry, Dispatcher, RetryPolicy};
use shuttle_gateway::heartbeat::HeartbeatMonitor;
use shuttle_gateway::interpreter::MessageInterpreter;
use shuttle_gateway::metrics::GatewayMetrics;
use shuttle_gateway::state_machine::StateMachine;
use shuttle_gateway::store::{MemoryStateStore, SledStateStore, StateStore};
use shuttle_gateway::transport::ShuttleListener;
use shuttle_gateway::webhook::WebhookReporter;
use shuttle_gateway::wms::{HttpWmsBackend, WmsPoller};
use shuttle_gateway::Settings;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "shuttle-gateway")]
#[command(about = "WMS-to-shuttle gateway for pallet shuttle fleets")]
#[command(version)]
struct CliArgs {
    /// Path to the TOML seed configuration (shuttles, stocks, WMS endpoint)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the admin API bind address (default: "0.0.0.0:8000")
    #[arg(short, long)]
    addr: Option<String>,

    /// Override the shuttle listener port (default: 5000)
    #[arg(long)]
    listener_port: Option<u16>,

    /// Keep shuttle state in memory instead of the sled store.
    /// State is lost on restart.
    #[arg(long)]
    memory_store: bool,
}

/// Task identification for supervisor logging
#[derive(Debug, Clone, Copy)]
enum TaskName {
    HttpServer,
    ShuttleListener,
    CommandWorker,
    Heartbeat,
    WmsPoller,
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::HttpServer => write!(f, "HttpServer"),
            TaskName::ShuttleListener => write!(f, "ShuttleListener"),
            TaskName::CommandWorker => write!(f, "CommandWorker"),
            TaskName::Heartbeat => write!(f, "Heartbeat"),
            TaskName::WmsPoller => write!(f, "WmsPoller"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = CliArgs::parse();

    info!("Starting WMS-to-shuttle gateway");

    let mut settings =
        Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(addr) = args.addr {
        settings.api_addr = addr;
    }
    if let Some(port) = args.listener_port {
        settings.listener_port = port;
    }
    let settings = Arc::new(settings);

    // ---- State store ----
    let store: Arc<dyn StateStore> = if args.memory_store {
        Arc::new(MemoryStateStore::new())
    } else {
        let path = settings.data_dir.join("gateway-db");
        Arc::new(SledStateStore::open(&path).context("Failed to open state store")?)
    };
    info!(backend = store.backend_name(), "State store ready");

    for shuttle_id in settings.shuttles.keys() {
        store
            .init_if_absent(shuttle_id)
            .with_context(|| format!("Failed to seed state for {shuttle_id}"))?;
    }

    // ---- Core components ----
    let metrics = Arc::new(GatewayMetrics::new());
    let registry = Arc::new(CommandRegistry::new());
    let machine = Arc::new(StateMachine::new());
    let webhook = Arc::new(WebhookReporter::new(
        settings.webhook_url.clone(),
        Arc::clone(&registry),
        Arc::clone(&metrics),
    ));
    let interpreter = Arc::new(MessageInterpreter::new(
        Arc::clone(&store),
        Arc::clone(&machine),
        webhook,
        Arc::clone(&metrics),
        settings.low_battery_threshold,
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&settings),
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&metrics),
        RetryPolicy::default(),
    ));

    let listener = ShuttleListener::bind(
        Arc::clone(&settings),
        Arc::clone(&store),
        interpreter,
        Arc::clone(&metrics),
    )
    .await
    .context("Failed to bind shuttle listener")?;

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<TaskName> = JoinSet::new();

    // ---- Shuttle listener ----
    {
        let token = cancel.clone();
        tasks.spawn(async move {
            listener.run(token).await;
            TaskName::ShuttleListener
        });
    }

    // ---- Command workers ----
    for worker_id in 1..=settings.command_processor_workers.max(1) {
        let dispatcher = Arc::clone(&dispatcher);
        let token = cancel.clone();
        tasks.spawn(async move {
            dispatcher.run_worker(worker_id, token).await;
            TaskName::CommandWorker
        });
    }
    info!(
        workers = settings.command_processor_workers.max(1),
        "Command workers started"
    );

    // ---- Heartbeat monitor ----
    {
        let monitor = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&settings),
            Arc::clone(&store),
        ));
        let token = cancel.clone();
        tasks.spawn(async move {
            monitor.run(token).await;
            TaskName::Heartbeat
        });
    }

    // ---- WMS poller ----
    if let Some(wms_settings) = settings.wms.clone() {
        let poller = Arc::new(WmsPoller::new(
            Arc::new(HttpWmsBackend::new(wms_settings)),
            Arc::clone(&dispatcher),
            Arc::clone(&store),
            Arc::clone(&settings),
        ));
        let token = cancel.clone();
        tasks.spawn(async move {
            poller.run(token).await;
            TaskName::WmsPoller
        });
    }

    // ---- Admin API ----
    {
        let api_listener = tokio::net::TcpListener::bind(&settings.api_addr)
            .await
            .with_context(|| format!("Failed to bind API address {}", settings.api_addr))?;
        info!(address = %api_listener.local_addr()?, "Admin API listening");

        let app = api::create_app(GatewayApiState {
            settings: Arc::clone(&settings),
            store: Arc::clone(&store),
            dispatcher: Arc::clone(&dispatcher),
            metrics: Arc::clone(&metrics),
        });
        let token = cancel.clone();
        tasks.spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = axum::serve(api_listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "Admin API server failed");
            }
            TaskName::HttpServer
        });
    }

    info!("Gateway up");

    // ---- Supervision ----
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        Some(result) = tasks.join_next() => {
            match result {
                Ok(name) => warn!(task = %name, "Task exited unexpectedly"),
                Err(e) => error!(error = %e, "Task panicked"),
            }
        }
    }

    cancel.cancel();
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(name) => info!(task = %name, "Task stopped"),
            Err(e) => error!(error = %e, "Task failed during shutdown"),
        }
    }

    info!("Gateway stopped");
    Ok(())
}
