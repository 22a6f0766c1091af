//! warden-daemon - the warden service daemon.
//!
//! Wires configuration, the execution graph, and the Unix-socket control
//! plane together, then runs until SIGTERM/SIGINT.
//!
//! In dev mode (`--dev` or `dev_mode = true` in the config) the reasoning
//! core and tool substrate are replaced by the deterministic dev
//! collaborators, so the full approval flow can be exercised from a
//! terminal client. In production both arrive from external collaborators
//! and the daemon refuses weak HMAC secrets.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use warden_core::clock::SystemClock;
use warden_core::config::RuntimeConfig;
use warden_core::graph::GraphRuntime;
use warden_core::state::SqliteStateStore;
use warden_daemon::devhost::{FsToolHost, KeywordExecutor, LinePlanner};
use warden_daemon::ipc;
use warden_daemon::service::AgentService;

/// warden daemon - zero-trust agent runtime
#[derive(Parser, Debug)]
#[command(name = "warden-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the runtime configuration file
    #[arg(short, long, default_value = "warden.toml")]
    config: PathBuf,

    /// Path to the control Unix socket
    #[arg(long, default_value = "/run/warden/control.sock")]
    socket: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log to file instead of stdout
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Force dev mode (dev collaborators, relaxed secret checks)
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args)?;

    let mut config = if args.config.exists() {
        RuntimeConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!(config = %args.config.display(), "no config file found, using defaults");
        RuntimeConfig::default()
    };
    if args.dev {
        config.dev_mode = true;
    }
    if config.dev_mode && !args.config.exists() {
        // Bare `--dev` start: keep everything under a scratch prefix.
        config = RuntimeConfig::for_dev();
    }
    config.validate().context("configuration rejected")?;

    if config.dev_mode {
        warn!("dev mode active: approval tokens are surfaced in pause messages");
    }

    let config = Arc::new(config);
    let store = Arc::new(
        SqliteStateStore::open(&config.state_db_path).context("failed to open state store")?,
    );

    // Dev collaborators; production deployments plug the reasoning core and
    // tool substrate in through the library API instead of this binary.
    let tool_host = FsToolHost::new(config.workspace_root.clone())
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("failed to prepare workspace")?;

    let runtime = GraphRuntime::builder(config.clone(), Arc::new(SystemClock))
        .planner(Arc::new(LinePlanner))
        .executor(Arc::new(KeywordExecutor))
        .invoker(Arc::new(tool_host))
        .build()
        .context("failed to build graph runtime")?;

    let service = Arc::new(AgentService::new(runtime, store));

    info!(
        pid = std::process::id(),
        socket = %args.socket.display(),
        workspace = %config.workspace_root.display(),
        "warden daemon started"
    );

    let shutdown = Arc::new(AtomicBool::new(false));

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
        signal_shutdown.store(true, Ordering::SeqCst);
    });

    // The server polls the shutdown flag, so it unwinds (and removes its
    // socket) on its own once a signal lands.
    ipc::run(&args.socket, service, shutdown)
        .await
        .context("IPC server failed")?;

    info!("daemon shutdown complete");
    Ok(())
}

fn init_tracing(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .context("failed to open log file")?;
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}
