//! # atrium
//!
//! Server binary: loads settings, wires the store and collaborators into an
//! orchestrator, then serves HTTP and WebSocket traffic until ctrl+c.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use atrium_core::events::NotificationChannel;
use atrium_core::launcher::TaskLauncher;
use atrium_core::HolderId;
use atrium_server::{
    BroadcastNotifier, BusinessContextProvider, HttpCompletionProvider, HttpContextProvider, HttpTaskLauncher,
    Orchestrator, OrchestratorDeps, ScheduledTask, Scheduler, ServerConfig, StaticContextProvider,
    UnconfiguredLauncher,
};
use atrium_settings::{load_settings, load_settings_from_path, AtriumSettings, StoreBackend};
use atrium_store::{MemoryStore, SqliteStore, StateStore};
use atrium_telemetry::{init_telemetry, TelemetryConfig};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "atrium", about = "Multi-tenant session and workflow orchestration server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server.
    Serve {
        /// Settings file. Defaults to `$ATRIUM_SETTINGS` or `~/.atrium/settings.json`.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to bind, overriding settings (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
    },
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn open_store(settings: &AtriumSettings) -> Result<Arc<dyn StateStore>> {
    match settings.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => {
            let path = PathBuf::from(&settings.store.sqlite_path);
            ensure_parent_dir(&path)?;
            let store = SqliteStore::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
            tracing::info!(path = %path.display(), "sqlite store opened");
            Ok(Arc::new(store))
        }
    }
}

fn collaborators(
    settings: &AtriumSettings,
) -> Result<(Arc<HttpCompletionProvider>, Arc<dyn TaskLauncher>, Arc<dyn BusinessContextProvider>)> {
    let c = &settings.collaborators;
    let timeout = c.request_timeout();

    let Some(completion_url) = c.completion_url.as_deref() else {
        bail!("collaborators.completionUrl must be set");
    };
    let provider = Arc::new(HttpCompletionProvider::new(completion_url, timeout)?);

    let launcher: Arc<dyn TaskLauncher> = match c.launcher_url.as_deref() {
        Some(url) => Arc::new(HttpTaskLauncher::new(url, timeout)?),
        None => {
            tracing::warn!("collaborators.launcherUrl not set, external tasks cannot be launched");
            Arc::new(UnconfiguredLauncher)
        }
    };

    let context: Arc<dyn BusinessContextProvider> = match c.business_context_url.as_deref() {
        Some(url) => Arc::new(HttpContextProvider::new(url, timeout)?),
        None => Arc::new(StaticContextProvider::default()),
    };
    Ok((provider, launcher, context))
}

async fn serve(config: Option<PathBuf>, port: Option<u16>) -> Result<()> {
    let mut settings = match config {
        Some(path) => load_settings_from_path(&path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => load_settings().context("Failed to load settings")?,
    };
    if let Some(port) = port {
        settings.server.port = port;
    }

    let _telemetry = init_telemetry(TelemetryConfig::from_directives(&settings.logging.level, settings.logging.json));
    tracing::info!("Starting Atrium server");

    let holder = settings
        .server
        .instance_id
        .as_deref()
        .map(HolderId::from_raw)
        .unwrap_or_default();
    let store = open_store(&settings)?;
    let (provider, launcher, context) = collaborators(&settings)?;
    let notifier = Arc::new(BroadcastNotifier::new(1024));

    let orchestrator = Orchestrator::new(
        &settings,
        OrchestratorDeps {
            store,
            provider,
            launcher,
            context,
            notifier: notifier.clone() as Arc<dyn NotificationChannel>,
            extra_tools: Vec::new(),
            holder: holder.clone(),
        },
    );

    let server_config = ServerConfig {
        host: settings.server.host.clone(),
        port: settings.server.port,
        ..ServerConfig::default()
    };
    let handle = atrium_server::start(server_config, orchestrator.clone(), &notifier)
        .await
        .context("Failed to start server")?;
    tracing::info!(port = handle.port, holder = %holder, "Atrium server ready");

    let sweeper = orchestrator.sessions().start_sweeper(settings.session.sweep_interval());
    let scheduler = settings.scheduler.enabled.then(|| {
        let tasks: Vec<ScheduledTask> = settings.scheduler.tasks.iter().map(ScheduledTask::from).collect();
        tracing::info!(tasks = tasks.len(), "scheduler enabled");
        Scheduler::new(
            orchestrator.clone(),
            tasks,
            Duration::from_secs(settings.scheduler.tick_interval_secs.max(1)),
        )
        .start()
    });

    tokio::signal::ctrl_c().await.context("Failed to listen for ctrl+c")?;
    tracing::info!("Shutting down");

    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    sweeper.abort();
    handle.shutdown().await;
    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve { config, port } => serve(config, port).await,
    }
}
