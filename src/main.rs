mod config;
mod error;
mod events;
mod ide;
mod metrics;
mod ports;
mod sandbox;
mod server;
mod session;
mod storage;
mod workspace;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::ide::IdeSupervisor;
use crate::metrics::MetricsCollector;
use crate::sandbox::SandboxUserManager;
use crate::server::AppState;
use crate::session::SessionManager;
use crate::workspace::WorkspaceStore;

#[derive(Parser)]
#[command(name = "codepod", about = "Multi-tenant code-agent session manager")]
enum Cli {
    /// Start the session manager (default when no subcommand is given)
    #[command(alias = "run")]
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // Default to serve so `codepod` with no arguments just runs, while
    // --help and --version still work.
    let args: Vec<String> = std::env::args().collect();
    let Cli::Serve = if args.len() <= 1 {
        Cli::Serve
    } else {
        Cli::parse()
    };

    run_server().await
}

async fn run_server() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("codepod=info,tower_http=warn,hyper=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env().context("invalid configuration")?;

    tokio::fs::create_dir_all(&config.workspaces_path)
        .await
        .with_context(|| {
            format!(
                "cannot create workspaces base {}",
                config.workspaces_path.display()
            )
        })?;

    // Cloud storage must come up before anything else: session creation
    // has no local-only fallback.
    let store = storage::build_store(&config.storage)
        .await
        .context("object store initialisation failed")?;

    let workspaces = Arc::new(WorkspaceStore::new(store, config.workspaces_path.clone()));

    let homes_base = config.workspaces_path.join(".codepod-homes");
    let sandbox_manager = Arc::new(SandboxUserManager::new(
        config.workspaces_path.clone(),
        homes_base,
    ));
    sandbox_manager.initialize();

    let ide = Arc::new(IdeSupervisor::new(config.ide.clone(), sandbox_manager.clone()));
    let collector = Arc::new(MetricsCollector::new());

    let sessions = SessionManager::new(
        config.clone(),
        workspaces,
        sandbox_manager,
        ide,
        collector,
    );
    let reaper = sessions.spawn_reaper();

    let state = AppState {
        config: Arc::new(config.clone()),
        sessions: sessions.clone(),
    };
    let app = server::create_app(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    tracing::info!(addr = %addr, version = env!("CARGO_PKG_VERSION"), "codepod listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Stop every live session: final workspace flush, sandbox teardown,
    // IDE shutdown. Clean exit is status 0.
    tracing::info!("shutting down, stopping live sessions");
    reaper.abort();
    sessions.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
