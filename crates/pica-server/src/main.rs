use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use pica_core::logging;
use pica_core::policy::Policy;
use pica_core::scheduler::Scheduler;
use pica_core::store::Library;
use pica_server::api;

/// Private comic server: download task engine plus REST control plane.
#[derive(Debug, Parser)]
#[command(name = "pica-server")]
#[command(about = "pica: private comic download server", long_about = None)]
struct Args {
    /// Bind address; falls back to PICA_BIND, then 127.0.0.1.
    #[arg(long)]
    bind: Option<String>,

    /// Port; falls back to PICA_PORT, then 8080.
    #[arg(long)]
    port: Option<u16>,

    /// Storage directory; falls back to PICA_STORAGE, then ./pica-storage.
    #[arg(long)]
    storage: Option<PathBuf>,
}

fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("pica-server error: {err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> Result<()> {
    let args = Args::parse();
    let storage = args
        .storage
        .or_else(|| env_nonempty("PICA_STORAGE").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("pica-storage"));

    if let Err(e) = logging::init_logging(&storage) {
        eprintln!("pica-server: log file unavailable ({e}), using stderr");
        logging::init_logging_stderr();
    }

    let bind = args
        .bind
        .or_else(|| env_nonempty("PICA_BIND"))
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = args
        .port
        .or_else(|| env_nonempty("PICA_PORT").and_then(|v| v.parse().ok()))
        .unwrap_or(8080);

    let db = Library::open_at(storage.join("library.db"))
        .await
        .context("open library database")?;
    let policy = Policy::from_env();
    tracing::info!(?policy, storage = %storage.display(), "starting pica-server");

    let scheduler = Scheduler::new(db, storage, policy);
    // Boot recovery runs before the listener accepts any request.
    scheduler.recover_and_start().await?;

    let state = api::AppState {
        scheduler,
        api_key: env_nonempty("PICA_API_KEY").map(Into::into),
    };
    let app = api::router(state);

    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("bad bind address {bind}:{port}"))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
