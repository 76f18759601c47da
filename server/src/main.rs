mod config;
mod models;
mod routes;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use loom_protocol::{BuiltinProvider, ExecutionProvider, HttpProvider};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loom-server", about = "loom job runner: POST /run-job")]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value = "5001", env = "LOOM_RUNNER_PORT")]
    port: u16,

    /// Forward chunks to another runner instead of computing in-process
    #[arg(long, env = "LOOM_UPSTREAM")]
    upstream: Option<String>,

    /// Overall job timeout in seconds
    #[arg(long, default_value = "30", env = "LOOM_JOB_TIMEOUT")]
    job_timeout: u64,

    /// Per-chunk provider timeout in seconds
    #[arg(long, default_value = "10")]
    provider_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let provider: Arc<dyn ExecutionProvider> = match &cli.upstream {
        Some(url) => Arc::new(HttpProvider::new(url, 1)),
        None => Arc::new(BuiltinProvider),
    };
    tracing::info!(port = cli.port, provider = provider.name(), "Starting loom job runner");

    let cfg = config::Config {
        job_timeout: Duration::from_secs(cli.job_timeout),
        provider_timeout: Duration::from_secs(cli.provider_timeout),
    };
    let state = state::AppState::new(provider, cfg);
    let app = routes::create_router(state).layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
