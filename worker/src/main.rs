mod config;
mod server;
mod transport;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use loom_protocol::{BuiltinProvider, Connector, ExecutionProvider, HttpProvider, Node};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use config::ProviderKind;

#[derive(Parser)]
#[command(name = "loom-worker", about = "loom peer node: executes and distributes sub-tasks")]
struct Cli {
    /// Address peers connect to; doubles as this node's id unless --node-id is set
    #[arg(long, env = "LOOM_PEER_ADDR", default_value = "127.0.0.1:7440")]
    peer_addr: SocketAddr,

    /// HTTP API address
    #[arg(long, env = "LOOM_API_ADDR", default_value = "127.0.0.1:7441")]
    api_addr: SocketAddr,

    /// Node id announced to peers (defaults to the peer address)
    #[arg(long, env = "LOOM_NODE_ID")]
    node_id: Option<String>,

    /// Peers to connect to on startup (host:port), comma separated
    #[arg(long = "peer", env = "LOOM_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Execution provider serving job requests
    #[arg(long, env = "LOOM_PROVIDER", value_enum, default_value = "builtin")]
    provider: ProviderKind,

    /// Program run per job by the subprocess provider
    #[arg(long, env = "LOOM_PROGRAM", default_value = "python3")]
    program: String,

    /// Extra arguments placed before the payload, e.g. a script path
    #[arg(long = "program-arg", env = "LOOM_PROGRAM_ARGS", value_delimiter = ',')]
    program_args: Vec<String>,

    /// Working directory for the subprocess provider
    #[arg(long, env = "LOOM_WORK_DIR", default_value = ".")]
    work_dir: String,

    /// Job runner base URL for the http provider
    #[arg(long, env = "LOOM_RUNNER_URL", default_value = "http://127.0.0.1:5001")]
    runner_url: String,

    /// numPeers forwarded to the job runner
    #[arg(long, default_value = "2")]
    runner_peers: usize,

    /// Per sub-task deadline in milliseconds
    #[arg(long, env = "LOOM_DEADLINE_MS", default_value = "5000")]
    deadline_ms: u64,

    /// Local provider timeout in seconds
    #[arg(long, default_value = "10")]
    provider_timeout: u64,

    /// Outbound connect timeout in seconds
    #[arg(long, default_value = "5")]
    connect_timeout: u64,

    /// Tile grid columns
    #[arg(long, default_value = "2")]
    grid_columns: u32,

    /// Tile grid rows
    #[arg(long, default_value = "2")]
    grid_rows: u32,

    /// Capability score (0-1) announced to peers
    #[arg(long, env = "LOOM_CAPABILITY")]
    capability: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::Config {
        node_id: cli.node_id.unwrap_or_else(|| cli.peer_addr.to_string()),
        peer_addr: cli.peer_addr,
        api_addr: cli.api_addr,
        bootstrap_peers: cli.peers,
        provider: cli.provider,
        program: cli.program,
        program_args: cli.program_args,
        work_dir: cli.work_dir,
        runner_url: cli.runner_url,
        runner_peers: cli.runner_peers,
        sub_task_deadline_ms: cli.deadline_ms,
        provider_timeout_secs: cli.provider_timeout,
        connect_timeout_secs: cli.connect_timeout,
        grid: (cli.grid_columns, cli.grid_rows),
        capability: cli.capability,
    };

    tracing::info!(
        node = %cfg.node_id,
        peer_addr = %cfg.peer_addr,
        api_addr = %cfg.api_addr,
        provider = ?cfg.provider,
        version = env!("CARGO_PKG_VERSION"),
        "Starting loom worker"
    );

    let provider: Arc<dyn ExecutionProvider> = match cfg.provider {
        ProviderKind::Builtin => Arc::new(BuiltinProvider),
        ProviderKind::Subprocess => Arc::new(worker::SubprocessProvider::new(
            &cfg.program,
            cfg.program_args.clone(),
            &cfg.work_dir,
            Duration::from_secs(cfg.provider_timeout_secs),
        )),
        ProviderKind::Http => Arc::new(HttpProvider::new(&cfg.runner_url, cfg.runner_peers)),
    };
    let connector: Arc<dyn Connector> = Arc::new(transport::WsConnector::new(Duration::from_secs(
        cfg.connect_timeout_secs,
    )));
    let node = Node::new(cfg.node_config(), provider, Some(connector));

    let peer_listener = tokio::spawn(transport::listen(cfg.peer_addr, node.registry.clone()));

    for peer in cfg.bootstrap_peers.clone() {
        let registry = node.registry.clone();
        tokio::spawn(async move {
            // peers may still be starting; retry with backoff
            let mut delay = Duration::from_secs(1);
            for attempt in 1..=5 {
                match registry.connect(&peer).await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::warn!(peer = %peer, attempt = attempt, "Connect failed: {e}, retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
            tracing::error!(peer = %peer, "Giving up on bootstrap peer");
        });
    }

    let state = Arc::new(server::ApiState {
        node: node.clone(),
        started_at: chrono::Utc::now(),
    });
    let app = server::create_router(state).layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(cfg.api_addr)
        .await
        .with_context(|| format!("Failed to bind API on {}", cfg.api_addr))?;
    tracing::info!(addr = %cfg.api_addr, "🚀 API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    peer_listener.abort();
    for peer in node.registry.connected_peers().await {
        node.registry.disconnect(&peer).await;
    }
    tracing::info!("Worker shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
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
