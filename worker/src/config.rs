use loom_protocol::NodeConfig;
use std::net::SocketAddr;
use std::time::Duration;

/// Which execution provider serves job requests on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    Builtin,
    Subprocess,
    Http,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: String,
    pub peer_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub bootstrap_peers: Vec<String>,
    pub provider: ProviderKind,
    pub program: String,
    pub program_args: Vec<String>,
    pub work_dir: String,
    pub runner_url: String,
    pub runner_peers: usize,
    pub sub_task_deadline_ms: u64,
    pub provider_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub grid: (u32, u32),
    pub capability: Option<f64>,
}

impl Config {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            node_id: self.node_id.clone(),
            sub_task_deadline: Duration::from_millis(self.sub_task_deadline_ms),
            grid_columns: self.grid.0,
            grid_rows: self.grid.1,
            provider_timeout: Duration::from_secs(self.provider_timeout_secs),
            capability_score: self.capability,
            ..NodeConfig::default()
        }
    }
}
