use std::sync::Arc;

use crate::aggregator::Aggregator;
use crate::peer::PeerStore;
use crate::provider::ExecutionProvider;
use crate::registry::{ConnectionRegistry, Connector};
use crate::scheduler::Scheduler;
use crate::types::NodeConfig;

/// One node's worth of scheduling state, wired together. Every handle is
/// cheap to clone and shares the same underlying tables.
#[derive(Clone)]
pub struct Node {
    pub config: NodeConfig,
    pub peers: PeerStore,
    pub aggregator: Aggregator,
    pub registry: ConnectionRegistry,
    pub scheduler: Scheduler,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        provider: Arc<dyn ExecutionProvider>,
        connector: Option<Arc<dyn Connector>>,
    ) -> Self {
        let peers = PeerStore::new();
        let aggregator = Aggregator::new(peers.clone());
        let registry = ConnectionRegistry::new(
            config.clone(),
            peers.clone(),
            aggregator.clone(),
            provider.clone(),
            connector,
        );
        let scheduler = Scheduler::new(
            config.clone(),
            peers.clone(),
            aggregator.clone(),
            registry.clone(),
            provider,
        );
        tracing::info!(node = %config.node_id, "🧵 Node initialised");
        Self { config, peers, aggregator, registry, scheduler }
    }
}
