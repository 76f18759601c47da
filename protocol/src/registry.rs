use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

use crate::aggregator::Aggregator;
use crate::error::{Error, Result};
use crate::message::{Handshake, JobRequest, JobResult, PeerMessage};
use crate::peer::PeerStore;
use crate::provider::{execute_with_timeout, ExecutionProvider};
use crate::types::{NodeConfig, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Transport went away; kept for status reporting until the peer reconnects
    /// or is disconnected
    Closed,
}

/// An opaque bidirectional message channel to one peer. Transports bridge
/// their socket to this pair of queues; dropping `outbound` closes the link.
pub struct PeerChannel {
    pub outbound: mpsc::UnboundedSender<PeerMessage>,
    pub inbound: mpsc::UnboundedReceiver<PeerMessage>,
}

impl PeerChannel {
    /// Two in-memory channel ends wired to each other.
    pub fn pair() -> (PeerChannel, PeerChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            PeerChannel { outbound: a_tx, inbound: b_rx },
            PeerChannel { outbound: b_tx, inbound: a_rx },
        )
    }
}

/// Opens outbound channels to peers by id.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, peer_id: &str) -> Result<PeerChannel>;
}

struct Connection {
    direction: Direction,
    state: ConnectionState,
    generation: u64,
    outbox: Option<mpsc::UnboundedSender<PeerMessage>>,
}

/// Snapshot of one connection for status reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub direction: Direction,
    pub state: ConnectionState,
}

struct Inner {
    config: NodeConfig,
    connections: RwLock<HashMap<PeerId, Connection>>,
    peers: PeerStore,
    aggregator: Aggregator,
    provider: Arc<dyn ExecutionProvider>,
    connector: Option<Arc<dyn Connector>>,
    generation: AtomicU64,
}

/// Owns every live peer connection and routes inbound messages.
///
/// Can be cloned to obtain another handle to the same registry.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(
        config: NodeConfig,
        peers: PeerStore,
        aggregator: Aggregator,
        provider: Arc<dyn ExecutionProvider>,
        connector: Option<Arc<dyn Connector>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connections: RwLock::new(HashMap::new()),
                peers,
                aggregator,
                provider,
                connector,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.config.node_id
    }

    /// Opens an outbound connection. Connecting to a peer that is already
    /// connected or connecting is a no-op.
    ///
    /// When both nodes dial each other at once, the link dialled by the
    /// lower node id survives on both sides.
    pub async fn connect(&self, peer_id: &str) -> Result<()> {
        let connector = self.inner.connector.clone().ok_or_else(|| Error::ConnectFailed {
            peer: peer_id.to_string(),
            reason: "no connector configured".into(),
        })?;

        let Some(generation) = self.reserve(peer_id, Direction::Outbound).await else {
            tracing::debug!(peer = %peer_id, "Already connected to peer");
            return Ok(());
        };

        tracing::info!(peer = %peer_id, "Connecting to peer");
        match connector.open(peer_id).await {
            Ok(channel) => {
                self.open(peer_id, generation, channel).await;
                Ok(())
            }
            Err(e) => {
                self.forget(peer_id, generation).await;
                tracing::warn!(peer = %peer_id, error = %e, "Outbound connection failed");
                Err(match e {
                    Error::ConnectFailed { .. } => e,
                    other => Error::ConnectFailed { peer: peer_id.to_string(), reason: other.to_string() },
                })
            }
        }
    }

    /// Adopts an inbound channel. Returns `false` (and drops the channel)
    /// when the peer already has a connection, unless it is our own outbound
    /// dial to a peer with a lower id.
    pub async fn accept(&self, peer_id: &str, channel: PeerChannel) -> bool {
        let Some(generation) = self.reserve(peer_id, Direction::Inbound).await else {
            tracing::info!(peer = %peer_id, "Rejecting duplicate inbound connection");
            return false;
        };
        tracing::info!(peer = %peer_id, "Incoming connection");
        self.open(peer_id, generation, channel).await;
        true
    }

    /// Sends a message over an open connection.
    pub async fn send(&self, peer_id: &str, message: PeerMessage) -> Result<()> {
        let connections = self.inner.connections.read().await;
        let outbox = connections
            .get(peer_id)
            .filter(|c| c.state == ConnectionState::Open)
            .and_then(|c| c.outbox.as_ref())
            .ok_or_else(|| Error::PeerNotConnected(peer_id.to_string()))?;
        outbox
            .send(message)
            .map_err(|_| Error::PeerNotConnected(peer_id.to_string()))
    }

    /// Routes one inbound message. Never blocks on provider work.
    pub async fn dispatch(&self, peer_id: &str, message: PeerMessage) {
        match message {
            PeerMessage::Handshake(hs) => self.handle_handshake(peer_id, hs).await,
            PeerMessage::JobRequest(req) => self.handle_job_request(peer_id, req),
            PeerMessage::JobResult(res) => self.inner.aggregator.handle_result(peer_id, res).await,
        }
    }

    /// Closes the connection to `peer_id`, forgets its performance record
    /// and fails its in-flight assignments. Also reaps a `Closed` record,
    /// but only reports `true` for a live connection.
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        let removed = self.inner.connections.write().await.remove(peer_id);
        match removed {
            Some(conn) if conn.state != ConnectionState::Closed => {
                self.closed(peer_id, conn.direction).await;
                true
            }
            _ => false,
        }
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.inner
            .connections
            .read()
            .await
            .get(peer_id)
            .is_some_and(|c| c.state == ConnectionState::Open)
    }

    pub async fn connected_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .inner
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, c)| c.state == ConnectionState::Open)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn connections(&self) -> Vec<ConnectionInfo> {
        let mut all: Vec<ConnectionInfo> = self
            .inner
            .connections
            .read()
            .await
            .iter()
            .map(|(id, c)| ConnectionInfo {
                peer_id: id.clone(),
                direction: c.direction,
                state: c.state,
            })
            .collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }

    /// Inserts a `Connecting` record unless the peer already has a live one.
    /// Replacing a record drops its outbox, which closes that link.
    async fn reserve(&self, peer_id: &str, direction: Direction) -> Option<u64> {
        if peer_id == self.local_id() {
            tracing::debug!(peer = %peer_id, "Refusing connection to ourselves");
            return None;
        }
        let mut connections = self.inner.connections.write().await;
        if let Some(existing) = connections.get(peer_id) {
            let crossed = direction == Direction::Inbound
                && existing.direction == Direction::Outbound
                && peer_id < self.local_id();
            match existing.state {
                ConnectionState::Closed => {}
                _ if crossed => {
                    tracing::info!(peer = %peer_id, "Simultaneous connect, keeping the peer's dial");
                }
                _ => return None,
            }
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        connections.insert(
            peer_id.to_string(),
            Connection {
                direction,
                state: ConnectionState::Connecting,
                generation,
                outbox: None,
            },
        );
        Some(generation)
    }

    async fn forget(&self, peer_id: &str, generation: u64) {
        let mut connections = self.inner.connections.write().await;
        if connections.get(peer_id).is_some_and(|c| c.generation == generation) {
            connections.remove(peer_id);
        }
    }

    async fn open(&self, peer_id: &str, generation: u64, channel: PeerChannel) {
        let PeerChannel { outbound, mut inbound } = channel;
        {
            let mut connections = self.inner.connections.write().await;
            match connections.get_mut(peer_id) {
                Some(conn) if conn.generation == generation => {
                    conn.state = ConnectionState::Open;
                    conn.outbox = Some(outbound);
                }
                // disconnected while the transport was still opening
                _ => return,
            }
        }

        self.inner.peers.add(peer_id).await;

        let handshake = PeerMessage::Handshake(Handshake {
            peer_id: self.local_id().to_string(),
            timestamp: Utc::now().timestamp_millis(),
            capability_score: self.inner.config.capability_score,
        });
        if let Err(e) = self.send(peer_id, handshake).await {
            tracing::warn!(peer = %peer_id, error = %e, "Failed to send handshake");
        }
        tracing::info!(peer = %peer_id, generation = generation, "🤝 Connection open");

        let this = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                tracing::trace!(peer = %peer_id, kind = message.label(), "Inbound message");
                this.dispatch(&peer_id, message).await;
            }
            this.on_close(&peer_id, generation).await;
        });
    }

    /// Transport closed. Stale generations are ignored so a reconnect is
    /// never torn down by its predecessor's reader.
    async fn on_close(&self, peer_id: &str, generation: u64) {
        let direction = {
            let mut connections = self.inner.connections.write().await;
            match connections.get_mut(peer_id) {
                Some(conn) if conn.generation == generation && conn.state != ConnectionState::Closed => {
                    conn.state = ConnectionState::Closed;
                    conn.outbox = None;
                    Some(conn.direction)
                }
                _ => None,
            }
        };
        if let Some(direction) = direction {
            self.closed(peer_id, direction).await;
        }
    }

    async fn closed(&self, peer_id: &str, direction: Direction) {
        tracing::info!(peer = %peer_id, direction = ?direction, "Connection closed");
        self.inner.peers.remove(peer_id).await;
        self.inner.aggregator.fail_peer(peer_id).await;
    }

    async fn handle_handshake(&self, peer_id: &str, hs: Handshake) {
        if hs.peer_id != peer_id {
            tracing::debug!(peer = %peer_id, announced = %hs.peer_id, "Peer announced a different id");
        }
        if let Some(score) = hs.capability_score {
            self.inner.peers.set_capability(peer_id, score).await;
        }
        tracing::info!(peer = %peer_id, timestamp = hs.timestamp, "Connection established");
    }

    fn handle_job_request(&self, peer_id: &str, req: JobRequest) {
        tracing::info!(
            peer = %peer_id,
            task_id = %req.task_id,
            job_id = %req.job_id,
            kind = ?req.kind,
            "📋 Received job request"
        );
        let this = self.clone();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            let provider = this.inner.provider.as_ref();
            let result = match execute_with_timeout(provider, &req.payload, this.inner.config.provider_timeout).await {
                Ok(out) => {
                    tracing::debug!(job_id = %req.job_id, ms = out.duration.as_millis() as u64, "Job executed");
                    out.output
                }
                Err(e) => {
                    tracing::warn!(job_id = %req.job_id, provider = provider.name(), error = %e, "Job failed");
                    serde_json::Value::Null
                }
            };
            let reply = PeerMessage::JobResult(JobResult { result, job_id: req.job_id.clone() });
            if let Err(e) = this.send(&peer_id, reply).await {
                tracing::warn!(job_id = %req.job_id, error = %e, "Could not return job result");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::JobKind;
    use crate::provider::BuiltinProvider;
    use serde_json::json;
    use std::future::Future;
    use std::time::Duration;

    struct Side {
        registry: ConnectionRegistry,
        peers: PeerStore,
        aggregator: Aggregator,
    }

    fn side(id: &str, connector: Option<Arc<dyn Connector>>) -> Side {
        let peers = PeerStore::new();
        let aggregator = Aggregator::new(peers.clone());
        let config = NodeConfig { node_id: id.into(), capability_score: Some(0.8), ..Default::default() };
        let registry = ConnectionRegistry::new(
            config,
            peers.clone(),
            aggregator.clone(),
            Arc::new(BuiltinProvider),
            connector,
        );
        Side { registry, peers, aggregator }
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn linked() -> (Side, Side) {
        let a = side("a", None);
        let b = side("b", None);
        let (end_a, end_b) = PeerChannel::pair();
        assert!(a.registry.accept("b", end_a).await);
        assert!(b.registry.accept("a", end_b).await);
        (a, b)
    }

    #[tokio::test]
    async fn test_handshake_registers_peers() {
        let (a, b) = linked().await;
        assert!(a.registry.is_connected("b").await);
        assert_eq!(b.registry.connected_peers().await, vec!["a".to_string()]);
        // capability travels in the handshake
        let peers = a.peers.clone();
        eventually(|| {
            let peers = peers.clone();
            async move { peers.get("b").await.and_then(|r| r.capability_score) == Some(0.8) }
        })
        .await;
    }

    #[tokio::test]
    async fn test_duplicate_accept_is_noop() {
        let (a, _b) = linked().await;
        let (extra, _other) = PeerChannel::pair();
        assert!(!a.registry.accept("b", extra).await);
        assert_eq!(a.registry.connections().await.len(), 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let a = side("a", None);
        let res = a
            .registry
            .send("ghost", PeerMessage::JobResult(JobResult { result: json!(1), job_id: "x".into() }))
            .await;
        assert_eq!(res, Err(Error::PeerNotConnected("ghost".into())));
    }

    #[tokio::test]
    async fn test_job_round_trip() {
        let (a, _b) = linked().await;
        let rx = a
            .aggregator
            .register("chunk_0_1", "b", Duration::from_secs(5))
            .await
            .unwrap();
        a.registry
            .send(
                "b",
                PeerMessage::JobRequest(JobRequest {
                    kind: JobKind::Job,
                    task_id: "t".into(),
                    job_id: "chunk_0_1".into(),
                    payload: json!({ "numbers": [1, 2, 3], "operation": "sum" }),
                }),
            )
            .await
            .unwrap();

        let done = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap().unwrap();
        assert_eq!(done.peer_id, "b");
        assert_eq!(done.result, json!(6.0));
    }

    #[tokio::test]
    async fn test_failed_remote_job_returns_null() {
        let (a, _b) = linked().await;
        let rx = a.aggregator.register("j", "b", Duration::from_secs(5)).await.unwrap();
        a.registry
            .send(
                "b",
                PeerMessage::JobRequest(JobRequest {
                    kind: JobKind::Job,
                    task_id: "t".into(),
                    job_id: "j".into(),
                    payload: json!({ "operation": "matrix_mult" }),
                }),
            )
            .await
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(Error::ProviderFailure(_))));
    }

    #[tokio::test]
    async fn test_disconnect_fails_assignments_and_forgets_peer() {
        let (a, b) = linked().await;
        let rx = a.aggregator.register("j", "b", Duration::from_secs(5)).await.unwrap();

        assert!(a.registry.disconnect("b").await);
        assert_eq!(rx.await.unwrap(), Err(Error::PeerDisconnected("b".into())));
        assert!(a.peers.get("b").await.is_none());
        assert!(!a.registry.disconnect("b").await);

        // the far side notices the closed channel and keeps the record
        let registry = b.registry.clone();
        eventually(|| {
            let registry = registry.clone();
            async move { !registry.is_connected("a").await }
        })
        .await;
        assert!(b.peers.get("a").await.is_none());
        let conns = b.registry.connections().await;
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].state, ConnectionState::Closed);

        // a closed record does not block a reconnect
        let (again, _remote) = PeerChannel::pair();
        assert!(b.registry.accept("a", again).await);
        assert_eq!(b.registry.connections().await[0].state, ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_disconnect_reaps_closed_record() {
        let a = side("a", None);
        let (end, remote) = PeerChannel::pair();
        assert!(a.registry.accept("b", end).await);
        drop(remote);
        let registry = a.registry.clone();
        eventually(|| {
            let registry = registry.clone();
            async move { registry.connections().await.first().is_some_and(|c| c.state == ConnectionState::Closed) }
        })
        .await;

        assert!(!a.registry.disconnect("b").await);
        assert!(a.registry.connections().await.is_empty());
    }

    struct PairConnector {
        remote: ConnectionRegistry,
        local_id: String,
    }

    #[async_trait]
    impl Connector for PairConnector {
        async fn open(&self, peer_id: &str) -> Result<PeerChannel> {
            if peer_id != self.remote.local_id() {
                return Err(Error::ConnectFailed { peer: peer_id.into(), reason: "unreachable".into() });
            }
            let (ours, theirs) = PeerChannel::pair();
            self.remote.accept(&self.local_id, theirs).await;
            Ok(ours)
        }
    }

    #[tokio::test]
    async fn test_outbound_connect_through_connector() {
        let b = side("b", None);
        let connector: Arc<dyn Connector> = Arc::new(PairConnector {
            remote: b.registry.clone(),
            local_id: "a".into(),
        });
        let a = side("a", Some(connector));

        a.registry.connect("b").await.unwrap();
        assert!(a.registry.is_connected("b").await);
        assert!(b.registry.is_connected("a").await);
        // second connect is a no-op
        a.registry.connect("b").await.unwrap();
        assert_eq!(a.registry.connections().await[0].direction, Direction::Outbound);

        let err = a.registry.connect("c").await.unwrap_err();
        assert!(matches!(err, Error::ConnectFailed { .. }));
        assert!(!a.registry.is_connected("c").await);
        assert_eq!(a.registry.connections().await.len(), 1);
    }

    /// In-memory network whose connectors take a while to reach the remote
    #[derive(Clone, Default)]
    struct Network(Arc<std::sync::Mutex<HashMap<String, ConnectionRegistry>>>);

    impl Network {
        fn join(&self, registry: &ConnectionRegistry) {
            self.0.lock().unwrap().insert(registry.local_id().to_string(), registry.clone());
        }

        fn connector(&self, local_id: &str, delay: Duration) -> Arc<dyn Connector> {
            Arc::new(DelayedConnector { network: self.clone(), local_id: local_id.into(), delay })
        }
    }

    struct DelayedConnector {
        network: Network,
        local_id: String,
        delay: Duration,
    }

    #[async_trait]
    impl Connector for DelayedConnector {
        async fn open(&self, peer_id: &str) -> Result<PeerChannel> {
            let remote = self.network.0.lock().unwrap().get(peer_id).cloned();
            let remote = remote.ok_or_else(|| Error::ConnectFailed { peer: peer_id.into(), reason: "unknown".into() })?;
            let (ours, theirs) = PeerChannel::pair();
            tokio::time::sleep(self.delay).await;
            remote.accept(&self.local_id, theirs).await;
            Ok(ours)
        }
    }

    #[tokio::test]
    async fn test_simultaneous_connect_keeps_one_link() {
        let network = Network::default();
        let a = side("a", Some(network.connector("a", Duration::from_millis(20))));
        let b = side("b", Some(network.connector("b", Duration::from_millis(20))));
        network.join(&a.registry);
        network.join(&b.registry);

        let (to_b, to_a) = tokio::join!(a.registry.connect("b"), b.registry.connect("a"));
        to_b.unwrap();
        to_a.unwrap();

        let (ra, rb) = (a.registry.clone(), b.registry.clone());
        eventually(|| {
            let (ra, rb) = (ra.clone(), rb.clone());
            async move { ra.is_connected("b").await && rb.is_connected("a").await }
        })
        .await;
        // "a" sorts lower, so its dial is the surviving link
        assert_eq!(a.registry.connections().await[0].direction, Direction::Outbound);
        assert_eq!(b.registry.connections().await[0].direction, Direction::Inbound);

        let rx = b.aggregator.register("j", "a", Duration::from_secs(5)).await.unwrap();
        b.registry
            .send(
                "a",
                PeerMessage::JobRequest(JobRequest {
                    kind: JobKind::Job,
                    task_id: "t".into(),
                    job_id: "j".into(),
                    payload: json!({ "numbers": [2, 3], "operation": "sum" }),
                }),
            )
            .await
            .unwrap();
        let done = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap().unwrap();
        assert_eq!(done.result, json!(5.0));
        assert!(a.peers.get("b").await.is_some());
        assert!(b.peers.get("a").await.is_some());
    }

    #[tokio::test]
    async fn test_stale_close_does_not_remove_reconnect() {
        let a = side("a", None);
        let (first, first_remote) = PeerChannel::pair();
        assert!(a.registry.accept("b", first).await);
        assert!(a.registry.disconnect("b").await);

        let (second, _second_remote) = PeerChannel::pair();
        assert!(a.registry.accept("b", second).await);

        // the first link's remote end goes away; its reader must not tear
        // down the second connection
        drop(first_remote);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a.registry.is_connected("b").await);
    }
}
