use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::types::PeerId;

/// Capability assumed for peers that never announced one
pub const DEFAULT_CAPABILITY: f64 = 0.5;
pub const MIN_RELIABILITY: f64 = 0.1;
pub const MAX_RELIABILITY: f64 = 1.0;

const LATENCY_WEIGHT: f64 = 0.3;
const RELIABILITY_WEIGHT: f64 = 0.3;
const LOAD_WEIGHT: f64 = 0.2;
const CAPABILITY_WEIGHT: f64 = 0.2;

/// Rolling performance statistics for one connected peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Externally supplied, trusted as-is
    pub capability_score: Option<f64>,
    /// Sum of estimated durations assigned so far
    pub current_load: f64,
    /// Exponential moving average, in milliseconds
    pub average_latency: f64,
    pub reliability_score: f64,
    pub last_active: DateTime<Utc>,
}

impl PeerRecord {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            capability_score: None,
            current_load: 0.0,
            average_latency: 0.0,
            reliability_score: MAX_RELIABILITY,
            last_active: Utc::now(),
        }
    }

    /// Weighted score in `[0, 1]`, higher is better.
    pub fn score(&self) -> f64 {
        let latency_score = (1000.0 - self.average_latency).max(0.0) / 1000.0;
        let load_score = (1.0 - self.current_load / 1000.0).max(0.0);
        let capability = self.capability_score.unwrap_or(DEFAULT_CAPABILITY);

        latency_score * LATENCY_WEIGHT
            + self.reliability_score * RELIABILITY_WEIGHT
            + load_score * LOAD_WEIGHT
            + capability * CAPABILITY_WEIGHT
    }

    /// Folds one settled sub-task into the rolling statistics.
    pub fn update(&mut self, latency_ms: f64, success: bool) {
        self.average_latency = self.average_latency * 0.8 + latency_ms * 0.2;
        self.reliability_score = if success {
            (self.reliability_score + 0.01).min(MAX_RELIABILITY)
        } else {
            (self.reliability_score - 0.1).max(MIN_RELIABILITY)
        };
        self.last_active = Utc::now();
    }

    pub fn is_eligible(&self, threshold: f64) -> bool {
        self.reliability_score > threshold
    }
}

/// The in-memory performance table. All methods are synchronous; the
/// [`PeerStore`] handle serialises access.
#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerTable {
    /// Registers a peer; an existing record is kept.
    pub fn add(&mut self, peer_id: &str) -> &mut PeerRecord {
        self.peers.entry(peer_id.to_string()).or_insert_with(|| {
            tracing::info!(peer = %peer_id, "🌐 Peer joined performance table");
            PeerRecord::new(peer_id.to_string())
        })
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.remove(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn get_mut(&mut self, peer_id: &str) -> Option<&mut PeerRecord> {
        self.peers.get_mut(peer_id)
    }

    pub fn score(&self, peer_id: &str) -> Option<f64> {
        self.peers.get(peer_id).map(PeerRecord::score)
    }

    /// Applies a settlement to a known peer. Unknown peers are ignored.
    pub fn update(&mut self, peer_id: &str, latency_ms: f64, success: bool) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.update(latency_ms, success);
            tracing::debug!(
                peer = %peer_id,
                latency_ms = latency_ms,
                success = success,
                reliability = peer.reliability_score,
                avg_latency = peer.average_latency,
                "Updated peer performance"
            );
        }
    }

    pub fn set_capability(&mut self, peer_id: &str, score: f64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.capability_score = Some(score.clamp(0.0, 1.0));
        }
    }

    pub fn add_load(&mut self, peer_id: &str, estimated_duration: f64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.current_load += estimated_duration;
        }
    }

    pub fn release_load(&mut self, peer_id: &str, estimated_duration: f64) {
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.current_load = (peer.current_load - estimated_duration).max(0.0);
        }
    }

    /// Peers above the reliability threshold, highest score first. Ties
    /// are broken by peer id so the order is deterministic.
    pub fn ranked_eligible(&self, threshold: f64) -> Vec<PeerId> {
        let mut eligible: Vec<(&PeerId, f64)> = self
            .peers
            .values()
            .filter(|p| p.is_eligible(threshold))
            .map(|p| (&p.peer_id, p.score()))
            .collect();
        eligible.sort_by(|(a_id, a), (b_id, b)| b.total_cmp(a).then_with(|| a_id.cmp(b_id)));
        eligible.into_iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn records(&self) -> Vec<PeerRecord> {
        let mut all: Vec<_> = self.peers.values().cloned().collect();
        all.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        all
    }
}

/// Shared handle to the performance table
#[derive(Clone, Default)]
pub struct PeerStore {
    table: Arc<RwLock<PeerTable>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, peer_id: &str) {
        self.table.write().await.add(peer_id);
    }

    pub async fn remove(&self, peer_id: &str) -> Option<PeerRecord> {
        let removed = self.table.write().await.remove(peer_id);
        if removed.is_some() {
            tracing::info!(peer = %peer_id, "💀 Peer left performance table");
        }
        removed
    }

    pub async fn update(&self, peer_id: &str, latency_ms: f64, success: bool) {
        self.table.write().await.update(peer_id, latency_ms, success);
    }

    pub async fn set_capability(&self, peer_id: &str, score: f64) {
        self.table.write().await.set_capability(peer_id, score);
    }

    pub async fn score(&self, peer_id: &str) -> Option<f64> {
        self.table.read().await.score(peer_id)
    }

    pub async fn get(&self, peer_id: &str) -> Option<PeerRecord> {
        self.table.read().await.get(peer_id).cloned()
    }

    pub async fn snapshot(&self) -> Vec<PeerRecord> {
        self.table.read().await.records()
    }

    pub async fn count(&self) -> usize {
        self.table.read().await.len()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, PeerTable> {
        self.table.read().await
    }

    /// Exclusive access, used when ranking and loading peers must observe
    /// one consistent snapshot.
    pub async fn write(&self) -> RwLockWriteGuard<'_, PeerTable> {
        self.table.write().await
    }
}
