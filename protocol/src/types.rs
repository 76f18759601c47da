use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opaque peer identifier. Nodes use their reachable address.
pub type PeerId = String;

/// Unique task identifier
pub type TaskId = String;

/// Output frame size of a tile-render task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// A rectangle of the output frame, in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, px: f64, py: f64) -> bool {
        px >= self.x as f64
            && px < (self.x + self.width) as f64
            && py >= self.y as f64
            && py < (self.y + self.height) as f64
    }
}

/// Half-open index range `[start, end)` into a task's input array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: usize,
    pub end: usize,
}

impl ChunkRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Position {
    /// Simplified camera projection into screen space.
    pub fn project_to_screen(&self) -> (f64, f64) {
        (self.x * 100.0 + 400.0, self.y * 100.0 + 300.0)
    }
}

/// A scene object. Everything besides the position is passed through to the
/// renderer untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub position: Position,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    TileRender,
    ArrayReduce,
}

/// Reduction operator applied to chunk results
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReduceOp {
    #[default]
    Sum,
    Mean,
}

impl ReduceOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReduceOp::Sum => "sum",
            ReduceOp::Mean => "mean",
        }
    }

    /// Applies the operator to a flat list of numbers.
    pub fn apply(&self, numbers: &[f64]) -> Option<f64> {
        match self {
            ReduceOp::Sum => Some(numbers.iter().sum()),
            ReduceOp::Mean if numbers.is_empty() => None,
            ReduceOp::Mean => Some(numbers.iter().sum::<f64>() / numbers.len() as f64),
        }
    }

    /// Combines per-chunk results given as `(value, chunk_len)` pairs, in
    /// chunk order. Mean is weighted by chunk length.
    pub fn combine(&self, parts: &[(f64, usize)]) -> Option<f64> {
        if parts.is_empty() {
            return None;
        }
        match self {
            ReduceOp::Sum => Some(parts.iter().map(|(v, _)| v).sum()),
            ReduceOp::Mean => {
                let total: usize = parts.iter().map(|(_, n)| n).sum();
                if total == 0 {
                    return None;
                }
                let weighted: f64 = parts.iter().map(|(v, n)| v * *n as f64).sum();
                Some(weighted / total as f64)
            }
        }
    }
}

impl std::str::FromStr for ReduceOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sum" => Ok(ReduceOp::Sum),
            "mean" => Ok(ReduceOp::Mean),
            other => Err(format!("unsupported reduction: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub resolution: Resolution,
    #[serde(default)]
    pub scene: serde_json::Value,
    #[serde(default)]
    pub objects: Vec<SceneObject>,
    #[serde(default)]
    pub quality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReduceRequest {
    pub numbers: Vec<f64>,
    #[serde(default)]
    pub operation: ReduceOp,
    /// Number of chunks; defaults to the number of eligible peers
    #[serde(default)]
    pub num_peers: Option<usize>,
}

/// Work submitted by a caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum TaskPayload {
    TileRender(RenderRequest),
    ArrayReduce(ReduceRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Settlement {
    Success,
    Timeout,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "outcome")]
pub enum SubTaskStatus {
    Pending,
    Sent,
    Settled(Settlement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTaskRegion {
    Tile(Viewport),
    Chunk(ChunkRange),
}

/// An independently dispatchable unit of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubTask {
    pub id: String,
    pub region: SubTaskRegion,
    pub priority: f64,
    pub estimated_duration: f64,
    pub assigned_peer_id: Option<PeerId>,
    pub status: SubTaskStatus,
    /// What the remote execution provider receives
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default = "new_task_id")]
    pub id: TaskId,
    #[serde(flatten)]
    pub payload: TaskPayload,
    #[serde(default)]
    pub sub_tasks: Vec<SubTask>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn new_task_id() -> TaskId {
    uuid::Uuid::new_v4().to_string()
}

impl Task {
    pub fn new(payload: TaskPayload) -> Self {
        Self {
            id: new_task_id(),
            payload,
            sub_tasks: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self.payload {
            TaskPayload::TileRender(_) => TaskKind::TileRender,
            TaskPayload::ArrayReduce(_) => TaskKind::ArrayReduce,
        }
    }
}

/// A sub-task result delivered by a peer
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub peer_id: PeerId,
    pub result: serde_json::Value,
    pub duration: Duration,
}

/// The combined answer for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub kind: TaskKind,
    /// Base64 encoded RGBA canvas (tile-render only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub combined_frame: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// Slowest fulfilled sub-task, in milliseconds
    pub render_time: u64,
    pub peers_used: usize,
    pub failed: usize,
    pub fallback: bool,
}

impl TaskResult {
    /// Degraded outcome telling the caller to run the task locally.
    pub fn fallback(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            kind: task.kind(),
            combined_frame: None,
            value: None,
            render_time: 0,
            peers_used: 0,
            failed: task.sub_tasks.len(),
            fallback: true,
        }
    }
}

/// Node-wide scheduling configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's identifier, announced in handshakes
    pub node_id: PeerId,
    /// Deadline for every dispatched sub-task
    pub sub_task_deadline: Duration,
    /// Tile grid columns for tile-render decomposition
    pub grid_columns: u32,
    /// Tile grid rows for tile-render decomposition
    pub grid_rows: u32,
    /// Peers at or below this reliability are never scheduled
    pub reliability_threshold: f64,
    /// Upper bound on a local provider call serving a peer's job request
    pub provider_timeout: Duration,
    /// Capability score announced to peers (trusted, not measured)
    pub capability_score: Option<f64>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            sub_task_deadline: Duration::from_millis(5000),
            grid_columns: 2,
            grid_rows: 2,
            reliability_threshold: 0.5,
            provider_timeout: Duration::from_secs(10),
            capability_score: None,
        }
    }
}
