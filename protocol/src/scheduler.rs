//! Task decomposition, peer assignment and dispatch.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::aggregator::{combine, settle_all, Aggregator, Outcome};
use crate::error::{Error, Result};
use crate::frame::MAX_FRAME_PIXELS;
use crate::message::{JobKind, JobRequest, PeerMessage};
use crate::peer::PeerStore;
use crate::pipeline::{run_chunked, split_chunks};
use crate::provider::{execute_with_timeout, ExecutionProvider};
use crate::registry::ConnectionRegistry;
use crate::types::{
    NodeConfig, ReduceRequest, RenderRequest, Resolution, SubTask, SubTaskRegion, SubTaskStatus, Task,
    TaskPayload, TaskResult, Viewport,
};

/// Floor for any sub-task's duration estimate
const MIN_ESTIMATE: f64 = 100.0;

/// Splits a frame into a `columns`×`rows` grid. The last column and row
/// absorb any remainder so the tiles cover the whole frame. Each tile gets
/// the objects that project into it.
pub fn decompose_tiles(
    task_id: &str,
    req: &RenderRequest,
    columns: u32,
    rows: u32,
    stamp: i64,
) -> Result<Vec<SubTask>> {
    check_resolution(req)?;
    let (width, height) = (req.resolution.width, req.resolution.height);
    if columns == 0 || rows == 0 || width < columns || height < rows {
        return Err(Error::InvalidTask(format!(
            "cannot split {width}x{height} into a {columns}x{rows} grid"
        )));
    }
    let tile_w = width / columns;
    let tile_h = height / rows;

    let mut tiles = Vec::with_capacity((columns * rows) as usize);
    for row in 0..rows {
        for col in 0..columns {
            let viewport = Viewport {
                x: col * tile_w,
                y: row * tile_h,
                width: if col + 1 == columns { width - col * tile_w } else { tile_w },
                height: if row + 1 == rows { height - row * tile_h } else { tile_h },
            };
            let objects: Vec<_> = req
                .objects
                .iter()
                .filter(|o| {
                    let (sx, sy) = o.position.project_to_screen();
                    viewport.contains(sx, sy)
                })
                .collect();

            tiles.push(SubTask {
                id: format!("{task_id}_tile_{col}_{row}_{stamp}"),
                region: SubTaskRegion::Tile(viewport),
                priority: tile_priority(col, row, columns, rows),
                estimated_duration: estimate_render(objects.len(), viewport.pixel_count()),
                assigned_peer_id: None,
                status: SubTaskStatus::Pending,
                payload: json!({
                    "operation": "render_frame",
                    "viewport": viewport,
                    "scene": req.scene,
                    "objects": objects,
                    "quality": req.quality,
                    "timestamp": stamp,
                }),
            });
        }
    }
    Ok(tiles)
}

fn check_resolution(req: &RenderRequest) -> Result<()> {
    let Resolution { width, height } = req.resolution;
    if u64::from(width) * u64::from(height) > MAX_FRAME_PIXELS {
        return Err(Error::InvalidTask(format!(
            "resolution {width}x{height} exceeds {MAX_FRAME_PIXELS} pixels"
        )));
    }
    Ok(())
}

/// 1.0 at the frame centre, falling towards 0 in the corners.
fn tile_priority(col: u32, row: u32, columns: u32, rows: u32) -> f64 {
    let cx = (2 * col + 1) as f64 / columns as f64 - 1.0;
    let cy = (2 * row + 1) as f64 / rows as f64 - 1.0;
    1.0 - (cx * cx + cy * cy).sqrt() / std::f64::consts::SQRT_2
}

fn estimate_render(objects: usize, pixels: u64) -> f64 {
    (objects as f64 * 2.0 + pixels as f64 / 10_000.0).max(MIN_ESTIMATE)
}

/// Splits the input array into `n` balanced chunks, dropping empty ones.
pub fn decompose_chunks(task_id: &str, req: &ReduceRequest, n: usize, stamp: i64) -> Result<Vec<SubTask>> {
    if req.numbers.is_empty() {
        return Err(Error::InvalidTask("nothing to reduce".into()));
    }
    if n == 0 {
        return Err(Error::InvalidTask("numPeers must be at least 1".into()));
    }
    // more chunks than items would only produce empty ones
    let n = n.min(req.numbers.len());
    Ok(split_chunks(req.numbers.len(), n)
        .into_iter()
        .filter(|range| !range.is_empty())
        .enumerate()
        .map(|(i, range)| SubTask {
            id: format!("{task_id}_chunk_{i}_{stamp}"),
            region: SubTaskRegion::Chunk(range),
            priority: 1.0,
            estimated_duration: (range.len() as f64).max(MIN_ESTIMATE),
            assigned_peer_id: None,
            status: SubTaskStatus::Pending,
            payload: json!({
                "numbers": &req.numbers[range.start..range.end],
                "operation": req.operation.as_str(),
            }),
        })
        .collect())
}

/// Decides which peer runs which sub-task and waits for the outcome.
///
/// Can be cloned to obtain another handle to the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    config: NodeConfig,
    peers: PeerStore,
    aggregator: Aggregator,
    registry: ConnectionRegistry,
    provider: Arc<dyn ExecutionProvider>,
}

impl Scheduler {
    pub fn new(
        config: NodeConfig,
        peers: PeerStore,
        aggregator: Aggregator,
        registry: ConnectionRegistry,
        provider: Arc<dyn ExecutionProvider>,
    ) -> Self {
        Self { config, peers, aggregator, registry, provider }
    }

    /// Decomposes `task` and assigns every sub-task to an eligible peer,
    /// highest score first, round-robin. Ranking and load accounting happen
    /// under one write lock. Sub-tasks end up in dispatch order.
    pub async fn assign(&self, task: &mut Task) -> Result<()> {
        let stamp = Utc::now().timestamp_millis();
        let mut table = self.peers.write().await;
        let ranked = table.ranked_eligible(self.config.reliability_threshold);
        if ranked.is_empty() {
            return Err(Error::NoPeersAvailable);
        }

        let mut subs = match &task.payload {
            TaskPayload::TileRender(req) => decompose_tiles(
                &task.id,
                req,
                self.config.grid_columns,
                self.config.grid_rows,
                stamp,
            )?,
            TaskPayload::ArrayReduce(req) => {
                let n = req.num_peers.unwrap_or(ranked.len());
                decompose_chunks(&task.id, req, n, stamp)?
            }
        };
        // stable: equal priorities keep grid order
        subs.sort_by(|a, b| b.priority.total_cmp(&a.priority));

        for (index, sub) in subs.iter_mut().enumerate() {
            let peer = &ranked[index % ranked.len()];
            table.add_load(peer, sub.estimated_duration);
            sub.assigned_peer_id = Some(peer.clone());
        }
        task.sub_tasks = subs;
        Ok(())
    }

    /// Distributes `task` across peers and resolves once every sub-task has
    /// settled. Fails with `NoPeersAvailable` before anything is sent.
    pub async fn submit(&self, mut task: Task) -> Result<TaskResult> {
        self.assign(&mut task).await?;
        tracing::info!(
            task_id = %task.id,
            kind = ?task.kind(),
            sub_tasks = task.sub_tasks.len(),
            "📦 Dispatching task"
        );

        let gates = self.dispatch(&mut task).await?;
        let outcomes = settle_all(gates).await;
        self.release(&task).await;

        let result = combine(&mut task, outcomes);
        tracing::info!(
            task_id = %task.id,
            peers_used = result.peers_used,
            failed = result.failed,
            fallback = result.fallback,
            render_time_ms = result.render_time,
            "Task settled"
        );
        Ok(result)
    }

    /// Like [`Scheduler::submit`], but runs the task on the local provider
    /// when no peer is eligible or no sub-task succeeded.
    pub async fn submit_or_run_locally(&self, task: Task) -> Result<TaskResult> {
        match self.submit(task.clone()).await {
            Ok(result) if !result.fallback => Ok(result),
            Ok(_) | Err(Error::NoPeersAvailable) => {
                tracing::warn!(task_id = %task.id, "Peer network could not complete task, running locally");
                self.run_locally(&task).await
            }
            Err(e) => Err(e),
        }
    }

    /// Runs the whole task on this node's provider.
    pub async fn run_locally(&self, task: &Task) -> Result<TaskResult> {
        let mut result = TaskResult::fallback(task);
        result.failed = 0;
        match &task.payload {
            TaskPayload::TileRender(req) => {
                check_resolution(req)?;
                let frame = Viewport {
                    x: 0,
                    y: 0,
                    width: req.resolution.width,
                    height: req.resolution.height,
                };
                let payload = json!({
                    "operation": "render_frame",
                    "viewport": frame,
                    "scene": req.scene,
                    "objects": req.objects,
                    "quality": req.quality,
                    "timestamp": Utc::now().timestamp_millis(),
                });
                let out = execute_with_timeout(self.provider.as_ref(), &payload, self.config.provider_timeout).await?;
                let data = out
                    .output
                    .get("frameData")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::ProviderFailure("local render returned no frame data".into()))?;
                result.combined_frame = Some(data.to_string());
                result.render_time = out.duration.as_millis() as u64;
            }
            TaskPayload::ArrayReduce(req) => {
                let started = std::time::Instant::now();
                let report = run_chunked(self.provider.as_ref(), req, 1, self.config.provider_timeout).await?;
                result.value = Some(report.value);
                result.render_time = started.elapsed().as_millis() as u64;
            }
        }
        Ok(result)
    }

    /// Registers and sends every sub-task. Gates come back in sub-task order.
    async fn dispatch(&self, task: &mut Task) -> Result<Vec<oneshot::Receiver<Outcome>>> {
        let kind = match task.payload {
            TaskPayload::TileRender(_) => JobKind::GameRender,
            TaskPayload::ArrayReduce(_) => JobKind::Job,
        };
        let deadline = self.config.sub_task_deadline;

        let mut gates = Vec::with_capacity(task.sub_tasks.len());
        for i in 0..task.sub_tasks.len() {
            let sub = &task.sub_tasks[i];
            let Some(peer) = sub.assigned_peer_id.clone() else {
                return Err(Error::InvalidTask(format!("sub-task {} was never assigned", sub.id)));
            };

            let gate = match self.aggregator.register(&sub.id, &peer, deadline).await {
                Ok(gate) => gate,
                Err(e) => {
                    for earlier in &task.sub_tasks[..i] {
                        self.aggregator.cancel(&earlier.id, e.clone()).await;
                    }
                    self.release(task).await;
                    return Err(e);
                }
            };

            let request = PeerMessage::JobRequest(JobRequest {
                kind,
                task_id: task.id.clone(),
                job_id: sub.id.clone(),
                payload: sub.payload.clone(),
            });
            if let Err(e) = self.registry.send(&peer, request).await {
                tracing::warn!(sub_task = %sub.id, peer = %peer, error = %e, "Send failed");
                self.aggregator.cancel(&sub.id, e).await;
            }
            task.sub_tasks[i].status = SubTaskStatus::Sent;
            gates.push(gate);
        }
        Ok(gates)
    }

    async fn release(&self, task: &Task) {
        let mut table = self.peers.write().await;
        for sub in &task.sub_tasks {
            if let Some(peer) = &sub.assigned_peer_id {
                table.release_load(peer, sub.estimated_duration);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::node::Node;
    use crate::provider::BuiltinProvider;
    use crate::registry::PeerChannel;
    use crate::types::{ChunkRange, Position, ReduceOp, Resolution, SceneObject, TaskKind};

    fn node(id: &str) -> Node {
        let config = NodeConfig { node_id: id.into(), ..Default::default() };
        Node::new(config, Arc::new(BuiltinProvider), None)
    }

    async fn link(a: &Node, b: &Node) {
        let (end_a, end_b) = PeerChannel::pair();
        a.registry.accept(b.registry.local_id(), end_a).await;
        b.registry.accept(a.registry.local_id(), end_b).await;
    }

    fn render(width: u32, height: u32, objects: Vec<SceneObject>) -> RenderRequest {
        RenderRequest {
            resolution: Resolution { width, height },
            scene: json!({ "name": "arena" }),
            objects,
            quality: Some("high".into()),
        }
    }

    fn object(x: f64, y: f64) -> SceneObject {
        SceneObject { position: Position { x, y, z: 0.0 }, attributes: Default::default() }
    }

    #[test]
    fn test_tile_grid_and_culling() {
        let req = render(800, 600, vec![object(0.0, 0.0), object(-3.0, -2.0)]);
        let tiles = decompose_tiles("t", &req, 2, 2, 1).unwrap();
        assert_eq!(tiles.len(), 4);
        assert_eq!(tiles[3].id, "t_tile_1_1_1");
        assert_eq!(tiles[3].region, SubTaskRegion::Tile(Viewport { x: 400, y: 300, width: 400, height: 300 }));
        // (0,0) projects to (400,300); (-3,-2) to (100,100)
        assert_eq!(tiles[0].payload["objects"].as_array().unwrap().len(), 1);
        assert_eq!(tiles[3].payload["objects"].as_array().unwrap().len(), 1);
        assert_eq!(tiles[1].payload["objects"].as_array().unwrap().len(), 0);
        for tile in &tiles {
            assert!((tile.priority - 0.5).abs() < 1e-9);
            assert_eq!(tile.estimated_duration, 100.0);
        }
    }

    #[test]
    fn test_tile_priority_and_remainder() {
        let tiles = decompose_tiles("t", &render(301, 301, vec![]), 3, 3, 1).unwrap();
        assert!((tiles[4].priority - 1.0).abs() < 1e-9);
        assert!((tiles[0].priority - 1.0 / 3.0).abs() < 1e-9);
        let SubTaskRegion::Tile(last) = tiles[8].region else { panic!("expected tile") };
        assert_eq!((last.x, last.width), (200, 101));

        let big = decompose_tiles("t", &render(4000, 3000, vec![]), 2, 2, 1).unwrap();
        // 2000×1500 pixels / 10000
        assert_eq!(big[0].estimated_duration, 300.0);

        assert!(decompose_tiles("t", &render(1, 1, vec![]), 2, 2, 1).is_err());
    }

    #[test]
    fn test_chunks_skip_empty_ranges() {
        let req = ReduceRequest { numbers: vec![1.0, 2.0], operation: ReduceOp::Sum, num_peers: Some(4) };
        let chunks = decompose_chunks("t", &req, 4, 9).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].id, "t_chunk_1_9");
        assert_eq!(chunks[1].payload, json!({ "numbers": [2.0], "operation": "sum" }));
    }

    #[test]
    fn test_huge_chunk_count_yields_one_chunk_per_item() {
        let req = ReduceRequest { numbers: vec![1.0, 2.0, 3.0], operation: ReduceOp::Sum, num_peers: None };
        let chunks = decompose_chunks("t", &req, usize::MAX / 4, 1).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].region, SubTaskRegion::Chunk(ChunkRange { start: 2, end: 3 }));
    }

    #[test]
    fn test_oversized_resolution_rejected() {
        for (w, h) in [(u32::MAX, u32::MAX), (60_000, 60_000), (4097, 4096)] {
            let err = decompose_tiles("t", &render(w, h, vec![]), 2, 2, 1).unwrap_err();
            assert!(matches!(err, Error::InvalidTask(_)));
        }
        assert_eq!(decompose_tiles("t", &render(4096, 4096, vec![]), 2, 2, 1).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_oversized_resolution_not_run_locally() {
        let n = node("self");
        let task = Task::new(TaskPayload::TileRender(render(u32::MAX, u32::MAX, vec![])));
        let err = n.scheduler.submit_or_run_locally(task).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTask(_)));
    }

    #[tokio::test]
    async fn test_round_robin_by_score() {
        let n = node("self");
        {
            let mut table = n.peers.write().await;
            table.add("slow");
            table.add("fast");
            table.update("slow", 900.0, true);
        }
        let mut task = Task::new(TaskPayload::TileRender(render(800, 600, vec![])));
        n.scheduler.assign(&mut task).await.unwrap();

        let assigned: Vec<_> = task.sub_tasks.iter().map(|s| s.assigned_peer_id.clone().unwrap()).collect();
        assert_eq!(assigned, vec!["fast", "slow", "fast", "slow"]);
        let fast = n.peers.get("fast").await.unwrap();
        assert_eq!(fast.current_load, 200.0);
    }

    #[tokio::test]
    async fn test_no_eligible_peers_fails_before_dispatch() {
        let n = node("self");
        {
            let mut table = n.peers.write().await;
            table.add("flaky");
            for _ in 0..6 {
                table.update("flaky", 10.0, false);
            }
        }
        let task = Task::new(TaskPayload::TileRender(render(800, 600, vec![])));
        assert_eq!(n.scheduler.submit(task).await, Err(Error::NoPeersAvailable));
        assert_eq!(n.aggregator.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_array_reduce_across_peers() {
        let a = node("a");
        let b = node("b");
        let c = node("c");
        link(&a, &b).await;
        link(&a, &c).await;

        let task = Task::new(TaskPayload::ArrayReduce(ReduceRequest {
            numbers: (1..=10).map(f64::from).collect(),
            operation: ReduceOp::Sum,
            num_peers: Some(3),
        }));
        let result = a.scheduler.submit(task).await.unwrap();
        assert_eq!(result.kind, TaskKind::ArrayReduce);
        assert_eq!(result.value, Some(55.0));
        assert_eq!(result.peers_used, 3);
        assert!(!result.fallback);
        assert_eq!(a.aggregator.pending_count().await, 0);
        // loads are released once the task settled
        assert_eq!(a.peers.get("b").await.unwrap().current_load, 0.0);
    }

    #[tokio::test]
    async fn test_tile_render_across_peers() {
        let a = node("a");
        let b = node("b");
        link(&a, &b).await;

        let task = Task::new(TaskPayload::TileRender(render(16, 8, vec![])));
        let result = a.scheduler.submit(task).await.unwrap();
        assert_eq!(result.peers_used, 4);
        let frame = Frame::from_base64(result.combined_frame.as_deref().unwrap(), 16, 8).unwrap();
        assert_eq!(frame.pixel(15, 7), Some([16, 16, 24, 255]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out_into_fallback() {
        let a = node("a");
        let (end_a, _silent) = PeerChannel::pair();
        a.registry.accept("silent", end_a).await;

        let task = Task::new(TaskPayload::TileRender(render(800, 600, vec![])));
        let result = a.scheduler.submit(task).await.unwrap();
        assert!(result.fallback);
        assert_eq!(result.peers_used, 0);
        assert_eq!(result.failed, 4);
        assert_eq!(a.aggregator.pending_count().await, 0);

        // four timeouts at -0.1 each
        let rec = a.peers.get("silent").await.unwrap();
        assert!((rec.reliability_score - 0.6).abs() < 1e-9);
        assert!((rec.average_latency - 5000.0 * (1.0 - 0.8f64.powi(4))).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_fallback_renders_whole_frame() {
        let a = node("a");
        let (end_a, _silent) = PeerChannel::pair();
        a.registry.accept("silent", end_a).await;

        let task = Task::new(TaskPayload::TileRender(render(8, 8, vec![])));
        let result = a.scheduler.submit_or_run_locally(task).await.unwrap();
        assert!(result.fallback);
        assert!(Frame::from_base64(result.combined_frame.as_deref().unwrap(), 8, 8).is_some());
    }

    #[tokio::test]
    async fn test_no_peers_runs_locally() {
        let a = node("a");
        let task = Task::new(TaskPayload::ArrayReduce(ReduceRequest {
            numbers: vec![2.0, 4.0],
            operation: ReduceOp::Mean,
            num_peers: None,
        }));
        let result = a.scheduler.submit_or_run_locally(task).await.unwrap();
        assert_eq!(result.value, Some(3.0));
        assert!(result.fallback);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_disconnect_mid_task_counts_as_error() {
        let a = node("a");
        let (end_a, remote) = PeerChannel::pair();
        a.registry.accept("gone", end_a).await;

        let scheduler = a.scheduler.clone();
        let handle = tokio::spawn(async move {
            let task = Task::new(TaskPayload::TileRender(render(800, 600, vec![])));
            scheduler.submit(task).await
        });
        // wait until the work is in flight, then drop the link
        while a.aggregator.pending_count().await < 4 {
            tokio::task::yield_now().await;
        }
        drop(remote);

        let result = handle.await.unwrap().unwrap();
        assert!(result.fallback);
        assert_eq!(result.failed, 4);
        assert!(a.peers.get("gone").await.is_none());
    }
}
