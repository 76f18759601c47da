//! Pending assignments and whole-task result combination.
//!
//! Every dispatched sub-task owns exactly one entry in the pending table.
//! Whoever removes the entry (a job result, the deadline timer, a disconnect,
//! a failed send) fires its one-shot gate; everyone else finds nothing and
//! does nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::message::JobResult;
use crate::peer::PeerStore;
use crate::provider::numeric_output;
use crate::types::{
    Completion, PeerId, Settlement, SubTaskRegion, SubTaskStatus, Task, TaskPayload, TaskResult,
};

/// How a single sub-task ended
pub type Outcome = Result<Completion>;

struct Assignment {
    peer_id: PeerId,
    started: Instant,
    deadline: Duration,
    gate: oneshot::Sender<Outcome>,
    timer: Option<AbortHandle>,
}

impl Assignment {
    fn fire(self, outcome: Outcome) {
        if let Some(timer) = &self.timer {
            timer.abort();
        }
        // the receiver may already be gone if the caller stopped waiting
        let _ = self.gate.send(outcome);
    }
}

#[derive(Clone)]
pub struct Aggregator {
    pending: Arc<Mutex<HashMap<String, Assignment>>>,
    peers: PeerStore,
}

impl Aggregator {
    pub fn new(peers: PeerStore) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            peers,
        }
    }

    /// Registers a pending assignment and arms its deadline timer. The
    /// returned receiver yields exactly one outcome.
    pub async fn register(
        &self,
        sub_task_id: &str,
        peer_id: &str,
        deadline: Duration,
    ) -> Result<oneshot::Receiver<Outcome>> {
        let mut pending = self.pending.lock().await;
        if pending.contains_key(sub_task_id) {
            return Err(Error::DuplicateAssignment(sub_task_id.to_string()));
        }

        let (gate, rx) = oneshot::channel();
        let this = self.clone();
        let id = sub_task_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            this.expire(&id).await;
        });

        pending.insert(
            sub_task_id.to_string(),
            Assignment {
                peer_id: peer_id.to_string(),
                started: Instant::now(),
                deadline,
                gate,
                timer: Some(timer.abort_handle()),
            },
        );
        Ok(rx)
    }

    /// Handles a job result from `from_peer`. Results for unknown (already
    /// settled) sub-tasks are dropped silently.
    pub async fn handle_result(&self, from_peer: &str, result: JobResult) {
        let assignment = {
            let mut pending = self.pending.lock().await;
            let assigned = pending.get(&result.job_id).map(|a| a.peer_id.clone());
            match assigned {
                None => {
                    tracing::debug!(job_id = %result.job_id, peer = %from_peer, "Discarding late or unknown result");
                    return;
                }
                Some(assigned) if assigned != from_peer => {
                    tracing::warn!(
                        job_id = %result.job_id,
                        peer = %from_peer,
                        assigned = %assigned,
                        "Result from a peer that was not assigned this sub-task"
                    );
                    return;
                }
                Some(_) => pending.remove(&result.job_id),
            }
        };
        let Some(assignment) = assignment else { return };

        let duration = assignment.started.elapsed();
        let success = result.is_success();
        self.peers
            .update(&assignment.peer_id, duration.as_millis() as f64, success)
            .await;

        let outcome = if success {
            tracing::debug!(job_id = %result.job_id, peer = %from_peer, ms = duration.as_millis() as u64, "Sub-task completed");
            Ok(Completion {
                peer_id: assignment.peer_id.clone(),
                result: result.result,
                duration,
            })
        } else {
            tracing::warn!(job_id = %result.job_id, peer = %from_peer, "Sub-task failed on peer");
            Err(Error::ProviderFailure(format!(
                "peer {} returned no usable result",
                assignment.peer_id
            )))
        };
        assignment.fire(outcome);
    }

    /// Deadline elapsed: reject with `SubTaskTimeout` unless already settled.
    pub async fn expire(&self, sub_task_id: &str) {
        let assignment = self.pending.lock().await.remove(sub_task_id);
        let Some(mut assignment) = assignment else { return };
        // the timer task is the caller here; nothing to abort
        assignment.timer = None;

        tracing::warn!(job_id = %sub_task_id, peer = %assignment.peer_id, "⏱️ Sub-task timed out");
        self.peers
            .update(&assignment.peer_id, assignment.deadline.as_millis() as f64, false)
            .await;
        assignment.fire(Err(Error::SubTaskTimeout(sub_task_id.to_string())));
    }

    /// Settles one assignment with `error`, e.g. when sending it failed.
    pub async fn cancel(&self, sub_task_id: &str, error: Error) -> bool {
        let assignment = self.pending.lock().await.remove(sub_task_id);
        match assignment {
            Some(a) => {
                a.fire(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every assignment pointing at `peer_id` with `PeerDisconnected`.
    pub async fn fail_peer(&self, peer_id: &str) -> usize {
        let failed: Vec<(String, Assignment)> = {
            let mut pending = self.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, a)| a.peer_id == peer_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|a| (id, a)))
                .collect()
        };
        let count = failed.len();
        for (id, assignment) in failed {
            tracing::debug!(job_id = %id, peer = %peer_id, "Cancelling assignment of disconnected peer");
            assignment.fire(Err(Error::PeerDisconnected(peer_id.to_string())));
        }
        if count > 0 {
            tracing::warn!(peer = %peer_id, cancelled = count, "Peer disconnected with work in flight");
        }
        count
    }

    pub async fn is_pending(&self, sub_task_id: &str) -> bool {
        self.pending.lock().await.contains_key(sub_task_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Waits for every gate; a gate dropped without firing counts as a failure.
pub async fn settle_all(gates: Vec<oneshot::Receiver<Outcome>>) -> Vec<Outcome> {
    futures::future::join_all(gates.into_iter().map(|rx| async move {
        rx.await
            .unwrap_or_else(|_| Err(Error::ProviderFailure("assignment dropped".into())))
    }))
    .await
}

fn settlement_of(outcome: &Outcome) -> Settlement {
    match outcome {
        Ok(_) => Settlement::Success,
        Err(Error::SubTaskTimeout(_)) => Settlement::Timeout,
        Err(_) => Settlement::Error,
    }
}

/// Builds the task's final result from per-sub-task outcomes, given in the
/// same order as `task.sub_tasks`. Completion order does not matter: tiles
/// land at their viewport offsets and chunks are reduced in chunk order.
pub fn combine(task: &mut Task, outcomes: Vec<Outcome>) -> TaskResult {
    for (sub, outcome) in task.sub_tasks.iter_mut().zip(&outcomes) {
        sub.status = SubTaskStatus::Settled(settlement_of(outcome));
    }

    let mut render_time = Duration::ZERO;
    let mut peers_used = 0usize;
    let mut combined_frame = None;
    let mut value = None;

    match &task.payload {
        TaskPayload::TileRender(req) => {
            let mut canvas = Frame::new(req.resolution.width, req.resolution.height);
            if canvas.is_none() {
                tracing::warn!(task_id = %task.id, "Frame too large to composite");
            }
            for (sub, outcome) in task.sub_tasks.iter().zip(&outcomes) {
                let Ok(done) = outcome else { continue };
                peers_used += 1;
                render_time = render_time.max(done.duration);

                let SubTaskRegion::Tile(vp) = sub.region else { continue };
                let tile = done
                    .result
                    .get("frameData")
                    .and_then(|v| v.as_str())
                    .and_then(|data| Frame::from_base64(data, vp.width, vp.height));
                match (tile, canvas.as_mut()) {
                    (Some(tile), Some(canvas)) => canvas.blit(&tile, vp.x, vp.y),
                    (Some(_), None) => {}
                    (None, _) => tracing::warn!(
                        sub_task = %sub.id,
                        peer = %done.peer_id,
                        "Tile result carried no usable frame data"
                    ),
                }
            }
            combined_frame = canvas.map(|c| c.to_base64());
        }
        TaskPayload::ArrayReduce(req) => {
            let mut parts = Vec::new();
            for (sub, outcome) in task.sub_tasks.iter().zip(&outcomes) {
                let Ok(done) = outcome else { continue };
                let SubTaskRegion::Chunk(range) = sub.region else { continue };
                match numeric_output(&done.result) {
                    Some(v) => {
                        peers_used += 1;
                        render_time = render_time.max(done.duration);
                        parts.push((v, range.len()));
                    }
                    None => tracing::warn!(
                        sub_task = %sub.id,
                        peer = %done.peer_id,
                        result = %done.result,
                        "Chunk result is not numeric"
                    ),
                }
            }
            value = req.operation.combine(&parts);
        }
    }

    if peers_used == 0 {
        tracing::warn!(task_id = %task.id, "No sub-task succeeded, signalling local fallback");
        return TaskResult::fallback(task);
    }

    TaskResult {
        task_id: task.id.clone(),
        kind: task.kind(),
        combined_frame,
        value,
        render_time: render_time.as_millis() as u64,
        peers_used,
        failed: outcomes.len() - peers_used,
        fallback: false,
    }
}
