//! Peer wire messages.
//!
//! On the wire a message is a JSON object. Handshakes and job requests carry
//! a `type` discriminant; job results are recognised by their `result` field:
//!
//! ```text
//! {"type":"connection_established","peerId":"10.0.0.2:7440","timestamp":1700000000000}
//! {"type":"game_render","taskId":"…","jobId":"7f3c…_tile_0_1_1700000000000","renderData":{…}}
//! {"type":"job","taskId":"…","jobId":"7f3c…_chunk_2_1700000000000","job":{…}}
//! {"result":{…}|42.0|null,"jobId":"7f3c…_tile_0_1_1700000000000"}
//! ```

use serde::{Deserialize, Serialize};

use crate::types::PeerId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub peer_id: PeerId,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A tile of a frame, payload under `renderData`
    GameRender,
    /// A generic job (array chunks), payload under `job`
    Job,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub kind: JobKind,
    /// Parent task
    pub task_id: String,
    /// Global sub-task id; results are keyed by it
    pub job_id: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    /// `null` when the remote provider failed
    pub result: serde_json::Value,
    pub job_id: String,
}

impl JobResult {
    /// Whether the remote provider produced a usable result. Objects may
    /// report failure through `success: false` or an `error` field.
    pub fn is_success(&self) -> bool {
        match &self.result {
            serde_json::Value::Null => false,
            serde_json::Value::Object(map) => {
                if let Some(success) = map.get("success").and_then(|v| v.as_bool()) {
                    return success;
                }
                !map.contains_key("error")
            }
            _ => true,
        }
    }
}

/// Everything a peer can send us
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub enum PeerMessage {
    Handshake(Handshake),
    JobRequest(JobRequest),
    JobResult(JobResult),
}

impl PeerMessage {
    pub fn label(&self) -> &'static str {
        match self {
            PeerMessage::Handshake(_) => "handshake",
            PeerMessage::JobRequest(_) => "job_request",
            PeerMessage::JobResult(_) => "job_result",
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Typed {
    ConnectionEstablished(Handshake),
    GameRender {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "jobId")]
        job_id: String,
        #[serde(rename = "renderData")]
        render_data: serde_json::Value,
    },
    Job {
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "jobId")]
        job_id: String,
        job: serde_json::Value,
    },
}

/// Wire representation; `Typed` is tried first, then the untyped result.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawMessage {
    Typed(Typed),
    Result(JobResult),
}

impl TryFrom<RawMessage> for PeerMessage {
    type Error = String;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        Ok(match raw {
            RawMessage::Typed(Typed::ConnectionEstablished(hs)) => PeerMessage::Handshake(hs),
            RawMessage::Typed(Typed::GameRender { task_id, job_id, render_data }) => {
                PeerMessage::JobRequest(JobRequest {
                    kind: JobKind::GameRender,
                    task_id,
                    job_id,
                    payload: render_data,
                })
            }
            RawMessage::Typed(Typed::Job { task_id, job_id, job }) => {
                PeerMessage::JobRequest(JobRequest {
                    kind: JobKind::Job,
                    task_id,
                    job_id,
                    payload: job,
                })
            }
            RawMessage::Result(result) => {
                if result.job_id.is_empty() {
                    return Err("job result without jobId".into());
                }
                PeerMessage::JobResult(result)
            }
        })
    }
}

impl From<PeerMessage> for RawMessage {
    fn from(msg: PeerMessage) -> Self {
        match msg {
            PeerMessage::Handshake(hs) => RawMessage::Typed(Typed::ConnectionEstablished(hs)),
            PeerMessage::JobRequest(JobRequest { kind: JobKind::GameRender, task_id, job_id, payload }) => {
                RawMessage::Typed(Typed::GameRender { task_id, job_id, render_data: payload })
            }
            PeerMessage::JobRequest(JobRequest { kind: JobKind::Job, task_id, job_id, payload }) => {
                RawMessage::Typed(Typed::Job { task_id, job_id, job: payload })
            }
            PeerMessage::JobResult(result) => RawMessage::Result(result),
        }
    }
}
