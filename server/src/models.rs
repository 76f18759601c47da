use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Body of `POST /run-job`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJobRequest {
    pub payload: serde_json::Value,
    #[serde(default = "default_num_peers")]
    pub num_peers: usize,
}

fn default_num_peers() -> usize { 2 }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

/// Bookkeeping for one `/run-job` call. Kept in memory only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub operation: Option<String>,
    pub num_peers: usize,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
