use chrono::{DateTime, Utc};
use loom_protocol::ExecutionProvider;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::models::*;

/// Finished jobs kept for `/api/status`
const JOB_HISTORY: usize = 100;

pub struct AppState {
    pub provider: Arc<dyn ExecutionProvider>,
    pub config: Config,
    pub jobs: RwLock<VecDeque<JobRecord>>,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(provider: Arc<dyn ExecutionProvider>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            provider,
            config,
            jobs: RwLock::new(VecDeque::new()),
            start_time: Utc::now(),
        })
    }

    pub async fn record(&self, job: JobRecord) {
        let mut jobs = self.jobs.write().await;
        if let Some(existing) = jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job;
            return;
        }
        if jobs.len() == JOB_HISTORY {
            jobs.pop_front();
        }
        jobs.push_back(job);
    }
}
