use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Overall bound on one `/run-job` call
    pub job_timeout: Duration,
    /// Bound on each provider call inside a job
    pub provider_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(30),
            provider_timeout: Duration::from_secs(10),
        }
    }
}
