//! Legacy chunk pipeline for plain numeric jobs: split, run every chunk,
//! reduce once all chunks have reported.

use serde_json::{json, Value};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::provider::{execute_with_timeout, numeric_output, ExecutionProvider};
use crate::types::{ChunkRange, ReduceOp, ReduceRequest};

/// Outcome of a chunked run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineReport {
    pub value: f64,
    /// Per-chunk results in chunk order; `None` marks a failed chunk
    pub chunks: Vec<Option<f64>>,
    pub ranges: Vec<ChunkRange>,
}

/// Splits `len` items into exactly `n` contiguous ranges whose sizes differ
/// by at most one; the first `len % n` ranges take the extra item.
pub fn split_chunks(len: usize, n: usize) -> Vec<ChunkRange> {
    if n == 0 {
        return Vec::new();
    }
    let base = len / n;
    let extra = len % n;
    let mut start = 0;
    (0..n)
        .map(|i| {
            let size = base + usize::from(i < extra);
            let range = ChunkRange { start, end: start + size };
            start += size;
            range
        })
        .collect()
}

/// Runs every chunk through `provider` concurrently, waits for all of them,
/// then reduces the successful ones.
pub async fn run_chunked(
    provider: &dyn ExecutionProvider,
    req: &ReduceRequest,
    num_peers: usize,
    timeout: Duration,
) -> Result<PipelineReport> {
    if num_peers == 0 {
        return Err(Error::InvalidTask("numPeers must be at least 1".into()));
    }
    let ranges = split_chunks(req.numbers.len(), num_peers.min(req.numbers.len()));
    tracing::info!(
        items = req.numbers.len(),
        chunks = ranges.len(),
        operation = req.operation.as_str(),
        provider = provider.name(),
        "Splitting job into chunks"
    );

    let runs = ranges.iter().enumerate().map(|(idx, range)| {
        let payload = json!({
            "numbers": &req.numbers[range.start..range.end],
            "operation": req.operation.as_str(),
        });
        async move {
            match execute_with_timeout(provider, &payload, timeout).await {
                Ok(out) => {
                    let value = numeric_output(&out.output);
                    if value.is_none() {
                        tracing::warn!(chunk = idx, output = %out.output, "Chunk output is not numeric");
                    }
                    value
                }
                Err(e) => {
                    tracing::warn!(chunk = idx, error = %e, "Chunk failed");
                    None
                }
            }
        }
    });
    let chunks: Vec<Option<f64>> = futures::future::join_all(runs).await;

    let parts: Vec<(f64, usize)> = chunks
        .iter()
        .zip(&ranges)
        .filter_map(|(v, r)| v.map(|v| (v, r.len())))
        .collect();
    let value = req
        .operation
        .combine(&parts)
        .ok_or_else(|| Error::ProviderFailure("every chunk failed".into()))?;

    tracing::info!(value = value, failed = chunks.iter().filter(|c| c.is_none()).count(), "All chunks completed");
    Ok(PipelineReport { value, chunks, ranges })
}

/// Entry point behind `/run-job`: numeric payloads go through the chunk
/// pipeline, everything else straight to the provider.
pub async fn run_job(
    provider: &dyn ExecutionProvider,
    payload: &Value,
    num_peers: usize,
    timeout: Duration,
) -> Result<Value> {
    if payload.get("numbers").is_some() {
        let numbers = payload
            .get("numbers")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::InvalidTask("numbers must be an array".into()))?
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| Error::InvalidTask(format!("not a number: {v}"))))
            .collect::<Result<Vec<f64>>>()?;
        let operation = match payload.get("operation").and_then(Value::as_str) {
            Some(op) => op.parse::<ReduceOp>().map_err(Error::InvalidTask)?,
            None => ReduceOp::default(),
        };
        let req = ReduceRequest { numbers, operation, num_peers: Some(num_peers) };
        let report = run_chunked(provider, &req, num_peers, timeout).await?;
        return Ok(json!(report.value));
    }

    let out = execute_with_timeout(provider, payload, timeout).await?;
    Ok(out.output)
}
