//! Execution providers: the compute backend behind a sub-task.
//!
//! The core never looks inside a provider. It hands over a JSON payload and
//! bounds the call with its own timeout.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::error::ProviderError;
use crate::frame::Frame;
use crate::types::{ReduceOp, Viewport};

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    pub success: bool,
    pub output: Value,
    pub duration: Duration,
}

#[async_trait]
pub trait ExecutionProvider: Send + Sync {
    /// Human-readable name for logs
    fn name(&self) -> &'static str;

    async fn execute(&self, payload: &Value) -> Result<ProviderOutput, ProviderError>;
}

/// Runs `provider` and fails with [`ProviderError::TimedOut`] past `timeout`.
/// An output reporting `success: false` is turned into an error too.
pub async fn execute_with_timeout(
    provider: &dyn ExecutionProvider,
    payload: &Value,
    timeout: Duration,
) -> Result<ProviderOutput, ProviderError> {
    let output = tokio::time::timeout(timeout, provider.execute(payload))
        .await
        .map_err(|_| ProviderError::TimedOut(timeout.as_millis() as u64))??;
    if !output.success {
        return Err(ProviderError::MalformedOutput(format!(
            "{} reported failure: {}",
            provider.name(),
            output.output
        )));
    }
    Ok(output)
}

/// Reads the numeric result out of a provider output. Accepts a bare number
/// or an object with a numeric `result` field.
pub fn numeric_output(output: &Value) -> Option<f64> {
    match output {
        Value::Number(n) => n.as_f64(),
        Value::Object(map) => map.get("result").and_then(Value::as_f64),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// In-process provider: numeric reductions and a flat-shaded tile renderer.
#[derive(Debug, Default, Clone)]
pub struct BuiltinProvider;

impl BuiltinProvider {
    fn reduce(&self, op: ReduceOp, payload: &Value) -> Result<Value, ProviderError> {
        let numbers = payload
            .get("numbers")
            .and_then(Value::as_array)
            .ok_or_else(|| ProviderError::MalformedPayload("no numbers array".into()))?;
        let numbers: Vec<f64> = numbers
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| ProviderError::MalformedPayload(format!("not a number: {v}")))
            })
            .collect::<Result<_, _>>()?;
        let value = op.apply(&numbers).ok_or(ProviderError::EmptyOutput)?;
        Ok(json!(value))
    }

    fn render(&self, payload: &Value) -> Result<Value, ProviderError> {
        let viewport: Viewport = serde_json::from_value(
            payload.get("viewport").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| ProviderError::MalformedPayload(format!("viewport: {e}")))?;
        let objects = payload
            .get("objects")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut tile = Frame::filled(viewport.width, viewport.height, [16, 16, 24, 255]).ok_or_else(|| {
            ProviderError::MalformedPayload(format!("tile {}x{} too large", viewport.width, viewport.height))
        })?;
        for (i, object) in objects.iter().enumerate() {
            let Some(pos) = object.get("position") else { continue };
            let x = pos.get("x").and_then(Value::as_f64).unwrap_or(0.0) * 100.0 + 400.0;
            let y = pos.get("y").and_then(Value::as_f64).unwrap_or(0.0) * 100.0 + 300.0;
            let local_x = x - viewport.x as f64;
            let local_y = y - viewport.y as f64;
            let shade = (64 + (i * 37) % 192) as u8;
            let color = [shade, 255 - shade, 128, 255];
            // 5×5 marker around the projected centre
            for dy in -2i64..=2 {
                for dx in -2i64..=2 {
                    let px = local_x as i64 + dx;
                    let py = local_y as i64 + dy;
                    if px >= 0 && py >= 0 {
                        tile.set_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }

        Ok(json!({
            "success": true,
            "frameData": tile.to_base64(),
            "viewport": viewport,
            "objectsRendered": objects.len(),
            "device": "cpu",
        }))
    }
}

#[async_trait]
impl ExecutionProvider for BuiltinProvider {
    fn name(&self) -> &'static str {
        "builtin"
    }

    async fn execute(&self, payload: &Value) -> Result<ProviderOutput, ProviderError> {
        let started = Instant::now();
        let operation = payload
            .get("operation")
            .and_then(Value::as_str)
            .unwrap_or("sum");
        let output = match operation {
            "render_frame" => self.render(payload)?,
            other => match other.parse::<ReduceOp>() {
                Ok(op) => self.reduce(op, payload)?,
                Err(_) => return Err(ProviderError::Unsupported(other.to_string())),
            },
        };
        Ok(ProviderOutput {
            success: true,
            output,
            duration: started.elapsed(),
        })
    }
}

/// Remote provider backed by a job runner's `POST /run-job`.
pub struct HttpProvider {
    http: reqwest::Client,
    base_url: String,
    num_peers: usize,
}

impl HttpProvider {
    pub fn new(base_url: &str, num_peers: usize) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            num_peers: num_peers.max(1),
        }
    }
}

#[async_trait]
impl ExecutionProvider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn execute(&self, payload: &Value) -> Result<ProviderOutput, ProviderError> {
        let started = Instant::now();
        let url = format!("{}/run-job", self.base_url);
        let body = json!({ "payload": payload, "numPeers": self.num_peers });
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        let data: Value = resp.json().await?;

        if let Some(err) = data.get("error").and_then(Value::as_str) {
            return Err(ProviderError::Remote(err.to_string()));
        }
        if !status.is_success() {
            return Err(ProviderError::Remote(format!("HTTP {status}")));
        }
        match data.get("result") {
            None | Some(Value::Null) => Err(ProviderError::EmptyOutput),
            Some(result) => Ok(ProviderOutput {
                success: true,
                output: result.clone(),
                duration: started.elapsed(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy;

    #[async_trait]
    impl ExecutionProvider for Sleepy {
        fn name(&self) -> &'static str {
            "sleepy"
        }

        async fn execute(&self, _payload: &Value) -> Result<ProviderOutput, ProviderError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ProviderOutput { success: true, output: json!(1), duration: Duration::ZERO })
        }
    }

    #[tokio::test]
    async fn test_builtin_sum_and_mean() {
        let provider = BuiltinProvider;
        let out = provider
            .execute(&json!({ "numbers": [1, 2, 3, 4], "operation": "sum" }))
            .await
            .unwrap();
        assert_eq!(numeric_output(&out.output), Some(10.0));

        let out = provider
            .execute(&json!({ "numbers": [1, 2, 3, 4], "operation": "mean" }))
            .await
            .unwrap();
        assert_eq!(numeric_output(&out.output), Some(2.5));
    }

    #[tokio::test]
    async fn test_builtin_rejects_bad_payloads() {
        let provider = BuiltinProvider;
        assert_eq!(
            provider.execute(&json!({ "operation": "matrix_mult" })).await,
            Err(ProviderError::Unsupported("matrix_mult".into()))
        );
        assert!(matches!(
            provider.execute(&json!({ "operation": "sum" })).await,
            Err(ProviderError::MalformedPayload(_))
        ));
    }

    #[tokio::test]
    async fn test_builtin_render_tile_size() {
        let out = BuiltinProvider
            .execute(&json!({
                "operation": "render_frame",
                "viewport": { "x": 400, "y": 300, "width": 8, "height": 4 },
                "objects": [{ "position": { "x": 0.0, "y": 0.0 } }],
            }))
            .await
            .unwrap();
        let data = out.output["frameData"].as_str().unwrap();
        let tile = Frame::from_base64(data, 8, 4).unwrap();
        // object projects to (400, 300), the tile's top-left corner
        assert_ne!(tile.pixel(0, 0), Some([16, 16, 24, 255]));
        assert_eq!(tile.pixel(7, 3), Some([16, 16, 24, 255]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_imposed_from_outside() {
        let res = execute_with_timeout(&Sleepy, &json!({}), Duration::from_millis(250)).await;
        assert_eq!(res, Err(ProviderError::TimedOut(250)));
    }

    #[test]
    fn test_numeric_output_shapes() {
        assert_eq!(numeric_output(&json!(3.5)), Some(3.5));
        assert_eq!(numeric_output(&json!({ "result": 7 })), Some(7.0));
        assert_eq!(numeric_output(&json!("12.5\n")), Some(12.5));
        assert_eq!(numeric_output(&json!(null)), None);
    }
}
