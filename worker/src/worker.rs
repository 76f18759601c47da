use async_trait::async_trait;
use loom_protocol::{ExecutionProvider, ProviderError, ProviderOutput};
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Runs a local program per job: `<program> [args...] '<payload json>'`.
/// Stdout must be one JSON document; stderr is logged.
pub struct SubprocessProvider {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
    timeout: Duration,
}

impl SubprocessProvider {
    pub fn new(program: &str, args: Vec<String>, work_dir: &str, timeout: Duration) -> Self {
        let work_dir = PathBuf::from(work_dir)
            .canonicalize()
            .unwrap_or_else(|_| PathBuf::from(work_dir));
        Self {
            program: program.to_string(),
            args,
            work_dir,
            timeout,
        }
    }
}

/// Parses a job's stdout. Empty output and a bare `null` count as failure.
pub fn parse_output(stdout: &str) -> Result<Value, ProviderError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Err(ProviderError::EmptyOutput);
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Ok(value),
        // a lone number printed without JSON framing is still usable
        Err(_) => trimmed
            .parse::<f64>()
            .map(Value::from)
            .map_err(|_| ProviderError::MalformedOutput(trimmed.chars().take(200).collect())),
    }
}

#[async_trait]
impl ExecutionProvider for SubprocessProvider {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn execute(&self, payload: &Value) -> Result<ProviderOutput, ProviderError> {
        let started = Instant::now();
        let operation = payload.get("operation").and_then(Value::as_str).unwrap_or("sum");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(payload.to_string())
            .current_dir(&self.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(program = %self.program, operation = %operation, "Spawning job process");
        let mut child = cmd.spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Io("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::Io("stderr not captured".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut lines = Vec::new();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!("stderr: {line}");
                lines.push(line);
            }
            lines
        });

        let run = async {
            let mut out = String::new();
            stdout.read_to_string(&mut out).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out))
        };

        let (status, out) = tokio::select! {
            result = run => result?,
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(program = %self.program, "Job process timed out, killing");
                let _ = child.kill().await;
                return Err(ProviderError::TimedOut(self.timeout.as_millis() as u64));
            }
        };
        let stderr_lines = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let tail: Vec<_> = stderr_lines.iter().rev().take(5).rev().cloned().collect();
            return Err(ProviderError::NonZeroExit {
                code: status.code(),
                stderr: tail.join("\n"),
            });
        }

        let output = parse_output(&out)?;
        let success = match &output {
            Value::Object(map) => map.get("success").and_then(Value::as_bool).unwrap_or(true)
                && !map.contains_key("error"),
            _ => true,
        };
        Ok(ProviderOutput {
            success,
            output,
            duration: started.elapsed(),
        })
    }
}
