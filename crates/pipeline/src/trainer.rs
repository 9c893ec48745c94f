//! The external LoRA trainer.
//!
//! [`ToolkitTrainer`] runs `<program> <script> <config_path>` as a child
//! process. Output is captured in spawned reader tasks so the child can be
//! awaited under a timeout; on timeout the child is dropped, and
//! `kill_on_drop` kills it. The readers drain both pipes until the child
//! closes them, keeping only the most recent output.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Cap on captured stdout or stderr (10 MiB). Older output is discarded.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Trailing stderr kept in a failure message.
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error("Failed to start trainer: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Training timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Training failed with exit code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainerOutput {
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Runs one training job described by a config document on disk.
#[async_trait]
pub trait Trainer: Send + Sync {
    async fn train(&self, config_path: &Path) -> Result<TrainerOutput, TrainerError>;
}

#[derive(Debug, Clone)]
pub struct ToolkitTrainer {
    pub program: String,
    pub script: PathBuf,
    pub working_dir: Option<PathBuf>,
    pub timeout: Duration,
}

#[async_trait]
impl Trainer for ToolkitTrainer {
    async fn train(&self, config_path: &Path) -> Result<TrainerOutput, TrainerError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script)
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        tracing::info!(
            program = %self.program,
            script = %self.script.display(),
            config = %config_path.display(),
            timeout_secs = self.timeout.as_secs(),
            "Starting trainer",
        );

        let start = Instant::now();
        let mut child = cmd.spawn()?;

        let stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                return Err(TrainerError::Timeout {
                    elapsed_ms: start.elapsed().as_millis() as u64,
                })
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).into_owned();

        if !status.success() {
            return Err(TrainerError::Failed {
                exit_code: status.code().unwrap_or(-1),
                stderr: tail(&stderr, STDERR_TAIL_BYTES).to_string(),
            });
        }

        tracing::info!(duration_ms, "Trainer finished");
        Ok(TrainerOutput {
            stdout,
            stderr,
            duration_ms,
        })
    }
}

/// Read `handle` to EOF, keeping the last [`MAX_OUTPUT_BYTES`].
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut kept = VecDeque::new();
    let Some(mut handle) = handle else {
        return Vec::new();
    };

    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match handle.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                kept.extend(&chunk[..n]);
                if kept.len() > MAX_OUTPUT_BYTES {
                    let excess = kept.len() - MAX_OUTPUT_BYTES;
                    kept.drain(..excess);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "Stopped reading trainer output");
                break;
            }
        }
    }
    kept.into()
}

/// Last `max` bytes of `s`, moved forward to a char boundary.
fn tail(s: &str, max: usize) -> &str {
    let trimmed = s.trim_end();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
