//! Fakes shared by the job tests.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::Value;
use studio_comfyui::{OutputImage, RunError, Workflow};

use crate::generation::Renderer;
use crate::trainer::{Trainer, TrainerError, TrainerOutput};

/// Encoded solid-color image.
pub fn sample_image(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([90, 120, 200])));
    let mut buf = Cursor::new(Vec::new());
    image.write_to(&mut buf, format).unwrap();
    buf.into_inner()
}

// ---------------------------------------------------------------------------
// Webhook receiver
// ---------------------------------------------------------------------------

/// Local HTTP endpoint recording every JSON body posted to `/hook`.
pub struct WebhookSink {
    addr: std::net::SocketAddr,
    received: Arc<Mutex<Vec<Value>>>,
}

impl WebhookSink {
    pub async fn start() -> Self {
        let received = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/hook", post(record))
            .with_state(received.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, received }
    }

    pub fn url(&self) -> String {
        format!("http://{}/hook", self.addr)
    }

    /// Bodies received so far, waiting up to five seconds for `count` of them.
    pub async fn wait_for(&self, count: usize) -> Vec<Value> {
        for _ in 0..100 {
            let received = self.received.lock().unwrap().clone();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.received.lock().unwrap().clone()
    }
}

async fn record(State(received): State<Arc<Mutex<Vec<Value>>>>, Json(body): Json<Value>) {
    received.lock().unwrap().push(body);
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Dataset directory contents at the moment training started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeenDataset {
    /// File names, sorted.
    pub files: Vec<String>,
    /// Contents of the `.txt` files, in file-name order.
    pub captions: Vec<String>,
}

/// Trainer that writes a weights file or fails with a fixed exit code.
pub struct FakeTrainer {
    weights: Option<(PathBuf, Vec<u8>)>,
    failure: Option<(i32, String)>,
    dataset_dir: Option<PathBuf>,
    seen: Mutex<Vec<SeenDataset>>,
    calls: AtomicU32,
}

impl FakeTrainer {
    pub fn writing(path: PathBuf, bytes: &[u8]) -> Self {
        Self {
            weights: Some((path, bytes.to_vec())),
            failure: None,
            dataset_dir: None,
            seen: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(exit_code: i32, stderr: &str) -> Self {
        Self {
            weights: None,
            failure: Some((exit_code, stderr.to_string())),
            dataset_dir: None,
            seen: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    /// Record the contents of `dir` on every call.
    pub fn observing(mut self, dir: PathBuf) -> Self {
        self.dataset_dir = Some(dir);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn datasets_seen(&self) -> Vec<SeenDataset> {
        self.seen.lock().unwrap().clone()
    }
}

fn snapshot(dir: &Path) -> SeenDataset {
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    let captions = files
        .iter()
        .filter(|name| name.ends_with(".txt"))
        .map(|name| std::fs::read_to_string(dir.join(name)).unwrap_or_default())
        .collect();
    SeenDataset { files, captions }
}

#[async_trait]
impl Trainer for FakeTrainer {
    async fn train(&self, config_path: &Path) -> Result<TrainerOutput, TrainerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        assert!(config_path.exists(), "config written before training");
        if let Some(dir) = &self.dataset_dir {
            self.seen.lock().unwrap().push(snapshot(dir));
        }

        if let Some((exit_code, stderr)) = &self.failure {
            return Err(TrainerError::Failed {
                exit_code: *exit_code,
                stderr: stderr.clone(),
            });
        }
        if let Some((path, bytes)) = &self.weights {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        Ok(TrainerOutput {
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 1,
        })
    }
}

// ---------------------------------------------------------------------------
// Renderer
// ---------------------------------------------------------------------------

/// Renderer returning one PNG per configured filename.
pub struct FakeRenderer {
    healthy: bool,
    filenames: Vec<String>,
    submitted: Mutex<Vec<(Workflow, String)>>,
}

impl FakeRenderer {
    pub fn producing(filenames: &[&str]) -> Self {
        Self {
            healthy: true,
            filenames: filenames.iter().map(|f| f.to_string()).collect(),
            submitted: Mutex::new(Vec::new()),
        }
    }

    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            ..Self::producing(&[])
        }
    }

    /// Workflows rendered so far with their output prefix.
    pub fn submitted(&self) -> Vec<(Workflow, String)> {
        self.submitted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn health_check(&self) -> Result<(), RunError> {
        if self.healthy {
            Ok(())
        } else {
            Err(RunError::Unhealthy("connection refused".into()))
        }
    }

    async fn render(
        &self,
        workflow: &Workflow,
        output_prefix: &str,
    ) -> Result<Vec<OutputImage>, RunError> {
        self.submitted
            .lock()
            .unwrap()
            .push((workflow.clone(), output_prefix.to_string()));
        Ok(self
            .filenames
            .iter()
            .map(|filename| OutputImage {
                filename: filename.replace("{prefix}", output_prefix),
                bytes: sample_image(ImageFormat::Png, 64, 48),
            })
            .collect())
    }
}
