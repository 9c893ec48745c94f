#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use studio_api::config::ServerConfig;
use studio_api::router::build_app_router;
use studio_api::state::{AppState, JobTimeouts};
use studio_cloud::{MemoryStore, ReplicateClient, TrainingTarget};
use studio_comfyui::WorkflowRunner;
use studio_db::records::MemoryRecords;
use studio_events::WebhookDelivery;
use studio_pipeline::generation::{GenerationJob, GenerationSettings};
use studio_pipeline::hosted::{HostedSettings, HostedTrainingService};
use studio_pipeline::lora_cache::LoraCache;
use studio_pipeline::spawner::{JobSpawner, GENERATION_JOBS, TRAINING_JOBS};
use studio_pipeline::trainer::ToolkitTrainer;
use studio_pipeline::training::{TrainingJob, TrainingSettings};

/// Shared secret the hosted-training callback expects.
pub const TEST_SECRET: &str = "test-secret";

/// Nothing listens here; outbound calls fail fast.
pub const DEAD_URL: &str = "http://127.0.0.1:9";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:3000".to_string()],
        request_timeout_secs: 30,
        hosted_request_timeout_secs: 60,
        shutdown_timeout_secs: 5,
    }
}

/// In-memory backends behind a test router, kept for assertions.
pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub records: Arc<MemoryRecords>,
    pub spawner: JobSpawner,
    _work_dir: tempfile::TempDir,
}

impl TestApp {
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Build the application router over in-memory storage and records, with
/// hosted training enabled.
pub fn build_test_app() -> TestApp {
    build_app(true, test_config())
}

/// Same as [`build_test_app`] without hosted training.
pub fn build_test_app_without_hosted() -> TestApp {
    build_app(false, test_config())
}

/// Same as [`build_test_app`] with a custom server configuration.
pub fn build_test_app_with_config(config: ServerConfig) -> TestApp {
    build_app(true, config)
}

fn build_app(with_hosted: bool, config: ServerConfig) -> TestApp {
    let work_dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let records = Arc::new(MemoryRecords::new());
    let webhooks = WebhookDelivery::new(Some(TEST_SECRET.to_string())).unwrap();

    let training = Arc::new(TrainingJob {
        store: store.clone(),
        records: records.clone(),
        trainer: Arc::new(ToolkitTrainer {
            program: "true".to_string(),
            script: PathBuf::from("run.py"),
            working_dir: None,
            timeout: Duration::from_secs(5),
        }),
        webhooks: webhooks.clone(),
        settings: TrainingSettings::new(
            work_dir.path().join("work"),
            work_dir.path().join("cache"),
        ),
    });

    let generation = Arc::new(GenerationJob {
        store: store.clone(),
        records: records.clone(),
        renderer: Arc::new(WorkflowRunner::new(DEAD_URL, Duration::from_secs(5))),
        lora_cache: LoraCache::new(work_dir.path().join("loras")),
        webhooks: webhooks.clone(),
        settings: GenerationSettings {
            workflow_path: work_dir.path().join("missing_workflow.json"),
            output_bucket: "headshots".to_string(),
            public_base_url: "https://cdn.example.com".to_string(),
        },
    });

    let hosted = with_hosted.then(|| {
        Arc::new(HostedTrainingService {
            store: store.clone(),
            records: records.clone(),
            provider: ReplicateClient::new(DEAD_URL, "r8_test").unwrap(),
            webhooks: webhooks.clone(),
            settings: HostedSettings {
                target: TrainingTarget {
                    owner: "ostris".to_string(),
                    model: "flux-dev-lora-trainer".to_string(),
                    version: "v1".to_string(),
                    destination: "studio/loras".to_string(),
                },
                callback_base: None,
                shared_secret: Some(TEST_SECRET.to_string()),
                app_webhook_url: None,
            },
        })
    });

    let spawner = JobSpawner::new(2)
        .with_pool(TRAINING_JOBS, 1)
        .with_pool(GENERATION_JOBS, 2);
    let state = AppState {
        records: records.clone(),
        training,
        generation,
        hosted,
        spawner: spawner.clone(),
        timeouts: JobTimeouts {
            training: Duration::from_secs(30),
            generation: Duration::from_secs(30),
        },
    };

    TestApp {
        router: build_app_router(state, &config),
        store,
        records,
        spawner,
        _work_dir: work_dir,
    }
}

/// Send a GET request.
pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a POST request with a raw body and a JSON content type.
pub async fn post_raw(app: Router, uri: &str, body: impl Into<Body>) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Send a POST request with a JSON body.
pub async fn post_json(app: Router, uri: &str, body: Value) -> Response {
    post_raw(app, uri, body.to_string()).await
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Local HTTP endpoint recording every JSON body posted to `/hook`.
pub struct WebhookSink {
    addr: SocketAddr,
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

    /// Bodies received so far, waiting up to ten seconds for `count` of them.
    pub async fn wait_for(&self, count: usize) -> Vec<Value> {
        for _ in 0..200 {
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
