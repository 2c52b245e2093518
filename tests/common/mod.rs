//! Shared test fixtures: a counting launcher standing in for real backend
//! subprocesses, an in-process HTTP server emulating a llama.cpp-style
//! backend, and an app-state builder over a temporary cache root.

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Json;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use modeld::catalog::{ModelCatalog, ModelDescriptor, ModelLocation};
use modeld::config::{ClassQuotas, ServerConfig};
use modeld::error::ServeError;
use modeld::pool::BackendSlotPool;
use modeld::process::{BackendHandle, Launcher};
use modeld::recipe::{ModelClass, RawOptions, Recipe, RecipeOptions};
use modeld::router::Router;
use modeld::server::{build_app, AppState};

// ---------------------------------------------------------------------------
// Counting launcher
// ---------------------------------------------------------------------------

pub struct TestLauncher {
    pub launches: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
    pub fail: AtomicBool,
    pub delay: Duration,
    pub backend_port: AtomicU16,
    pub stopped: Mutex<Vec<String>>,
}

impl TestLauncher {
    pub fn new(backend_port: u16) -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            delay: Duration::from_millis(50),
            backend_port: AtomicU16::new(backend_port),
            stopped: Mutex::new(Vec::new()),
        })
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }
}

pub struct TestBackend {
    name: String,
    port: u16,
    alive: AtomicBool,
    launcher: Arc<TestLauncher>,
}

#[async_trait]
impl BackendHandle for TestBackend {
    fn port(&self) -> u16 {
        self.port
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&self, _grace: Duration) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.launcher.active.fetch_sub(1, Ordering::SeqCst);
            self.launcher
                .stopped
                .lock()
                .unwrap()
                .push(self.name.clone());
        }
    }
}

/// Local newtype over `Arc<TestLauncher>` so the foreign `Launcher` trait can
/// be implemented without violating the orphan rule.
pub struct TestLauncherHandle(pub Arc<TestLauncher>);

#[async_trait]
impl Launcher for TestLauncherHandle {
    async fn launch(
        &self,
        descriptor: &ModelDescriptor,
        _options: &RecipeOptions,
        _port: u16,
        _timeout: Duration,
    ) -> Result<Arc<dyn BackendHandle>, ServeError> {
        let this = &self.0;
        this.launches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(this.delay).await;
        if this.fail.load(Ordering::SeqCst) {
            return Err(ServeError::LoadFailed {
                model: descriptor.name.clone(),
                reason: "test launcher configured to fail".to_string(),
            });
        }
        let active = this.active.fetch_add(1, Ordering::SeqCst) + 1;
        this.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(Arc::new(TestBackend {
            name: descriptor.name.clone(),
            port: this.backend_port.load(Ordering::SeqCst),
            alive: AtomicBool::new(true),
            launcher: Arc::clone(this),
        }))
    }
}

// ---------------------------------------------------------------------------
// Mock inference backend
// ---------------------------------------------------------------------------

async fn mock_chat(Json(body): Json<Value>) -> Response {
    if body["stream"].as_bool().unwrap_or(false) {
        let chunk = |content: &str| {
            json!({"choices": [{"delta": {"content": content}, "finish_reason": null}]})
        };
        let finish = json!({"choices": [{"delta": {}, "finish_reason": "stop"}]});
        let sse = format!(
            "data: {}\n\ndata: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            chunk("Hel"),
            chunk("lo"),
            finish
        );
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(sse.into())
            .unwrap();
    }
    Json(json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello from backend"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7},
    }))
    .into_response()
}

async fn mock_completions(Json(body): Json<Value>) -> Response {
    if body["stream"].as_bool().unwrap_or(false) {
        let chunk = |text: &str, reason: Value| {
            json!({"choices": [{"text": text, "finish_reason": reason}]})
        };
        let sse = format!(
            "data: {}\n\ndata: {}\n\ndata: [DONE]\n\n",
            chunk("once upon", Value::Null),
            chunk(" a time", json!("stop")),
        );
        return Response::builder()
            .header(header::CONTENT_TYPE, "text/event-stream")
            .body(sse.into())
            .unwrap();
    }
    Json(json!({
        "choices": [{"text": "once upon a time", "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 2, "completion_tokens": 4},
    }))
    .into_response()
}

async fn mock_embeddings(Json(_body): Json<Value>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{"index": 0, "embedding": [0.125, -0.25, 0.5]}],
    }))
}

async fn mock_rerank(Json(_body): Json<Value>) -> Json<Value> {
    Json(json!({
        "results": [{"index": 0, "relevance_score": 0.93}],
    }))
}

/// Serve a llama.cpp-shaped backend on an ephemeral port.
pub async fn spawn_mock_backend() -> u16 {
    let app = axum::Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/v1/chat/completions", post(mock_chat))
        .route("/v1/completions", post(mock_completions))
        .route("/v1/embeddings", post(mock_embeddings))
        .route("/v1/rerank", post(mock_rerank));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    port
}

// ---------------------------------------------------------------------------
// Descriptors and server state
// ---------------------------------------------------------------------------

pub fn descriptor(name: &str, class: ModelClass, recipe: Recipe) -> ModelDescriptor {
    let mut labels = BTreeSet::new();
    match class {
        ModelClass::Embedding => {
            labels.insert("embeddings".to_string());
        }
        ModelClass::Reranking => {
            labels.insert("reranking".to_string());
        }
        _ => {}
    }
    ModelDescriptor {
        name: name.to_string(),
        class,
        recipe,
        location: ModelLocation::Path(format!("/models/{name}.gguf").into()),
        labels,
        mmproj_path: None,
        recipe_options: RawOptions::new(),
        registered_at: Utc::now(),
        size_bytes: 1024,
    }
}

pub struct TestServer {
    pub base: String,
    pub catalog: Arc<ModelCatalog>,
    pub launcher: Arc<TestLauncher>,
    pub pool: Arc<BackendSlotPool>,
    pub router: Arc<Router>,
    pub token: CancellationToken,
    _tmp: tempfile::TempDir,
}

/// Full in-process stack: temp cache root, counting launcher wired to the
/// mock backend, and the real route table on an ephemeral listener.
pub async fn start_server(quotas: ClassQuotas) -> TestServer {
    let tmp = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        cache_root: tmp.path().to_path_buf(),
        quotas,
        ..ServerConfig::default()
    };
    let catalog = ModelCatalog::load(&config).unwrap();

    let backend_port = spawn_mock_backend().await;
    let launcher = TestLauncher::new(backend_port);
    let pool = BackendSlotPool::new(
        Arc::new(TestLauncherHandle(Arc::clone(&launcher))),
        quotas,
        Duration::from_secs(5),
        Duration::from_millis(500),
    );
    let router = Router::new(
        Arc::clone(&catalog),
        Arc::clone(&pool),
        RawOptions::new(),
        Duration::from_secs(5),
    );

    let token = CancellationToken::new();
    let state = AppState {
        router: Arc::clone(&router),
        log_control: None,
        log_file: None,
        shutdown: token.clone(),
    };

    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_token = token.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { serve_token.cancelled().await })
            .await
            .unwrap();
    });

    TestServer {
        base: format!("http://{addr}"),
        catalog,
        launcher,
        pool,
        router,
        token,
        _tmp: tmp,
    }
}
