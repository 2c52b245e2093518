//! HTTP frontend: route dispatch over both protocol adapters plus the
//! management endpoints, with graceful shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router as AxumRouter;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::api::{ollama, openai, system};
use crate::logging::LogControl;
use crate::router::Router;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
    pub log_control: Option<LogControl>,
    pub log_file: Option<PathBuf>,
    pub shutdown: CancellationToken,
}

/// The complete route table.  GET routes answer HEAD automatically with
/// headers only.
pub fn build_app(state: AppState) -> AxumRouter {
    AxumRouter::new()
        // OpenAI-compatible namespace
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/completions", post(openai::completions))
        .route("/v1/embeddings", post(openai::embeddings))
        .route("/v1/reranking", post(openai::reranking))
        .route("/v1/models", get(openai::models))
        .route("/v1/audio/transcriptions", post(openai::audio_transcriptions))
        .route("/v1/audio/translations", post(openai::audio_translations))
        // Ollama-compatible namespace
        .route("/api/chat", post(ollama::chat))
        .route("/api/generate", post(ollama::generate))
        .route("/api/embed", post(ollama::embed))
        .route("/api/embeddings", post(ollama::embeddings))
        .route("/api/tags", get(ollama::tags))
        .route("/api/show", post(ollama::show))
        .route("/api/delete", delete(ollama::delete))
        .route("/api/pull", post(ollama::pull))
        .route("/api/ps", get(ollama::ps))
        .route("/api/version", get(ollama::version))
        .route("/", get(ollama::root))
        // Unsupported Ollama endpoints answer 501
        .route("/api/create", post(ollama::not_supported))
        .route("/api/copy", post(ollama::not_supported))
        .route("/api/push", post(ollama::not_supported))
        .route("/api/blobs/:digest", post(ollama::not_supported))
        // Management
        .route("/stats", get(system::stats))
        .route("/system-info", get(system::system_info))
        .route("/health", get(system::health))
        .route("/log-level", post(system::log_level))
        .route("/shutdown", post(system::shutdown))
        .route("/logs/stream", get(system::logs_stream))
        .with_state(state)
}

/// Serve until the shutdown token fires, then drain the pool.
pub async fn run(listener: tokio::net::TcpListener, state: AppState) -> anyhow::Result<()> {
    let router = Arc::clone(&state.router);
    let token = state.shutdown.clone();
    let app = build_app(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    info!("Frontend stopped, draining backends");
    router.shutdown().await;
    Ok(())
}
