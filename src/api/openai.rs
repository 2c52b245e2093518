//! OpenAI-compatible adapter (`/v1/...`).
//!
//! Chat, completion, embedding and reranking bodies follow the OpenAI JSON
//! schema and are forwarded to the backend with load options stripped;
//! streaming responses relay the backend's SSE frames verbatim, terminal
//! `data: [DONE]` included.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ServeError;
use crate::recipe::ModelClass;
use crate::router::Forwarded;
use crate::server::AppState;

use super::guard_stream;

fn model_of(body: &Value) -> Result<String, ServeError> {
    body.get("model")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .ok_or_else(|| ServeError::InvalidRequest("missing 'model' field".to_string()))
}

fn wants_stream(body: &Value) -> bool {
    body.get("stream").and_then(|s| s.as_bool()).unwrap_or(false)
}

/// Wrap a proxied reply: JSON passes through, streams relay as SSE.
fn into_response(forwarded: Forwarded) -> Response {
    match forwarded {
        Forwarded::Json(body) => Json(body).into_response(),
        Forwarded::Stream { response, handle } => {
            let stream = guard_stream(response.bytes_stream(), handle);
            Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
                .expect("sse response")
        }
    }
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ServeError> {
    let model = model_of(&body)?;
    let stream = wants_stream(&body);
    let forwarded = state
        .router
        .dispatch(ModelClass::Llm, "/v1/chat/completions", &model, body, stream)
        .await?;
    Ok(into_response(forwarded))
}

pub async fn completions(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ServeError> {
    let model = model_of(&body)?;
    let stream = wants_stream(&body);
    let forwarded = state
        .router
        .dispatch(ModelClass::Llm, "/v1/completions", &model, body, stream)
        .await?;
    Ok(into_response(forwarded))
}

pub async fn embeddings(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ServeError> {
    let model = model_of(&body)?;
    let forwarded = state
        .router
        .dispatch(ModelClass::Embedding, "/v1/embeddings", &model, body, false)
        .await?;
    Ok(into_response(forwarded))
}

pub async fn reranking(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ServeError> {
    let model = model_of(&body)?;
    let forwarded = state
        .router
        .dispatch(ModelClass::Reranking, "/v1/rerank", &model, body, false)
        .await?;
    Ok(into_response(forwarded))
}

pub async fn models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .router
        .catalog()
        .list()
        .into_iter()
        .map(|descriptor| {
            json!({
                "id": descriptor.name,
                "object": "model",
                "created": descriptor.registered_at.timestamp(),
                "owned_by": "modeld",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

#[derive(Deserialize)]
pub struct AudioQuery {
    model: Option<String>,
}

/// Audio requests carry multipart bodies; they pass through to the
/// whisper backend unmodified.  The model comes from the `model` query
/// parameter, defaulting to the first audio-class model in the catalog.
async fn audio(
    state: AppState,
    query: AudioQuery,
    backend_path: &str,
    request: axum::extract::Request,
) -> Result<Response, ServeError> {
    let model = match query.model {
        Some(model) => model,
        None => state
            .router
            .catalog()
            .list()
            .into_iter()
            .find(|d| d.class == ModelClass::Audio)
            .map(|d| d.name)
            .ok_or_else(|| ServeError::UnknownModel("<no audio model>".to_string()))?,
    };
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());
    let forwarded = state
        .router
        .dispatch_raw(ModelClass::Audio, backend_path, &model, content_type, body)
        .await?;
    Ok(into_response(forwarded))
}

pub async fn audio_transcriptions(
    State(state): State<AppState>,
    Query(query): Query<AudioQuery>,
    request: axum::extract::Request,
) -> Result<Response, ServeError> {
    audio(state, query, "/v1/audio/transcriptions", request).await
}

pub async fn audio_translations(
    State(state): State<AppState>,
    Query(query): Query<AudioQuery>,
    request: axum::extract::Request,
) -> Result<Response, ServeError> {
    audio(state, query, "/v1/audio/translations", request).await
}
