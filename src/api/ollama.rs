//! Ollama-compatible adapter (`/api/...`).
//!
//! Request bodies are translated onto the backend's OpenAI-style wire and
//! responses translated back; streaming uses newline-delimited JSON objects.
//! Endpoints with no counterpart here (create, copy, push, blobs) answer 501.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::str::FromStr;

use crate::catalog::{class_for, ModelLocation};
use crate::error::ServeError;
use crate::recipe::{ModelClass, Recipe};
use crate::router::Forwarded;
use crate::server::AppState;

use super::{guard_stream, sse_data_frames};

fn now_stamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn digest_of(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

fn ndjson_line(value: &Value) -> Bytes {
    let mut line = value.to_string();
    line.push('\n');
    Bytes::from(line)
}

fn ndjson_response<S, E>(stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<axum::BoxError> + 'static,
{
    Response::builder()
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(stream))
        .expect("ndjson response")
}

/// Map Ollama `options` onto the OpenAI-style body: `num_ctx` becomes the
/// `ctx_size` load option, sampling fields keep their backend names.
fn apply_options(body: &mut Value, options: &Value) {
    let Some(options) = options.as_object() else {
        return;
    };
    let Some(target) = body.as_object_mut() else {
        return;
    };
    for (key, value) in options {
        match key.as_str() {
            "num_ctx" => {
                target.insert("ctx_size".to_string(), value.clone());
            }
            "num_predict" => {
                target.insert("max_tokens".to_string(), value.clone());
            }
            "temperature" | "top_p" | "top_k" | "seed" | "stop" => {
                target.insert(key.clone(), value.clone());
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Chat and generate
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ChatRequest {
    model: String,
    #[serde(default)]
    messages: Vec<Value>,
    stream: Option<bool>,
    options: Option<Value>,
}

pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, ServeError> {
    let stream = req.stream.unwrap_or(true);
    let mut body = json!({
        "model": req.model.clone(),
        "messages": req.messages,
        "stream": stream,
    });
    if let Some(options) = &req.options {
        apply_options(&mut body, options);
    }

    let forwarded = state
        .router
        .dispatch(ModelClass::Llm, "/v1/chat/completions", &req.model, body, stream)
        .await?;

    Ok(match forwarded {
        Forwarded::Json(reply) => {
            let message = reply["choices"][0]["message"].clone();
            let done_reason = reply["choices"][0]["finish_reason"]
                .as_str()
                .unwrap_or("stop")
                .to_string();
            Json(json!({
                "model": req.model,
                "created_at": now_stamp(),
                "message": if message.is_null() {
                    json!({"role": "assistant", "content": ""})
                } else {
                    message
                },
                "done": true,
                "done_reason": done_reason,
                "prompt_eval_count": reply["usage"]["prompt_tokens"],
                "eval_count": reply["usage"]["completion_tokens"],
            }))
            .into_response()
        }
        Forwarded::Stream { response, handle } => {
            let model = req.model.clone();
            let mut done_sent = false;
            let frames = sse_data_frames(response.bytes_stream()).flat_map(move |frame| {
                futures::stream::iter(translate_stream_frame(
                    frame,
                    &model,
                    FrameKind::Chat,
                    &mut done_sent,
                ))
            });
            ndjson_response(guard_stream(frames, handle))
        }
    })
}

#[derive(Deserialize)]
pub struct GenerateRequest {
    model: String,
    #[serde(default)]
    prompt: String,
    stream: Option<bool>,
    options: Option<Value>,
}

pub async fn generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ServeError> {
    let stream = req.stream.unwrap_or(true);
    let mut body = json!({
        "model": req.model.clone(),
        "prompt": req.prompt,
        "stream": stream,
    });
    if let Some(options) = &req.options {
        apply_options(&mut body, options);
    }

    let forwarded = state
        .router
        .dispatch(ModelClass::Llm, "/v1/completions", &req.model, body, stream)
        .await?;

    Ok(match forwarded {
        Forwarded::Json(reply) => {
            let text = reply["choices"][0]["text"].as_str().unwrap_or("").to_string();
            Json(json!({
                "model": req.model,
                "created_at": now_stamp(),
                "response": text,
                "done": true,
                "done_reason": reply["choices"][0]["finish_reason"].as_str().unwrap_or("stop"),
            }))
            .into_response()
        }
        Forwarded::Stream { response, handle } => {
            let model = req.model.clone();
            let mut done_sent = false;
            let frames = sse_data_frames(response.bytes_stream()).flat_map(move |frame| {
                futures::stream::iter(translate_stream_frame(
                    frame,
                    &model,
                    FrameKind::Generate,
                    &mut done_sent,
                ))
            });
            ndjson_response(guard_stream(frames, handle))
        }
    })
}

#[derive(Clone, Copy)]
enum FrameKind {
    Chat,
    Generate,
}

/// Translate one backend SSE payload into zero or more NDJSON frames.
fn translate_stream_frame(
    frame: Result<String, reqwest::Error>,
    model: &str,
    kind: FrameKind,
    done_sent: &mut bool,
) -> Vec<Result<Bytes, reqwest::Error>> {
    let data = match frame {
        Ok(data) => data,
        Err(e) => return vec![Err(e)],
    };
    if *done_sent {
        return Vec::new();
    }
    if data == "[DONE]" {
        *done_sent = true;
        return vec![Ok(done_frame(model, kind, "stop"))];
    }
    let Ok(chunk) = serde_json::from_str::<Value>(&data) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    let choice = &chunk["choices"][0];
    let delta = match kind {
        FrameKind::Chat => choice["delta"]["content"].as_str().unwrap_or(""),
        FrameKind::Generate => choice["text"].as_str().unwrap_or(""),
    };
    if !delta.is_empty() {
        let payload = match kind {
            FrameKind::Chat => json!({
                "model": model,
                "created_at": now_stamp(),
                "message": {"role": "assistant", "content": delta},
                "done": false,
            }),
            FrameKind::Generate => json!({
                "model": model,
                "created_at": now_stamp(),
                "response": delta,
                "done": false,
            }),
        };
        out.push(Ok(ndjson_line(&payload)));
    }
    if let Some(reason) = choice["finish_reason"].as_str() {
        *done_sent = true;
        out.push(Ok(done_frame(model, kind, reason)));
    }
    out
}

fn done_frame(model: &str, kind: FrameKind, reason: &str) -> Bytes {
    let payload = match kind {
        FrameKind::Chat => json!({
            "model": model,
            "created_at": now_stamp(),
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "done_reason": reason,
        }),
        FrameKind::Generate => json!({
            "model": model,
            "created_at": now_stamp(),
            "response": "",
            "done": true,
            "done_reason": reason,
        }),
    };
    ndjson_line(&payload)
}

// ---------------------------------------------------------------------------
// Embeddings
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct EmbedRequest {
    model: String,
    input: Value,
}

pub async fn embed(
    State(state): State<AppState>,
    Json(req): Json<EmbedRequest>,
) -> Result<Json<Value>, ServeError> {
    let body = json!({ "model": req.model.clone(), "input": req.input });
    let forwarded = state
        .router
        .dispatch(ModelClass::Embedding, "/v1/embeddings", &req.model, body, false)
        .await?;
    let Forwarded::Json(reply) = forwarded else {
        return Err(ServeError::Internal("unexpected streaming reply".into()));
    };
    let embeddings: Vec<Value> = reply["data"]
        .as_array()
        .map(|rows| rows.iter().map(|row| row["embedding"].clone()).collect())
        .unwrap_or_default();
    Ok(Json(json!({ "model": req.model, "embeddings": embeddings })))
}

#[derive(Deserialize)]
pub struct LegacyEmbeddingsRequest {
    model: String,
    #[serde(default)]
    prompt: String,
}

/// Legacy single-input endpoint: one prompt in, one vector out.
pub async fn embeddings(
    State(state): State<AppState>,
    Json(req): Json<LegacyEmbeddingsRequest>,
) -> Result<Json<Value>, ServeError> {
    let body = json!({ "model": req.model.clone(), "input": req.prompt });
    let forwarded = state
        .router
        .dispatch(ModelClass::Embedding, "/v1/embeddings", &req.model, body, false)
        .await?;
    let Forwarded::Json(reply) = forwarded else {
        return Err(ServeError::Internal("unexpected streaming reply".into()));
    };
    Ok(Json(json!({
        "embedding": reply["data"][0]["embedding"].clone()
    })))
}

// ---------------------------------------------------------------------------
// Catalog endpoints
// ---------------------------------------------------------------------------

pub async fn tags(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<Value> = state
        .router
        .catalog()
        .list()
        .into_iter()
        .map(|descriptor| {
            json!({
                "name": descriptor.name.clone(),
                "model": descriptor.name,
                "modified_at": descriptor
                    .registered_at
                    .to_rfc3339_opts(SecondsFormat::Micros, true),
                "size": descriptor.size_bytes,
                "digest": digest_of(&descriptor.name),
                "details": {
                    "format": "gguf",
                    "family": descriptor.recipe.to_string(),
                    "parameter_size": "",
                    "quantization_level": "",
                },
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

#[derive(Deserialize)]
pub struct NamedRequest {
    #[serde(alias = "name")]
    model: String,
}

pub async fn show(
    State(state): State<AppState>,
    Json(req): Json<NamedRequest>,
) -> Result<Json<Value>, ServeError> {
    let descriptor = state.router.catalog().lookup(&req.model)?;
    let mut capabilities = vec!["completion"];
    if descriptor.labels.contains("vision") {
        capabilities.push("vision");
    }
    if descriptor.class == ModelClass::Embedding {
        capabilities = vec!["embedding"];
    }
    Ok(Json(json!({
        "details": {
            "format": "gguf",
            "family": descriptor.recipe.to_string(),
            "parameter_size": "",
            "quantization_level": "",
        },
        "capabilities": capabilities,
        "model_info": {
            "general.name": descriptor.name,
            "modeld.class": descriptor.class.to_string(),
            "modeld.recipe": descriptor.recipe.to_string(),
            "modeld.labels": descriptor.labels,
        },
    })))
}

pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<NamedRequest>,
) -> Result<Json<Value>, ServeError> {
    state.router.delete_model(&req.model)?;
    Ok(Json(json!({ "status": "success" })))
}

// ---------------------------------------------------------------------------
// Pull
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PullRequest {
    #[serde(alias = "name")]
    model: String,
    checkpoint: Option<String>,
    recipe: Option<String>,
    stream: Option<bool>,
}

pub async fn pull(
    State(state): State<AppState>,
    Json(req): Json<PullRequest>,
) -> Result<Response, ServeError> {
    let stream = req.stream.unwrap_or(true);
    let catalog = state.router.catalog().clone();

    // A cataloged name pulls its registered checkpoint; otherwise the name
    // (or an explicit checkpoint field) must itself be org/model:variant.
    let (checkpoint, recipe, labels) = match catalog.lookup(&req.model) {
        Ok(descriptor) => match &descriptor.location {
            ModelLocation::Path(_) => {
                // Already cached; report immediate success.
                let frame = json!({ "status": "success" });
                return Ok(if stream {
                    ndjson_response(futures::stream::once(async move {
                        Ok::<_, std::convert::Infallible>(ndjson_line(&frame))
                    }))
                } else {
                    Json(frame).into_response()
                });
            }
            ModelLocation::Checkpoint(checkpoint) => {
                (checkpoint.clone(), descriptor.recipe, descriptor.labels.clone())
            }
        },
        Err(_) => {
            let checkpoint = req.checkpoint.clone().unwrap_or_else(|| req.model.clone());
            if !checkpoint.contains(':') || !checkpoint.contains('/') {
                return Err(ServeError::UnknownModel(req.model));
            }
            let recipe = match &req.recipe {
                Some(raw) => {
                    Recipe::from_str(raw).map_err(ServeError::InvalidRequest)?
                }
                None => Recipe::LlamaCpp,
            };
            (checkpoint, recipe, Default::default())
        }
    };

    let class = class_for(recipe, &labels);
    tracing::info!(model = %req.model, %checkpoint, recipe = %recipe, %class, "Pull requested");
    let events = catalog.pull(req.model.clone(), checkpoint, recipe, labels);

    if stream {
        let frames = events.map(|event| {
            Ok::<_, std::convert::Infallible>(ndjson_line(
                &serde_json::to_value(&event).unwrap_or_else(|_| json!({"status": "error"})),
            ))
        });
        Ok(ndjson_response(frames))
    } else {
        let mut last = json!({ "status": "error: pull produced no events" });
        let mut events = events;
        while let Some(event) = events.next().await {
            last = serde_json::to_value(&event).unwrap_or(last);
        }
        Ok(Json(last).into_response())
    }
}

// ---------------------------------------------------------------------------
// Introspection
// ---------------------------------------------------------------------------

pub async fn ps(State(state): State<AppState>) -> Json<Value> {
    let models: Vec<Value> = state
        .router
        .list_running()
        .into_iter()
        .map(|slot| {
            json!({
                "name": slot.name.clone(),
                "model": slot.name,
                "size": slot.size_bytes,
                "digest": digest_of(&slot.name),
                "expires_at": "",
                "size_vram": 0,
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

pub async fn version() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn root() -> &'static str {
    "Ollama is running"
}

/// Stub for endpoints the server does not implement.
pub async fn not_supported() -> Response {
    (
        axum::http::StatusCode::NOT_IMPLEMENTED,
        Json(json!({ "error": "not supported" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_delta_becomes_ndjson_frame() {
        let mut done = false;
        let chunk = json!({
            "choices": [{"delta": {"content": "hi"}, "finish_reason": null}]
        });
        let frames =
            translate_stream_frame(Ok(chunk.to_string()), "m", FrameKind::Chat, &mut done);
        assert_eq!(frames.len(), 1);
        let parsed: Value =
            serde_json::from_slice(frames[0].as_ref().unwrap()).unwrap();
        assert_eq!(parsed["message"]["content"], "hi");
        assert_eq!(parsed["done"], false);
        assert!(!done);
    }

    #[test]
    fn finish_reason_emits_terminal_frame() {
        let mut done = false;
        let chunk = json!({
            "choices": [{"delta": {}, "finish_reason": "stop"}]
        });
        let frames =
            translate_stream_frame(Ok(chunk.to_string()), "m", FrameKind::Chat, &mut done);
        assert_eq!(frames.len(), 1);
        let parsed: Value =
            serde_json::from_slice(frames[0].as_ref().unwrap()).unwrap();
        assert_eq!(parsed["done"], true);
        assert_eq!(parsed["done_reason"], "stop");
        assert!(done);
    }

    #[test]
    fn done_marker_after_finish_is_suppressed() {
        let mut done = true;
        let frames = translate_stream_frame(
            Ok("[DONE]".to_string()),
            "m",
            FrameKind::Chat,
            &mut done,
        );
        assert!(frames.is_empty());
    }

    #[test]
    fn generate_frames_use_response_field() {
        let mut done = false;
        let chunk = json!({
            "choices": [{"text": "abc", "finish_reason": null}]
        });
        let frames =
            translate_stream_frame(Ok(chunk.to_string()), "m", FrameKind::Generate, &mut done);
        let parsed: Value =
            serde_json::from_slice(frames[0].as_ref().unwrap()).unwrap();
        assert_eq!(parsed["response"], "abc");
    }

    #[test]
    fn options_map_to_backend_fields() {
        let mut body = json!({"model": "m"});
        apply_options(
            &mut body,
            &json!({"num_ctx": 8192, "num_predict": 64, "temperature": 0.2, "ignored_thing": 1}),
        );
        assert_eq!(body["ctx_size"], 8192);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["temperature"], 0.2);
        assert!(body.get("ignored_thing").is_none());
    }
}
