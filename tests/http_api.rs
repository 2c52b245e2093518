//! End-to-end scenarios over the in-process HTTP stack: protocol surfaces,
//! eviction sequences, streaming translation, pull progress and shutdown
//! ordering.

mod common;

use std::time::Duration;

use serde_json::{json, Value};

use modeld::config::ClassQuotas;
use modeld::recipe::{ModelClass, Recipe};

use common::{descriptor, start_server};

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn concurrent_chats_load_the_backend_once() {
    let server = start_server(ClassQuotas::default()).await;
    server
        .catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let base = server.base.clone();
        tasks.push(tokio::spawn(async move {
            client()
                .post(format!("{base}/v1/chat/completions"))
                .json(&json!({
                    "model": "alpha",
                    "messages": [{"role": "user", "content": "hi"}],
                }))
                .send()
                .await
                .unwrap()
        }));
    }
    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(
            body["choices"][0]["message"]["content"],
            "hello from backend"
        );
    }

    assert_eq!(server.launcher.launches(), 1);

    let stats: Value = client()
        .get(format!("{}/stats", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["loads"], 1);
    assert_eq!(stats["models"]["alpha"]["loads"], 1);
    assert_eq!(stats["models"]["alpha"]["requests"], 10);
}

#[tokio::test]
async fn quota_of_one_evicts_the_previous_model() {
    let server = start_server(ClassQuotas::default()).await;
    server
        .catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();
    server
        .catalog
        .register(descriptor("beta", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();

    let chat = |model: &'static str| {
        let base = server.base.clone();
        async move {
            client()
                .post(format!("{base}/api/chat"))
                .json(&json!({
                    "model": model,
                    "messages": [{"role": "user", "content": "hi"}],
                    "stream": false,
                }))
                .send()
                .await
                .unwrap()
        }
    };

    assert_eq!(chat("alpha").await.status(), 200);
    assert_eq!(chat("alpha").await.status(), 200);
    assert_eq!(chat("beta").await.status(), 200);

    // One load of alpha, one eviction of alpha, one load of beta.
    assert_eq!(server.launcher.launches(), 2);
    assert_eq!(server.launcher.stopped(), vec!["alpha".to_string()]);
    assert_eq!(server.pool.evictions(), 1);

    let ps: Value = client()
        .get(format!("{}/api/ps", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let running: Vec<&str> = ps["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert_eq!(running, vec!["beta"]);
}

#[tokio::test]
async fn embed_against_an_llm_is_rejected_without_a_load() {
    let server = start_server(ClassQuotas::default()).await;
    server
        .catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();

    let response = client()
        .post(format!("{}/v1/embeddings", server.base))
        .json(&json!({"model": "alpha", "input": "text"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("class"));

    // No slot was created for the mismatched request.
    assert_eq!(server.launcher.launches(), 0);
    assert!(server.pool.list().is_empty());
}

#[tokio::test]
async fn unknown_model_is_404_and_unknown_endpoints_are_501() {
    let server = start_server(ClassQuotas::default()).await;

    let response = client()
        .post(format!("{}/v1/chat/completions", server.base))
        .json(&json!({"model": "missing", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    for endpoint in ["create", "copy", "push"] {
        let response = client()
            .post(format!("{}/api/{endpoint}", server.base))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 501, "endpoint {endpoint}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "not supported");
    }

    let response = client()
        .post(format!("{}/api/blobs/sha256:abc", server.base))
        .body("blob")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 501);

    let version: Value = client()
        .get(format!("{}/api/version", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(version["version"].as_str().unwrap().contains('.'));
}

#[tokio::test]
async fn ollama_chat_streams_ndjson_frames_in_order() {
    let server = start_server(ClassQuotas::default()).await;
    server
        .catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();

    let response = client()
        .post(format!("{}/api/chat", server.base))
        .json(&json!({
            "model": "alpha",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-ndjson"
    );

    let text = response.text().await.unwrap();
    let frames: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();

    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0]["message"]["content"], "Hel");
    assert_eq!(frames[0]["done"], false);
    assert_eq!(frames[1]["message"]["content"], "lo");
    assert_eq!(frames[2]["done"], true);
    assert_eq!(frames[2]["done_reason"], "stop");
}

#[tokio::test]
async fn openai_stream_relays_backend_frames_verbatim() {
    let server = start_server(ClassQuotas::default()).await;
    server
        .catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();

    let response = client()
        .post(format!("{}/v1/chat/completions", server.base))
        .json(&json!({
            "model": "alpha",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let text = response.text().await.unwrap();
    let data_lines: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("data: "))
        .collect();
    assert_eq!(data_lines.len(), 4);
    assert_eq!(*data_lines.last().unwrap(), "data: [DONE]");
}

#[tokio::test]
async fn generate_and_embed_round_trip() {
    let server = start_server(ClassQuotas::default()).await;
    server
        .catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();
    server
        .catalog
        .register(descriptor(
            "embedder",
            ModelClass::Embedding,
            Recipe::LlamaCpp,
        ))
        .unwrap();

    let generated: Value = client()
        .post(format!("{}/api/generate", server.base))
        .json(&json!({"model": "alpha", "prompt": "story", "stream": false}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(generated["response"], "once upon a time");
    assert_eq!(generated["done"], true);

    let embedded: Value = client()
        .post(format!("{}/api/embed", server.base))
        .json(&json!({"model": "embedder", "input": ["a", "b"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(embedded["embeddings"][0][0], 0.125);

    let legacy: Value = client()
        .post(format!("{}/api/embeddings", server.base))
        .json(&json!({"model": "embedder", "prompt": "a"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(legacy["embedding"][1], -0.25);
}

#[tokio::test]
async fn pull_streams_progress_and_registers_the_model() {
    let server = start_server(ClassQuotas::default()).await;

    // A checkpoint store on loopback serving one file.
    let store = axum::Router::new().route(
        "/org/x/resolve/main/q4.gguf",
        axum::routing::get(|| async { "gguf-bytes-payload" }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let store_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, store).await.unwrap();
    });
    std::env::set_var("MODELD_CHECKPOINT_BASE", format!("http://{store_addr}"));

    let response = client()
        .post(format!("{}/api/pull", server.base))
        .json(&json!({"model": "org/x:q4", "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    let frames: Vec<Value> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert!(frames.len() >= 2);
    assert_eq!(frames.last().unwrap()["status"], "success");

    let tags: Value = client()
        .get(format!("{}/api/tags", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = tags["models"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"org/x:q4"));

    let found = server.catalog.lookup("org/x:q4").unwrap();
    let cached = found.location.local_path().unwrap();
    assert_eq!(std::fs::read(cached).unwrap(), b"gguf-bytes-payload");
}

#[tokio::test]
async fn management_surface_responds() {
    let server = start_server(ClassQuotas::default()).await;

    let info: Value = client()
        .get(format!("{}/system-info?verbose=true", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(info["logical_cores"].as_u64().unwrap() > 0);
    assert!(info["verbose"].is_object());

    let health: Value = client()
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    // Root banner for Ollama client discovery.
    let root = client()
        .get(format!("{}/", server.base))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(root, "Ollama is running");

    // HEAD on a GET endpoint: headers only, 200.
    let head = client()
        .head(format!("{}/api/tags", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status(), 200);
    assert!(head.text().await.unwrap().is_empty());

    // No log file configured: the tail endpoint is a 404.
    let logs = client()
        .get(format!("{}/logs/stream", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(logs.status(), 404);

    // Level validation without a live reload handle.
    let bad_level = client()
        .post(format!("{}/log-level", server.base))
        .json(&json!({"level": "debug"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_level.status(), 200);
}

#[tokio::test]
async fn shutdown_responds_before_teardown() {
    let server = start_server(ClassQuotas::default()).await;

    let response = client()
        .post(format!("{}/shutdown", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "shutting down");

    // The response came back while the serve loop was still running; the
    // cancellation lands shortly after.
    assert!(!server.token.is_cancelled());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(server.token.is_cancelled());

    // New connections are refused once the listener is gone.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let refused = client()
        .get(format!("{}/api/version", server.base))
        .timeout(Duration::from_secs(2))
        .send()
        .await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn show_and_delete_follow_catalog_state() {
    let server = start_server(ClassQuotas::default()).await;
    server
        .catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();

    let shown: Value = client()
        .post(format!("{}/api/show", server.base))
        .json(&json!({"model": "alpha"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(shown["model_info"]["modeld.class"], "llm");

    // Loaded models refuse deletion.
    let chat = client()
        .post(format!("{}/api/chat", server.base))
        .json(&json!({"model": "alpha", "messages": [], "stream": false}))
        .send()
        .await
        .unwrap();
    assert_eq!(chat.status(), 200);
    let refused = client()
        .delete(format!("{}/api/delete", server.base))
        .json(&json!({"model": "alpha"}))
        .send()
        .await
        .unwrap();
    assert_eq!(refused.status(), 400);

    server.pool.unload("alpha").await;
    let deleted = client()
        .delete(format!("{}/api/delete", server.base))
        .json(&json!({"model": "alpha"}))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 200);
    assert!(server.catalog.lookup("alpha").is_err());
}
