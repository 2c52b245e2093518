//! Management endpoints: stats, system info, runtime log level, shutdown and
//! the SSE log tail.

use std::io::SeekFrom;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::error::ServeError;
use crate::server::AppState;
use crate::sysprobe;

/// Poll cadence of the log tail; doubles as the heartbeat interval.
const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    Json(state.router.stats())
}

#[derive(Deserialize)]
pub struct SystemInfoQuery {
    verbose: Option<String>,
}

pub async fn system_info(Query(query): Query<SystemInfoQuery>) -> Json<sysprobe::SystemInfo> {
    let verbose = query
        .verbose
        .map(|v| {
            let v = v.to_lowercase();
            v == "true" || v == "1"
        })
        .unwrap_or(false);
    Json(sysprobe::system_info(verbose))
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
pub struct LogLevelRequest {
    level: String,
}

pub async fn log_level(
    State(state): State<AppState>,
    Json(req): Json<LogLevelRequest>,
) -> Result<Json<Value>, ServeError> {
    if let Some(control) = &state.log_control {
        control
            .set_level(&req.level)
            .map_err(ServeError::InvalidRequest)?;
    }
    info!(level = %req.level, "Log level changed");
    Ok(Json(json!({ "status": "success", "level": req.level })))
}

/// Respond first, tear down after: the reply is flushed while a background
/// task waits ~100 ms and then cancels the serve loop.  The main path drains
/// the pool and exits.
pub async fn shutdown(State(state): State<AppState>) -> Json<Value> {
    info!("Shutdown request received");
    let token = state.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
    });
    Json(json!({ "status": "shutting down" }))
}

/// SSE tail of the server log file.  Existing content streams first, then
/// new lines as they are appended; a comment heartbeat keeps idle
/// connections alive.  All tail state lives in this connection's task.
pub async fn logs_stream(State(state): State<AppState>) -> Response {
    let Some(path) = state.log_file.clone() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "log file not found; start the server with --log-dir to enable log streaming",
            })),
        )
            .into_response();
    };
    if !path.exists() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "log file not found",
                "path": path.display().to_string(),
            })),
        )
            .into_response();
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(64);

    tokio::spawn(async move {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        let mut position: u64 = 0;
        let mut carry = String::new();

        loop {
            if file.seek(SeekFrom::Start(position)).await.is_err() {
                return;
            }
            let mut chunk = String::new();
            let read = match file.read_to_string(&mut chunk).await {
                Ok(read) => read,
                Err(_) => return,
            };
            position += read as u64;

            let mut sent = false;
            if read > 0 {
                carry.push_str(&chunk);
                while let Some(pos) = carry.find('\n') {
                    let line: String = carry.drain(..=pos).collect();
                    let frame = format!("data: {}\n\n", line.trim_end());
                    if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                        return;
                    }
                    sent = true;
                }
            }
            if !sent && tx.send(Ok(Bytes::from(": heartbeat\n\n"))).await.is_err() {
                return;
            }

            tokio::time::sleep(LOG_POLL_INTERVAL).await;
        }
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .expect("sse response")
}
