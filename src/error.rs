//! Error taxonomy surfaced to API clients.
//!
//! Component boundaries return typed kinds; the HTTP layer maps each kind to
//! a status code and a uniform `{"error": "..."}` JSON body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::recipe::{ModelClass, Recipe};

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("model '{0}' was not found in the catalog")]
    UnknownModel(String),

    #[error("model '{model}' has class '{class}', which this endpoint does not serve")]
    WrongClass { model: String, class: ModelClass },

    #[error("option '{key}' is not valid for recipe '{recipe}'")]
    UnknownOption { key: String, recipe: Recipe },

    #[error("model '{0}' is already registered with a different recipe or class")]
    ConflictingDescriptor(String),

    #[error("failed to load model '{model}': {reason}")]
    LoadFailed { model: String, reason: String },

    #[error("no free backend port in range {0}..={1}")]
    NoFreePort(u16, u16),

    #[error("request deadline exceeded")]
    Timeout,

    #[error("backend process for model '{0}' died mid-request")]
    BackendGone(String),

    #[error("not supported")]
    NotSupported,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ServeError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServeError::UnknownModel(_) => StatusCode::NOT_FOUND,
            ServeError::WrongClass { .. }
            | ServeError::UnknownOption { .. }
            | ServeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ServeError::ConflictingDescriptor(_) => StatusCode::CONFLICT,
            ServeError::LoadFailed { .. } | ServeError::NoFreePort(..) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ServeError::BackendGone(_) => StatusCode::BAD_GATEWAY,
            ServeError::NotSupported => StatusCode::NOT_IMPLEMENTED,
            ServeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        ServeError::Internal(err.to_string())
    }
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}
