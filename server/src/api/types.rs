//! Shared API types: error responses and static server info

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::data::DataError;

/// Static build information served at /server/info.
#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    #[serde(rename = "ReleaseVersion")]
    pub release_version: &'static str,
    #[serde(rename = "GitVersion")]
    pub git_version: &'static str,
}

impl ServerInfo {
    pub fn current() -> ServerInfo {
        ServerInfo {
            release_version: env!("CARGO_PKG_VERSION"),
            git_version: option_env!("HTRACED_GIT_VERSION").unwrap_or("unknown"),
        }
    }
}

/// JSON error envelope: `{"error": "..."}` with the status attached.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> ApiError {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> ApiError {
        ApiError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<DataError> for ApiError {
    fn from(e: DataError) -> ApiError {
        if e.is_bad_request() {
            ApiError::bad_request(e.to_string())
        } else {
            ApiError::internal(e.to_string())
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Double quotes inside error text are normalized to single quotes so
        // the envelope stays trivially parseable everywhere.
        let message = self.message.replace('"', "'");
        tracing::debug!(status = %self.status, message = %message, "Request failed");
        (self.status, Json(ErrorBody { error: message })).into_response()
    }
}
