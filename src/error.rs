//! HTTP failure kinds and the JSON envelope they are rendered into.
//!
//! Handlers, extractors and middleware return [`ApiError`]. Its
//! `IntoResponse` impl attaches the error to the response extensions; the
//! request pipeline then calls [`render`] once, with the request path and
//! debug flag, so every failure leaves the service in the same shape.

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::header::WWW_AUTHENTICATE;
use http::{HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{error, warn};

/// Detail sent for 500s when debug mode is off.
pub const GENERIC_INTERNAL_DETAIL: &str = "Internal server error";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    /// No valid credential on a route that needs one.
    #[error("Authentication required")]
    AuthenticationRequired,
    /// Valid principal without the required role.
    #[error("Access forbidden: {0}")]
    Forbidden(String),
    /// Route or resource absent.
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("Request timed out")]
    RequestTimeout,
    /// Anything unexpected further down; text is only exposed in debug mode.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found() -> Self {
        Self::NotFound("Resource not found".to_string())
    }

    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::RequestTimeout => StatusCode::REQUEST_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Production rendering without a path; the pipeline re-renders it.
        let mut response = envelope_response(&self, ErrorEnvelope::from_error(&self, None, false));
        response.extensions_mut().insert(self);
        response
    }
}

/// `{ detail, status_code, ...extra }`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub detail: String,
    pub status_code: u16,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ErrorEnvelope {
    /// The one mapping from failure kind to envelope.
    pub fn from_error(err: &ApiError, path: Option<&str>, debug: bool) -> Self {
        let mut extra = Map::new();

        let detail = match err {
            ApiError::AuthenticationRequired => {
                extra.insert(
                    "auth_info".to_string(),
                    json!({
                        "type": "Bearer",
                        "description": "Please provide a valid access token from the identity provider"
                    }),
                );
                err.to_string()
            }
            ApiError::Forbidden(_) => "Access forbidden".to_string(),
            ApiError::NotFound(detail) => {
                if let Some(path) = path {
                    extra.insert("path".to_string(), Value::String(path.to_string()));
                }
                detail.clone()
            }
            ApiError::BadRequest(detail) => detail.clone(),
            ApiError::RequestTimeout => err.to_string(),
            ApiError::Internal(message) => {
                if debug {
                    extra.insert("debug_mode".to_string(), Value::Bool(true));
                    extra.insert("error".to_string(), Value::String(message.clone()));
                }
                GENERIC_INTERNAL_DETAIL.to_string()
            }
        };

        Self {
            detail,
            status_code: err.status().as_u16(),
            extra,
        }
    }
}

fn envelope_response(err: &ApiError, envelope: ErrorEnvelope) -> Response {
    let mut response = (err.status(), Json(envelope)).into_response();
    if matches!(err, ApiError::AuthenticationRequired) {
        response
            .headers_mut()
            .insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    }
    response
}

/// Render `err` for a request to `path`, logging it at a severity matching
/// its kind. CORS headers are added by the caller.
pub fn render(err: &ApiError, path: &str, debug: bool) -> Response {
    match err {
        ApiError::Internal(message) => error!(path, error = %message, "Internal error"),
        ApiError::AuthenticationRequired => warn!(path, "Unauthorized access attempt"),
        ApiError::Forbidden(reason) => warn!(path, reason = %reason, "Forbidden access attempt"),
        ApiError::RequestTimeout => warn!(path, "Request timed out"),
        ApiError::NotFound(_) | ApiError::BadRequest(_) => {}
    }

    envelope_response(err, ErrorEnvelope::from_error(err, Some(path), debug))
}
