//! Per-request chain wrapped around the whole router.
//!
//! Outermost first:
//!
//! 1. [`handle`]: answers `OPTIONS` preflights directly, enforces the
//!    overall request timeout, renders any [`ApiError`] attached to the
//!    response and applies CORS headers to everything that leaves.
//! 2. `TraceLayer`: request spans.
//! 3. `CatchPanicLayer`: a handler panic becomes [`ApiError::Internal`].

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::{Request, State};
use axum::middleware::{Next, from_fn_with_state};
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use http::header::ORIGIN;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::cors::{CorsPolicy, CorsRequest};
use crate::error::{self, ApiError};

pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone)]
pub struct Pipeline {
    cors: CorsPolicy,
    debug: bool,
    request_timeout: Duration,
}

impl Pipeline {
    pub fn new(cors: CorsPolicy, debug: bool) -> Self {
        Self {
            cors,
            debug,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Wrap every route and the fallback of `router`.
    pub fn wrap(self, router: Router) -> Router {
        router.layer(
            ServiceBuilder::new()
                .layer(from_fn_with_state(Arc::new(self), handle))
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::custom(panic_response)),
        )
    }
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    ApiError::Internal(message).into_response()
}

async fn handle(State(pipeline): State<Arc<Pipeline>>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let origin = request.headers().get(ORIGIN).cloned();
    let kind = CorsRequest::classify(&method, request.headers());

    if let Some(origin) = origin.as_ref().and_then(|o| o.to_str().ok()) {
        if !pipeline.cors.allows_origin(origin) {
            debug!(
                target: "security",
                event_type = "cors_rejected",
                origin = %origin,
                path = %path,
                "CORS origin rejected"
            );
        }
    }

    let mut response = if kind.is_preflight() {
        StatusCode::OK.into_response()
    } else {
        match tokio::time::timeout(pipeline.request_timeout, next.run(request)).await {
            Ok(response) => response,
            Err(_) => ApiError::RequestTimeout.into_response(),
        }
    };

    if let Some(err) = response.extensions_mut().remove::<ApiError>() {
        response = error::render(&err, &path, pipeline.debug);
    }

    pipeline
        .cors
        .apply(response.headers_mut(), origin.as_ref(), &kind);

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        "request"
    );

    response
}
