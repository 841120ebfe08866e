// REST API endpoints for the gateway

use axum::{
    Extension, Router,
    extract::{FromRef, Path, Query, State, rejection::JsonRejection, rejection::QueryRejection},
    http::{HeaderMap, StatusCode, header},
    middleware::from_fn_with_state,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::auth::{AuthGate, AuthRequirement, OptionalAuth, Principal, RequireAuth, enforce};
use crate::error::ApiError;
use crate::store::{Collection, DEFAULT_PAGE_SIZE, Record, RecordInput, RecordList, RecordStore};

pub const SERVICE_NAME: &str = "COA Document Processor API";

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AuthGate>,
    pub store: Arc<RecordStore>,
    /// Role every mutating CRUD route requires, if set.
    pub write_role: Option<String>,
    pub auth_enabled: bool,
    pub debug: bool,
}

impl AppState {
    fn require_write(&self, principal: &Principal) -> Result<(), ApiError> {
        match &self.write_role {
            Some(role) => principal.require_role(role),
            None => Ok(()),
        }
    }
}

impl FromRef<AppState> for Arc<AuthGate> {
    fn from_ref(state: &AppState) -> Self {
        state.gate.clone()
    }
}

/// Build the router. `api_prefix` is e.g. `/api`; an empty prefix mounts
/// the API at the root.
pub fn create_router(state: AppState, api_prefix: &str) -> Router {
    let gate = state.gate.clone();

    let mut protected = Router::new()
        .route("/user/me", get(current_user))
        .route("/test-connection", get(test_connection))
        .route("/compounds/init-defaults", post(init_default_compounds));
    for collection in Collection::ALL {
        protected = protected.merge(collection_routes(collection));
    }
    let protected = protected.route_layer(from_fn_with_state(
        (gate.clone(), AuthRequirement::Mandatory),
        enforce,
    ));

    let optional = Router::new()
        .route("/auth/status", get(auth_status))
        .route_layer(from_fn_with_state(
            (gate, AuthRequirement::Optional),
            enforce,
        ));

    let api = protected.merge(optional);
    let api_prefix = api_prefix.trim_end_matches('/');

    let router = Router::new()
        .route("/", get(root))
        .route("/health", get(health_check));
    let router = if api_prefix.is_empty() {
        router.merge(api)
    } else {
        router.nest(api_prefix, api)
    };

    router.fallback(not_found).with_state(state)
}

fn collection_routes(collection: Collection) -> Router<AppState> {
    let base = format!("/{}", collection.segment());
    Router::new()
        .route(&base, get(list_records).post(create_record))
        .route(
            &format!("{}/{{id}}", base),
            get(get_record).put(update_record).delete(delete_record),
        )
        .layer(Extension(collection))
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn user_summary(principal: &Principal) -> Value {
    json!({
        "id": principal.id(),
        "name": principal.name(),
        "email": principal.email(),
        "roles": principal.roles(),
    })
}

async fn root(State(state): State<AppState>, OptionalAuth(principal): OptionalAuth) -> Json<Value> {
    let user_info = match &principal {
        Some(principal) => json!({
            "authenticated": true,
            "name": principal.name(),
            "email": principal.email(),
            "roles": principal.roles(),
        }),
        None => json!({ "authenticated": false }),
    };

    Json(json!({
        "message": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
        "authentication": {
            "enabled": state.auth_enabled,
            "type": "Bearer",
        },
        "user_info": user_info,
    }))
}

async fn auth_status(
    State(state): State<AppState>,
    OptionalAuth(principal): OptionalAuth,
) -> Json<Value> {
    match principal {
        Some(principal) => Json(json!({
            "authenticated": true,
            "user": user_summary(&principal),
            "source": principal.source(),
            "debug_mode": state.debug,
        })),
        None => Json(json!({
            "authenticated": false,
            "message": "No valid authentication token provided",
            "debug_mode": state.debug,
        })),
    }
}

async fn current_user(RequireAuth(principal): RequireAuth) -> Json<Value> {
    Json(json!({ "success": true, "data": principal }))
}

async fn test_connection(RequireAuth(principal): RequireAuth, headers: HeaderMap) -> Json<Value> {
    let header_or_unknown = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string()
    };

    Json(json!({
        "status": "connected",
        "message": "API connection OK (authenticated)",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "api_version": env!("CARGO_PKG_VERSION"),
        "user_info": {
            "id": principal.id(),
            "name": principal.name(),
            "email": principal.email(),
            "roles": principal.roles(),
            "tenant_id": principal.tenant_id(),
        },
        "client_info": {
            "user_agent": header_or_unknown(header::USER_AGENT),
            "origin": header_or_unknown(header::ORIGIN),
        },
    }))
}

#[derive(Debug, Deserialize)]
struct Pagination {
    #[serde(default)]
    skip: usize,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    DEFAULT_PAGE_SIZE
}

fn parse_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("invalid id `{}`", raw)))
}

async fn list_records(
    State(state): State<AppState>,
    Extension(collection): Extension<Collection>,
    RequireAuth(_principal): RequireAuth,
    pagination: Result<Query<Pagination>, QueryRejection>,
) -> Result<Json<RecordList>, ApiError> {
    let Query(pagination) = pagination.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let list = state
        .store
        .list(collection, pagination.skip, pagination.limit)
        .await;
    Ok(Json(list))
}

async fn get_record(
    State(state): State<AppState>,
    Extension(collection): Extension<Collection>,
    RequireAuth(_principal): RequireAuth,
    Path(id): Path<String>,
) -> Result<Json<Record>, ApiError> {
    let record = state.store.get(collection, parse_id(&id)?).await?;
    Ok(Json(record))
}

async fn create_record(
    State(state): State<AppState>,
    Extension(collection): Extension<Collection>,
    RequireAuth(principal): RequireAuth,
    body: Result<Json<RecordInput>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    state.require_write(&principal)?;
    let Json(input) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let record = state.store.create(collection, input).await?;
    info!(
        collection = %collection,
        id = %record.id,
        principal = %principal.id(),
        "Record created"
    );
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_record(
    State(state): State<AppState>,
    Extension(collection): Extension<Collection>,
    RequireAuth(principal): RequireAuth,
    Path(id): Path<String>,
    body: Result<Json<RecordInput>, JsonRejection>,
) -> Result<Json<Record>, ApiError> {
    state.require_write(&principal)?;
    let id = parse_id(&id)?;
    let Json(input) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let record = state.store.update(collection, id, input).await?;
    info!(collection = %collection, %id, principal = %principal.id(), "Record updated");
    Ok(Json(record))
}

async fn delete_record(
    State(state): State<AppState>,
    Extension(collection): Extension<Collection>,
    RequireAuth(principal): RequireAuth,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.require_write(&principal)?;
    let id = parse_id(&id)?;

    state.store.delete(collection, id).await?;
    info!(collection = %collection, %id, principal = %principal.id(), "Record deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn init_default_compounds(
    State(state): State<AppState>,
    RequireAuth(principal): RequireAuth,
) -> Result<Json<Vec<Record>>, ApiError> {
    state.require_write(&principal)?;
    let created = state.store.seed_default_compounds().await;
    Ok(Json(created))
}

async fn not_found() -> ApiError {
    ApiError::not_found()
}
