// Core modules
pub mod api;
pub mod auth;
pub mod config;
pub mod cors;
pub mod error;
pub mod pipeline;
pub mod store;
pub mod types;

#[cfg(test)]
mod integration_tests;

// Re-export key types and functions
pub use auth::{
    AuthGate, AuthRequirement, DebugIdentityFallback, JwksCache, Principal, TokenValidator,
};
pub use config::{AuthSettings, ConfigError, Settings};
pub use cors::CorsPolicy;
pub use error::{ApiError, ErrorEnvelope};
pub use pipeline::Pipeline;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use api::AppState;
use store::RecordStore;

/// A ready-to-serve router plus the key cache the caller should keep warm.
pub struct App {
    pub router: Router,
    pub jwks: Option<Arc<JwksCache>>,
    pub jwks_refresh_interval: Option<Duration>,
}

/// Validate `settings` and build the full application.
pub fn create_app(settings: &Settings) -> Result<App, ConfigError> {
    settings.validate()?;

    let (validator, jwks, interval) = match &settings.auth {
        Some(auth) => {
            let keys = Arc::new(JwksCache::remote(auth.jwks_url.clone(), auth.jwks_options())?);
            let validator = TokenValidator::new(auth.validation_options(), keys.clone());
            (
                Some(Arc::new(validator)),
                Some(keys),
                Some(Duration::from_secs(auth.jwks_cache_seconds)),
            )
        }
        None => {
            warn!("No identity provider configured; every bearer token will be rejected");
            (None, None, None)
        }
    };

    Ok(App {
        router: build_router(settings, validator),
        jwks,
        jwks_refresh_interval: interval,
    })
}

/// Assemble routes, gate and pipeline around an already-built validator.
pub fn build_router(settings: &Settings, validator: Option<Arc<TokenValidator>>) -> Router {
    let fallback = DebugIdentityFallback::from_debug_flag(settings.debug);
    let gate = Arc::new(AuthGate::new(validator, fallback));

    let state = AppState {
        gate,
        store: Arc::new(RecordStore::new()),
        write_role: settings.authorization.write_role.clone(),
        auth_enabled: settings.auth.is_some(),
        debug: settings.debug,
    };

    let router = api::create_router(state, &settings.server.api_prefix);

    Pipeline::new(settings.cors.to_policy(), settings.debug)
        .with_request_timeout(settings.server.request_timeout())
        .wrap(router)
}
