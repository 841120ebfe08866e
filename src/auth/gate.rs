//! The single place where requests are authenticated.
//!
//! Routes never inspect tokens themselves. They either sit behind
//! [`enforce`] with an [`AuthRequirement`], or take one of the extractors
//! [`RequireAuth`] / [`OptionalAuth`].

use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::HeaderMap;
use http::request::Parts;
use tracing::{debug, error, info, warn};

use crate::auth::extractor::bearer_credential;
use crate::auth::principal::{Principal, PrincipalSource};
use crate::auth::validator::{AuthFailure, TokenValidator};
use crate::error::ApiError;

/// Log marker for requests served with the synthetic identity.
pub const DEBUG_FALLBACK_MARKER: &str = "DEBUG_IDENTITY_FALLBACK";

/// Authentication a route group needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    /// A valid token or 401.
    Mandatory,
    /// A principal if one can be resolved; never fails.
    Optional,
    /// The gate is not consulted.
    None,
}

/// Development-only substitute identity for optional routes.
///
/// This is a local-development escape hatch, not a security feature.
/// It is fixed at startup from the debug flag and cannot be switched on
/// later. It never applies to mandatory routes.
#[derive(Debug, Clone)]
pub struct DebugIdentityFallback {
    principal: Option<Principal>,
}

impl DebugIdentityFallback {
    pub const USER_ID: &'static str = "debug-user-id";

    pub fn from_debug_flag(debug: bool) -> Self {
        if debug {
            Self::enabled()
        } else {
            Self::disabled()
        }
    }

    pub fn disabled() -> Self {
        Self { principal: None }
    }

    fn enabled() -> Self {
        let principal = Principal::new(Self::USER_ID)
            .with_name("Debug User")
            .with_email("debug@localhost")
            .with_roles(["user"])
            .with_source(PrincipalSource::DebugFallback);
        Self {
            principal: Some(principal),
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }
}

/// Runs credential extraction, token validation and principal resolution.
pub struct AuthGate {
    /// `None` when no identity provider is configured.
    validator: Option<Arc<TokenValidator>>,
    fallback: DebugIdentityFallback,
}

impl AuthGate {
    pub fn new(validator: Option<Arc<TokenValidator>>, fallback: DebugIdentityFallback) -> Self {
        Self {
            validator,
            fallback,
        }
    }

    /// Resolve the caller, reporting exactly why it failed.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthFailure> {
        let credential = bearer_credential(headers).ok_or(AuthFailure::MissingCredential)?;

        let validator = self.validator.as_ref().ok_or_else(|| {
            AuthFailure::ProviderUnavailable("no identity provider configured".to_string())
        })?;

        let outcome = match validator.validate(&credential).await {
            Ok(claims) => Principal::from_claims(&claims),
            Err(failure) => Err(failure),
        };

        match &outcome {
            Ok(principal) => {
                debug!(
                    principal = %principal.id(),
                    token = %credential.fingerprint(),
                    "Bearer token accepted"
                );
            }
            Err(failure) if failure.is_operational() => {
                error!(
                    failure = failure.kind(),
                    token = %credential.fingerprint(),
                    error = %failure,
                    "Token could not be validated: identity provider unavailable"
                );
            }
            Err(failure) => {
                info!(
                    failure = failure.kind(),
                    token = %credential.fingerprint(),
                    error = %failure,
                    "Bearer token rejected"
                );
            }
        }

        outcome
    }

    /// A principal or `AuthenticationRequired`.
    pub async fn require_authenticated(&self, headers: &HeaderMap) -> Result<Principal, ApiError> {
        self.authenticate(headers)
            .await
            .map_err(|_| ApiError::AuthenticationRequired)
    }

    /// A principal, the debug identity, or nothing. Never fails.
    pub async fn optional_authenticated(&self, headers: &HeaderMap) -> Option<Principal> {
        match self.authenticate(headers).await {
            Ok(principal) => Some(principal),
            Err(failure) => {
                let principal = self.fallback.principal()?;
                warn!(
                    marker = DEBUG_FALLBACK_MARKER,
                    principal = %principal.id(),
                    failure = failure.kind(),
                    "Serving request as synthetic debug identity"
                );
                Some(principal.clone())
            }
        }
    }

    pub async fn resolve(
        &self,
        requirement: AuthRequirement,
        headers: &HeaderMap,
    ) -> Result<Option<Principal>, ApiError> {
        match requirement {
            AuthRequirement::Mandatory => self.require_authenticated(headers).await.map(Some),
            AuthRequirement::Optional => Ok(self.optional_authenticated(headers).await),
            AuthRequirement::None => Ok(None),
        }
    }
}

/// Outcome stored in request extensions by [`enforce`].
#[derive(Debug, Clone)]
enum Resolved {
    /// Passed a mandatory check; never the debug identity.
    Authenticated(Principal),
    Optional(Option<Principal>),
}

/// Route-group middleware: resolve once according to `requirement`.
///
/// Used with `axum::middleware::from_fn_with_state((gate, requirement), enforce)`.
pub async fn enforce(
    State((gate, requirement)): State<(Arc<AuthGate>, AuthRequirement)>,
    mut request: Request,
    next: Next,
) -> Response {
    let principal = match gate.resolve(requirement, request.headers()).await {
        Ok(principal) => principal,
        Err(err) => return err.into_response(),
    };
    let resolved = match requirement {
        AuthRequirement::Mandatory => principal.map(Resolved::Authenticated),
        AuthRequirement::Optional => Some(Resolved::Optional(principal)),
        AuthRequirement::None => None,
    };

    if let Some(resolved) = resolved {
        request.extensions_mut().insert(resolved);
    }

    next.run(request).await
}

/// Extractor for handlers that need an authenticated caller.
#[derive(Debug, Clone)]
pub struct RequireAuth(pub Principal);

impl<S> FromRequestParts<S> for RequireAuth
where
    S: Send + Sync,
    Arc<AuthGate>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(Resolved::Authenticated(principal)) = parts.extensions.get::<Resolved>() {
            return Ok(Self(principal.clone()));
        }

        let gate = Arc::<AuthGate>::from_ref(state);
        gate.require_authenticated(&parts.headers).await.map(Self)
    }
}

/// Extractor for handlers that serve anonymous callers too.
#[derive(Debug, Clone)]
pub struct OptionalAuth(pub Option<Principal>);

impl<S> FromRequestParts<S> for OptionalAuth
where
    S: Send + Sync,
    Arc<AuthGate>: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<Resolved>() {
            Some(Resolved::Authenticated(principal)) => Ok(Self(Some(principal.clone()))),
            Some(Resolved::Optional(principal)) => Ok(Self(principal.clone())),
            None => {
                let gate = Arc::<AuthGate>::from_ref(state);
                Ok(Self(gate.optional_authenticated(&parts.headers).await))
            }
        }
    }
}
