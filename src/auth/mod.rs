//! Request authentication.
//!
//! Every request that needs an identity goes through the same path:
//!
//! - **Extraction**: a bearer credential from the `Authorization` header
//! - **Validation**: signature, expiry, issuer and audience of the token,
//!   against signing keys cached from the identity provider
//! - **Resolution**: validated claims mapped onto a [`Principal`]
//! - **Gating**: [`AuthGate`] applies a route's [`AuthRequirement`]
//!
//! ## Security Model
//!
//! - Raw tokens are never logged; only a short fingerprint
//! - Provider outages fail closed (401), never open
//! - The debug identity only ever reaches optional routes
//!
//! ## Usage
//!
//! ```ignore
//! async fn me(RequireAuth(principal): RequireAuth) -> Json<Principal> {
//!     Json(principal)
//! }
//! ```

mod extractor;
mod gate;
pub mod jwks;
mod principal;
mod validator;

#[cfg(test)]
pub(crate) mod test_support;

pub use extractor::bearer_credential;
pub use gate::{
    AuthGate, AuthRequirement, DEBUG_FALLBACK_MARKER, DebugIdentityFallback, OptionalAuth,
    RequireAuth, enforce,
};
pub use jwks::{DEFAULT_CACHE_TTL_SECONDS, JwksCache, JwksCacheError, JwksCacheOptions};
pub use principal::{Principal, PrincipalSource};
pub use validator::{
    AuthFailure, ClaimSet, DEFAULT_CLOCK_SKEW_SECONDS, DEFAULT_VALIDATION_TIMEOUT_SECONDS,
    TokenValidator, ValidationOptions,
};
