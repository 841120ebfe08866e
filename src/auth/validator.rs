//! Bearer token validation against the identity provider's signing keys.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::{Error as JwtError, ErrorKind};
use jsonwebtoken::{Algorithm, Validation, decode, decode_header};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::jwks::JwksCache;
use crate::types::RawCredential;

/// Default allowance for clock drift between us and the identity provider.
pub const DEFAULT_CLOCK_SKEW_SECONDS: u64 = 60;

/// Default upper bound for one validation, key fetch included.
pub const DEFAULT_VALIDATION_TIMEOUT_SECONDS: u64 = 5;

/// Claims of a token whose signature and time window have been verified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimSet(Map<String, Value>);

impl ClaimSet {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// A claim that is a non-empty string.
    pub fn str(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// A claim that may be a single string or a list of strings.
    ///
    /// Non-string list entries are ignored; a missing claim is empty.
    pub fn strings(&self, key: &str) -> BTreeSet<String> {
        match self.0.get(key) {
            Some(Value::String(s)) if !s.is_empty() => BTreeSet::from([s.clone()]),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => BTreeSet::new(),
        }
    }
}

impl From<Map<String, Value>> for ClaimSet {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Why a credential was not accepted.
///
/// Callers only ever see a 401; the variant is for logs and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthFailure {
    #[error("no bearer credential presented")]
    MissingCredential,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("token signature could not be verified")]
    BadSignature,
    #[error("token issuer does not match")]
    IssuerMismatch,
    #[error("token audience does not match")]
    AudienceMismatch,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("identity provider unavailable: {0}")]
    ProviderUnavailable(String),
}

impl AuthFailure {
    /// Stable name for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MissingCredential => "MissingCredential",
            Self::Expired => "Expired",
            Self::NotYetValid => "NotYetValid",
            Self::BadSignature => "BadSignature",
            Self::IssuerMismatch => "IssuerMismatch",
            Self::AudienceMismatch => "AudienceMismatch",
            Self::Malformed(_) => "Malformed",
            Self::ProviderUnavailable(_) => "ProviderUnavailable",
        }
    }

    /// An operational condition on our side rather than a caller error.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_))
    }
}

impl From<JwtError> for AuthFailure {
    fn from(err: JwtError) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::ImmatureSignature => Self::NotYetValid,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => Self::BadSignature,
            ErrorKind::InvalidIssuer => Self::IssuerMismatch,
            ErrorKind::InvalidAudience => Self::AudienceMismatch,
            ErrorKind::MissingRequiredClaim(claim) => {
                Self::Malformed(format!("missing required claim `{}`", claim))
            }
            _ => Self::Malformed(err.to_string()),
        }
    }
}

/// What a token must satisfy besides a valid signature.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Exact expected `iss`.
    pub issuer: String,
    /// Accepted `aud` values; `appid`/`azp` are also compared against these.
    pub audiences: Vec<String>,
    pub clock_skew: Duration,
    /// Bound on one validation including any key fetch.
    pub timeout: Duration,
}

impl ValidationOptions {
    pub fn new(issuer: impl Into<String>, audiences: Vec<String>) -> Self {
        Self {
            issuer: issuer.into(),
            audiences,
            clock_skew: Duration::from_secs(DEFAULT_CLOCK_SKEW_SECONDS),
            timeout: Duration::from_secs(DEFAULT_VALIDATION_TIMEOUT_SECONDS),
        }
    }
}

/// Verifies RS256 bearer tokens issued by one identity provider.
pub struct TokenValidator {
    options: ValidationOptions,
    keys: Arc<JwksCache>,
}

impl TokenValidator {
    pub fn new(options: ValidationOptions, keys: Arc<JwksCache>) -> Self {
        Self { options, keys }
    }

    /// Validate `credential`, giving up with `ProviderUnavailable` once the
    /// configured timeout elapses.
    pub async fn validate(&self, credential: &RawCredential) -> Result<ClaimSet, AuthFailure> {
        match tokio::time::timeout(self.options.timeout, self.validate_inner(credential)).await {
            Ok(result) => result,
            Err(_) => Err(AuthFailure::ProviderUnavailable(format!(
                "validation timed out after {:?}",
                self.options.timeout
            ))),
        }
    }

    async fn validate_inner(&self, credential: &RawCredential) -> Result<ClaimSet, AuthFailure> {
        let token = credential.as_str();

        let header = decode_header(token)
            .map_err(|e| AuthFailure::Malformed(format!("invalid header: {}", e)))?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthFailure::BadSignature);
        }

        let decoding_key = self
            .keys
            .get_key(header.kid.as_deref())
            .await
            .map_err(|e| {
                if e.is_provider_unavailable() {
                    AuthFailure::ProviderUnavailable(e.to_string())
                } else {
                    // The provider doesn't know this key: treat as a forged signature.
                    AuthFailure::BadSignature
                }
            })?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = self.options.clock_skew.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        // Audience is checked below so that `appid`/`azp` can satisfy it.
        validation.validate_aud = false;
        validation.set_issuer(&[self.options.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let claims = decode::<ClaimSet>(token, &decoding_key, &validation)?.claims;

        if let Some(iat) = claims.i64("iat") {
            let now = chrono::Utc::now().timestamp();
            let skew = i64::try_from(self.options.clock_skew.as_secs()).unwrap_or(i64::MAX);
            if iat > now.saturating_add(skew) {
                return Err(AuthFailure::NotYetValid);
            }
        }

        self.check_audience(&claims)?;

        Ok(claims)
    }

    fn check_audience(&self, claims: &ClaimSet) -> Result<(), AuthFailure> {
        let accepted = |value: &str| self.options.audiences.iter().any(|a| a == value);

        if claims.strings("aud").iter().any(|aud| accepted(aud.as_str())) {
            return Ok(());
        }

        let client = claims.str("appid").or_else(|| claims.str("azp"));
        if client.is_some_and(accepted) {
            return Ok(());
        }

        Err(AuthFailure::AudienceMismatch)
    }
}
