use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::auth::{
    DEFAULT_CACHE_TTL_SECONDS, DEFAULT_CLOCK_SKEW_SECONDS, DEFAULT_VALIDATION_TIMEOUT_SECONDS,
    JwksCacheOptions, ValidationOptions,
};
use crate::auth::jwks::{DEFAULT_FETCH_TIMEOUT_SECONDS, DEFAULT_MIN_REFRESH_SECONDS};
use crate::cors::{
    CorsPolicy, DEFAULT_ALLOW_HEADERS, DEFAULT_ALLOW_METHODS, DEFAULT_MAX_AGE_SECONDS,
};
use crate::pipeline::DEFAULT_REQUEST_TIMEOUT_SECONDS;

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "COA_CONFIG";

/// Settings file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "coa.json";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to set up signing-key cache: {0}")]
    Jwks(#[from] crate::auth::JwksCacheError),
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    /// Enables the debug identity fallback and error text in 500 bodies.
    pub debug: bool,
    /// Identity provider; without it every credential is rejected.
    pub auth: Option<AuthSettings>,
    pub cors: CorsSettings,
    pub authorization: AuthorizationSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
    pub api_prefix: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            api_prefix: "/api".to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECONDS,
        }
    }
}

impl ServerSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Identity provider settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthSettings {
    /// Expected `iss` claim
    pub issuer: String,
    /// Accepted `aud` (or `appid`/`azp`) values
    pub audiences: Vec<String>,
    /// JWKS endpoint URL for key fetching
    pub jwks_url: String,
    /// JWKS cache TTL in seconds (default: 3600)
    #[serde(default = "default_jwks_cache_seconds")]
    pub jwks_cache_seconds: u64,
    /// Whether to allow stale JWKS cache on fetch failure
    #[serde(default = "default_allow_stale_jwks")]
    pub allow_stale_jwks: bool,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_validation_timeout_secs")]
    pub validation_timeout_secs: u64,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
    /// Minimum interval between refreshes triggered by unknown key ids
    #[serde(default = "default_min_refresh_seconds")]
    pub min_refresh_seconds: u64,
}

fn default_jwks_cache_seconds() -> u64 {
    DEFAULT_CACHE_TTL_SECONDS
}

fn default_allow_stale_jwks() -> bool {
    true
}

fn default_fetch_timeout_secs() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECONDS
}

fn default_validation_timeout_secs() -> u64 {
    DEFAULT_VALIDATION_TIMEOUT_SECONDS
}

fn default_clock_skew_secs() -> u64 {
    DEFAULT_CLOCK_SKEW_SECONDS
}

fn default_min_refresh_seconds() -> u64 {
    DEFAULT_MIN_REFRESH_SECONDS
}

impl AuthSettings {
    pub fn new(
        issuer: impl Into<String>,
        audiences: Vec<String>,
        jwks_url: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audiences,
            jwks_url: jwks_url.into(),
            jwks_cache_seconds: default_jwks_cache_seconds(),
            allow_stale_jwks: default_allow_stale_jwks(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            validation_timeout_secs: default_validation_timeout_secs(),
            clock_skew_secs: default_clock_skew_secs(),
            min_refresh_seconds: default_min_refresh_seconds(),
        }
    }

    /// Azure AD v2.0 endpoints for a tenant; accepts both the bare client id
    /// and its `api://` form as audience.
    pub fn azure_ad(tenant_id: &str, client_id: &str) -> Self {
        Self::new(
            format!("https://login.microsoftonline.com/{}/v2.0", tenant_id),
            vec![client_id.to_string(), format!("api://{}", client_id)],
            format!(
                "https://login.microsoftonline.com/{}/discovery/v2.0/keys",
                tenant_id
            ),
        )
    }

    pub fn validation_options(&self) -> ValidationOptions {
        let mut options = ValidationOptions::new(self.issuer.clone(), self.audiences.clone());
        options.clock_skew = Duration::from_secs(self.clock_skew_secs);
        options.timeout = Duration::from_secs(self.validation_timeout_secs);
        options
    }

    pub fn jwks_options(&self) -> JwksCacheOptions {
        JwksCacheOptions {
            cache_ttl: Duration::from_secs(self.jwks_cache_seconds),
            allow_stale: self.allow_stale_jwks,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            min_refresh_interval: Duration::from_secs(self.min_refresh_seconds),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.issuer)
            .map_err(|e| ConfigError::invalid("auth.issuer", e.to_string()))?;

        let jwks = url::Url::parse(&self.jwks_url)
            .map_err(|e| ConfigError::invalid("auth.jwks_url", e.to_string()))?;
        if !matches!(jwks.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "auth.jwks_url",
                format!("unsupported scheme `{}`", jwks.scheme()),
            ));
        }

        if self.audiences.iter().all(|a| a.trim().is_empty()) {
            return Err(ConfigError::invalid(
                "auth.audiences",
                "at least one audience is required",
            ));
        }
        if self.fetch_timeout_secs == 0 || self.validation_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "auth.fetch_timeout_secs",
                "timeouts must be non-zero",
            ));
        }
        if self.fetch_timeout_secs >= self.validation_timeout_secs {
            return Err(ConfigError::invalid(
                "auth.fetch_timeout_secs",
                format!(
                    "must be shorter than validation_timeout_secs ({})",
                    self.validation_timeout_secs
                ),
            ));
        }
        if self.jwks_cache_seconds == 0 {
            return Err(ConfigError::invalid(
                "auth.jwks_cache_seconds",
                "cache TTL must be non-zero",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorsModeSetting {
    #[default]
    AllowList,
    Permissive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub mode: CorsModeSetting,
    pub origins: Vec<String>,
    pub allow_methods: Vec<String>,
    pub allow_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            mode: CorsModeSetting::AllowList,
            origins: vec![
                "http://localhost:3000".to_string(),
                "https://localhost:3000".to_string(),
                "http://localhost:8000".to_string(),
                "https://localhost:8000".to_string(),
            ],
            allow_methods: DEFAULT_ALLOW_METHODS.iter().map(|m| m.to_string()).collect(),
            allow_headers: DEFAULT_ALLOW_HEADERS.iter().map(|h| h.to_string()).collect(),
            allow_credentials: true,
            max_age_secs: DEFAULT_MAX_AGE_SECONDS,
        }
    }
}

impl CorsSettings {
    pub fn to_policy(&self) -> CorsPolicy {
        let policy = match self.mode {
            CorsModeSetting::AllowList => CorsPolicy::allow_list(&self.origins),
            CorsModeSetting::Permissive => CorsPolicy::permissive(),
        };
        policy
            .with_methods(&self.allow_methods)
            .with_headers(&self.allow_headers)
            .with_credentials(self.allow_credentials)
            .with_max_age(Duration::from_secs(self.max_age_secs))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationSettings {
    /// Role required by mutating CRUD routes; unset means any principal.
    pub write_role: Option<String>,
}

impl Settings {
    /// Load from `explicit`, `$COA_CONFIG` or `./coa.json`, falling back to
    /// defaults when none of them exists.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match resolve_config_path(explicit) {
            Some(path) => Self::from_file(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse settings JSON, expanding `${VAR}` in every string value.
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        let mut value: serde_json::Value = serde_json::from_str(raw)?;
        expand_value(&mut value);
        serde_json::from_value(value)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.api_prefix.is_empty() && !self.server.api_prefix.starts_with('/') {
            return Err(ConfigError::invalid(
                "server.api_prefix",
                "must be empty or start with `/`",
            ));
        }
        if self.server.request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "server.request_timeout_secs",
                "must be non-zero",
            ));
        }
        if let Some(auth) = &self.auth {
            auth.validate()?;
        }
        if self.cors.mode == CorsModeSetting::AllowList && self.cors.origins.is_empty() {
            return Err(ConfigError::invalid(
                "cors.origins",
                "allow_list mode needs at least one origin",
            ));
        }
        Ok(())
    }
}

/// An explicit path wins even if missing, so typos surface as read errors.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    if let Ok(p) = env::var(CONFIG_ENV) {
        return Some(PathBuf::from(p));
    }

    let candidate = PathBuf::from(DEFAULT_CONFIG_FILE);
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

fn expand_value(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => *s = expand_env_vars(s),
        serde_json::Value::Array(items) => items.iter_mut().for_each(expand_value),
        serde_json::Value::Object(map) => map.values_mut().for_each(expand_value),
        _ => {}
    }
}

/// Replace `${NAME}` with the variable's value; unknown names stay as-is.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}
