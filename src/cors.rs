//! Cross-origin header negotiation.
//!
//! [`CorsPolicy::headers`] is a pure function of the request origin, the
//! requested preflight headers and the policy. The pipeline applies its
//! result to every outgoing response, errors included.

use std::time::Duration;

use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS, VARY,
};
use http::{HeaderMap, HeaderValue, Method};

pub const DEFAULT_MAX_AGE_SECONDS: u64 = 3600;

/// Methods allowed when none are configured.
pub const DEFAULT_ALLOW_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "OPTIONS", "HEAD"];

/// Request headers allowed when none are configured.
pub const DEFAULT_ALLOW_HEADERS: &[&str] = &[
    "Accept",
    "Accept-Language",
    "Content-Language",
    "Content-Type",
    "Authorization",
    "X-Requested-With",
    "Origin",
    "Referer",
    "User-Agent",
    "X-API-Key",
];

/// One entry of an origin allow-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPattern {
    /// `*`
    Any,
    /// `https://app.example.com`
    Exact(String),
    /// `http://localhost:*`: literal prefix before a trailing `*`.
    Prefix(String),
    /// `https://*.example.com`: any subdomain under the scheme.
    Subdomain { scheme: String, suffix: String },
}

impl OriginPattern {
    pub fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim().trim_end_matches('/');

        if pattern == "*" {
            return Self::Any;
        }

        if let Some((scheme, rest)) = pattern.split_once("://*.") {
            if !rest.is_empty() && !rest.contains('*') {
                return Self::Subdomain {
                    scheme: scheme.to_ascii_lowercase(),
                    suffix: format!(".{}", rest.to_ascii_lowercase()),
                };
            }
        }

        match pattern.strip_suffix('*') {
            Some(prefix) => Self::Prefix(prefix.to_ascii_lowercase()),
            None => Self::Exact(pattern.to_ascii_lowercase()),
        }
    }

    pub fn matches(&self, origin: &str) -> bool {
        let origin = origin.to_ascii_lowercase();
        match self {
            Self::Any => true,
            Self::Exact(exact) => origin == *exact,
            Self::Prefix(prefix) => origin.starts_with(prefix.as_str()),
            Self::Subdomain { scheme, suffix } => origin
                .strip_prefix(scheme.as_str())
                .and_then(|rest| rest.strip_prefix("://"))
                .is_some_and(|host| host.len() > suffix.len() && host.ends_with(suffix.as_str())),
        }
    }
}

/// How the allowed origin is decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsMode {
    AllowList(Vec<OriginPattern>),
    /// Echo whatever `Origin` the request carries.
    Permissive,
}

/// Which half of the CORS exchange a request is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsRequest {
    /// `OPTIONS`, with the `Access-Control-Request-Headers` value if sent.
    Preflight { request_headers: Option<HeaderValue> },
    Actual,
}

impl CorsRequest {
    pub fn classify(method: &Method, headers: &HeaderMap) -> Self {
        if method == Method::OPTIONS {
            Self::Preflight {
                request_headers: headers.get(ACCESS_CONTROL_REQUEST_HEADERS).cloned(),
            }
        } else {
            Self::Actual
        }
    }

    pub fn is_preflight(&self) -> bool {
        matches!(self, Self::Preflight { .. })
    }
}

#[derive(Debug, Clone)]
pub struct CorsPolicy {
    mode: CorsMode,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    allow_credentials: bool,
    max_age: Duration,
}

impl CorsPolicy {
    /// Echo any origin, credentials allowed.
    pub fn permissive() -> Self {
        Self::with_mode(CorsMode::Permissive)
    }

    pub fn allow_list<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = origins
            .into_iter()
            .map(|origin| OriginPattern::parse(origin.as_ref()))
            .collect();
        Self::with_mode(CorsMode::AllowList(patterns))
    }

    fn with_mode(mode: CorsMode) -> Self {
        Self {
            mode,
            allow_methods: join_header(DEFAULT_ALLOW_METHODS),
            allow_headers: join_header(DEFAULT_ALLOW_HEADERS),
            allow_credentials: true,
            max_age: Duration::from_secs(DEFAULT_MAX_AGE_SECONDS),
        }
    }

    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let methods: Vec<String> = methods
            .into_iter()
            .map(|m| m.as_ref().to_ascii_uppercase())
            .collect();
        if !methods.is_empty() {
            self.allow_methods = join_header(&methods);
        }
        self
    }

    pub fn with_headers<I, S>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let headers: Vec<String> = headers
            .into_iter()
            .map(|h| h.as_ref().to_string())
            .collect();
        if !headers.is_empty() {
            self.allow_headers = join_header(&headers);
        }
        self
    }

    pub fn with_credentials(mut self, allow: bool) -> Self {
        self.allow_credentials = allow;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn mode(&self) -> &CorsMode {
        &self.mode
    }

    pub fn is_permissive(&self) -> bool {
        self.mode == CorsMode::Permissive
    }

    pub fn allows_credentials(&self) -> bool {
        self.allow_credentials
    }

    fn admits_any(&self) -> bool {
        match &self.mode {
            CorsMode::Permissive => true,
            CorsMode::AllowList(patterns) => patterns.contains(&OriginPattern::Any),
        }
    }

    /// Whether `origin` would receive CORS headers.
    pub fn allows_origin(&self, origin: &str) -> bool {
        match &self.mode {
            CorsMode::Permissive => true,
            CorsMode::AllowList(patterns) => patterns.iter().any(|p| p.matches(origin)),
        }
    }

    /// The `Access-Control-Allow-Origin` value, or `None` to omit CORS
    /// headers entirely.
    fn allowed_origin(&self, origin: Option<&HeaderValue>) -> Option<HeaderValue> {
        match origin {
            Some(origin) => {
                let text = origin.to_str().ok()?;
                if !self.allows_origin(text) {
                    return None;
                }
                // Without credentials a wildcard list can answer statically.
                if !self.allow_credentials && !self.is_permissive() && self.admits_any() {
                    Some(HeaderValue::from_static("*"))
                } else {
                    Some(origin.clone())
                }
            }
            None if !self.allow_credentials && self.admits_any() => {
                Some(HeaderValue::from_static("*"))
            }
            None => None,
        }
    }

    /// Compute the CORS headers for one response.
    pub fn headers(&self, origin: Option<&HeaderValue>, request: &CorsRequest) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let Some(allow_origin) = self.allowed_origin(origin) else {
            return headers;
        };
        let echoed = allow_origin != "*";

        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        if self.allow_credentials {
            headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());

        let mut vary = Vec::new();
        if echoed {
            vary.push("Origin");
        }

        match request {
            CorsRequest::Preflight { request_headers } if self.is_permissive() => {
                match request_headers {
                    Some(requested) => {
                        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, requested.clone());
                        vary.push("Access-Control-Request-Headers");
                    }
                    None => {
                        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
                    }
                }
            }
            _ => {
                headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
            }
        }

        if request.is_preflight() {
            headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(self.max_age.as_secs()));
        }

        if !vary.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&vary.join(", ")) {
                headers.insert(VARY, value);
            }
        }

        headers
    }

    /// Merge the computed headers into `target`, extending any `Vary`
    /// already present instead of replacing it.
    pub fn apply(
        &self,
        target: &mut HeaderMap,
        origin: Option<&HeaderValue>,
        request: &CorsRequest,
    ) {
        for (name, value) in self.headers(origin, request) {
            let Some(name) = name else { continue };
            if name == VARY {
                target.append(VARY, value);
            } else {
                target.insert(name, value);
            }
        }
    }
}

fn join_header<S: AsRef<str>>(items: &[S]) -> HeaderValue {
    let joined = items
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(", ");
    HeaderValue::from_str(&joined).unwrap_or_else(|_| HeaderValue::from_static(""))
}
