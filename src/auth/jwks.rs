//! JWKS (JSON Web Key Set) fetching and caching module.
//!
//! The cache holds an immutable [`KeySnapshot`] behind an [`ArcSwap`].
//! Readers load the current snapshot without taking a lock; a refresh builds
//! a complete new snapshot and swaps it in. Refreshers serialize on an async
//! mutex so a burst of key-id misses results in a single fetch, and a failed
//! fetch is not retried by requests until `min_refresh_interval` has passed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default cache TTL in seconds (1 hour).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 3600;

/// Maximum stale cache age in seconds (24 hours).
pub const MAX_STALE_CACHE_SECONDS: u64 = 86400;

/// Default timeout for a single JWKS fetch. Kept below the validation
/// timeout so a hung provider surfaces as a fetch error.
pub const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 3;

/// Minimum spacing between refreshes triggered by an unknown key id.
pub const DEFAULT_MIN_REFRESH_SECONDS: u64 = 30;

/// A single JSON Web Key from a JWKS document.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA")
    pub kty: String,
    /// Key ID (optional, used to match JWT header kid)
    pub kid: Option<String>,
    /// Algorithm (e.g., "RS256")
    pub alg: Option<String>,
    /// Key use (e.g., "sig" for signature)
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url encoded)
    pub n: Option<String>,
    /// RSA exponent (base64url encoded)
    pub e: Option<String>,
    /// X.509 certificate chain
    pub x5c: Option<Vec<String>>,
}

/// A JWKS document containing multiple keys.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// One immutable generation of signing keys.
pub struct KeySnapshot {
    keys: HashMap<String, DecodingKey>,
    /// Kid of the first usable key in document order, for tokens without a kid.
    first: Option<String>,
    /// `None` for the empty initial snapshot.
    fetched_at: Option<Instant>,
}

impl KeySnapshot {
    fn empty() -> Self {
        Self {
            keys: HashMap::new(),
            first: None,
            fetched_at: None,
        }
    }

    /// Build a snapshot from a JWKS document, skipping keys that cannot be
    /// used for RS256 signature verification.
    pub fn from_document(doc: JwksDocument) -> Result<Self, JwksCacheError> {
        let mut keys = HashMap::new();
        let mut first = None;

        for jwk in doc.keys {
            // Only process RSA keys for now
            if jwk.kty != "RSA" {
                debug!("Skipping non-RSA key: {:?}", jwk.kty);
                continue;
            }

            if jwk.key_use.as_deref() == Some("enc") {
                debug!("Skipping encryption key");
                continue;
            }

            if let Some(alg) = jwk.alg.as_deref()
                && alg != "RS256"
            {
                debug!("Skipping key with unsupported alg {}", alg);
                continue;
            }

            match jwk_to_decoding_key(&jwk) {
                Ok(decoding_key) => {
                    let kid = jwk.kid.clone().unwrap_or_else(|| "default".to_string());
                    debug!("Cached key with kid: {}", kid);
                    if first.is_none() {
                        first = Some(kid.clone());
                    }
                    keys.insert(kid, decoding_key);
                }
                Err(e) => {
                    warn!("Failed to parse JWK: {}", e);
                }
            }
        }

        if keys.is_empty() {
            return Err(JwksCacheError::NoValidKeys);
        }

        Ok(Self {
            keys,
            first,
            fetched_at: Some(Instant::now()),
        })
    }

    /// Look up a key; with no kid, the first key of the document is used.
    pub fn get(&self, kid: Option<&str>) -> Option<DecodingKey> {
        let kid = kid.or(self.first.as_deref())?;
        self.keys.get(kid).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn age(&self) -> Option<Duration> {
        self.fetched_at.map(|t| t.elapsed())
    }

    fn is_fresh(&self, ttl: Duration) -> bool {
        self.age().is_some_and(|age| age <= ttl)
    }
}

/// Fetches the key set from the provider.
#[derive(Clone)]
struct Fetcher {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl Fetcher {
    async fn fetch(&self) -> Result<KeySnapshot, JwksCacheError> {
        debug!("Fetching JWKS from {}", self.url);

        let fetch = async {
            let response = self
                .client
                .get(&self.url)
                .send()
                .await
                .map_err(|e| JwksCacheError::FetchError(e.to_string()))?;

            if !response.status().is_success() {
                return Err(JwksCacheError::FetchError(format!(
                    "HTTP {} from JWKS endpoint",
                    response.status()
                )));
            }

            response
                .json::<JwksDocument>()
                .await
                .map_err(|e| JwksCacheError::ParseError(e.to_string()))
        };

        let doc = tokio::time::timeout(self.timeout, fetch)
            .await
            .map_err(|_| {
                JwksCacheError::FetchError(format!("timed out after {:?}", self.timeout))
            })??;

        KeySnapshot::from_document(doc)
    }
}

/// Settings for a remote JWKS cache.
#[derive(Debug, Clone)]
pub struct JwksCacheOptions {
    pub cache_ttl: Duration,
    pub allow_stale: bool,
    pub fetch_timeout: Duration,
    /// Spacing between kid-miss refreshes, and backoff after a failed fetch.
    pub min_refresh_interval: Duration,
}

impl Default for JwksCacheOptions {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
            allow_stale: true,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECONDS),
            min_refresh_interval: Duration::from_secs(DEFAULT_MIN_REFRESH_SECONDS),
        }
    }
}

/// State shared between the cache and its background refreshes.
struct Shared {
    snapshot: ArcSwap<KeySnapshot>,
    /// Held only by refreshers.
    refresh_lock: Arc<Mutex<()>>,
    /// When the last fetch failed; cleared by a successful one.
    last_failure: ArcSwapOption<Instant>,
}

impl Shared {
    fn new(snapshot: KeySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            refresh_lock: Arc::new(Mutex::new(())),
            last_failure: ArcSwapOption::empty(),
        }
    }

    fn backing_off(&self, window: Duration) -> bool {
        self.last_failure
            .load_full()
            .is_some_and(|failed_at| failed_at.elapsed() < window)
    }

    /// Fetch and swap in a new snapshot. Caller holds `refresh_lock`.
    async fn fetch_and_store(&self, fetcher: &Fetcher) -> Result<Arc<KeySnapshot>, JwksCacheError> {
        match fetcher.fetch().await {
            Ok(next) => {
                let next = Arc::new(next);
                self.snapshot.store(Arc::clone(&next));
                self.last_failure.store(None);
                Ok(next)
            }
            Err(e) => {
                self.last_failure.store(Some(Arc::new(Instant::now())));
                Err(e)
            }
        }
    }
}

/// Lock-free-read JWKS cache with lazy and periodic refresh.
pub struct JwksCache {
    /// `None` for a fixed key set that is never refreshed.
    fetcher: Option<Fetcher>,
    options: JwksCacheOptions,
    shared: Arc<Shared>,
}

impl JwksCache {
    /// Create a cache that fetches from `jwks_url` on demand.
    pub fn remote(jwks_url: String, options: JwksCacheOptions) -> Result<Self, JwksCacheError> {
        let client = reqwest::Client::builder()
            .timeout(options.fetch_timeout)
            .build()
            .map_err(|e| JwksCacheError::FetchError(format!("HTTP client: {}", e)))?;

        Ok(Self {
            fetcher: Some(Fetcher {
                url: jwks_url,
                client,
                timeout: options.fetch_timeout,
            }),
            options,
            shared: Arc::new(Shared::new(KeySnapshot::empty())),
        })
    }

    /// Create a cache over a fixed key set that is never refreshed.
    pub fn from_document(doc: JwksDocument) -> Result<Self, JwksCacheError> {
        let snapshot = KeySnapshot::from_document(doc)?;
        Ok(Self {
            fetcher: None,
            options: JwksCacheOptions {
                cache_ttl: Duration::MAX,
                ..Default::default()
            },
            shared: Arc::new(Shared::new(snapshot)),
        })
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<KeySnapshot> {
        self.shared.snapshot.load_full()
    }

    /// Get a decoding key by key ID.
    ///
    /// A fresh snapshot that has the key answers directly. A stale one that
    /// has it answers too when stale serving is allowed, and a single
    /// background refresh is started. Only a missing key makes the caller
    /// wait on the provider.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<DecodingKey, JwksCacheError> {
        let seen = self.shared.snapshot.load_full();
        if let Some(key) = seen.get(kid) {
            if seen.is_fresh(self.options.cache_ttl) {
                return Ok(key);
            }
            if self.can_serve_stale(&seen) {
                self.refresh_in_background();
                return Ok(key);
            }
        }

        let Some(fetcher) = &self.fetcher else {
            return seen.get(kid).ok_or_else(|| missing_key(kid));
        };

        self.refresh_for(fetcher, kid, &seen).await
    }

    fn can_serve_stale(&self, snapshot: &KeySnapshot) -> bool {
        self.options.allow_stale
            && snapshot
                .age()
                .is_some_and(|age| age < Duration::from_secs(MAX_STALE_CACHE_SECONDS))
    }

    /// Start a refresh unless one is running or the last fetch failed recently.
    fn refresh_in_background(&self) {
        let Some(fetcher) = self.fetcher.clone() else {
            return;
        };
        if self.shared.backing_off(self.options.min_refresh_interval) {
            return;
        }
        let Ok(guard) = Arc::clone(&self.shared.refresh_lock).try_lock_owned() else {
            return;
        };

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let _guard = guard;
            match shared.fetch_and_store(&fetcher).await {
                Ok(next) => info!("Refreshed stale JWKS ({} keys)", next.len()),
                Err(e) => warn!(error = %e, "JWKS refresh failed, serving stale keys"),
            }
        });
    }

    async fn refresh_for(
        &self,
        fetcher: &Fetcher,
        kid: Option<&str>,
        seen: &Arc<KeySnapshot>,
    ) -> Result<DecodingKey, JwksCacheError> {
        let _guard = self.shared.refresh_lock.lock().await;

        let current = self.shared.snapshot.load_full();
        let fresh = current.is_fresh(self.options.cache_ttl);

        // Another task refreshed while we waited.
        if !Arc::ptr_eq(&current, seen)
            && fresh
            && let Some(key) = current.get(kid)
        {
            return Ok(key);
        }

        // Fresh set that simply lacks this kid: don't hammer the provider.
        if fresh
            && current
                .age()
                .is_some_and(|age| age < self.options.min_refresh_interval)
        {
            debug!(kid = ?kid, "Key id not in recently fetched JWKS, skipping refresh");
            return Err(missing_key(kid));
        }

        if self.shared.backing_off(self.options.min_refresh_interval) {
            debug!(kid = ?kid, "Recent JWKS fetch failed, not retrying yet");
            return self.stale_or(
                &current,
                kid,
                JwksCacheError::FetchError("provider failed recently, retry backed off".into()),
            );
        }

        match self.shared.fetch_and_store(fetcher).await {
            Ok(next) => {
                info!("Refreshed JWKS ({} keys)", next.len());
                next.get(kid).ok_or_else(|| missing_key(kid))
            }
            Err(e) => self.stale_or(&current, kid, e),
        }
    }

    fn stale_or(
        &self,
        snapshot: &KeySnapshot,
        kid: Option<&str>,
        err: JwksCacheError,
    ) -> Result<DecodingKey, JwksCacheError> {
        if self.can_serve_stale(snapshot)
            && let Some(key) = snapshot.get(kid)
        {
            warn!("JWKS fetch failed, using stale cache: {}", err);
            return Ok(key);
        }
        Err(err)
    }

    /// Fetch the key set now and swap it in. Returns the number of keys.
    pub async fn refresh(&self) -> Result<usize, JwksCacheError> {
        let Some(fetcher) = &self.fetcher else {
            return Ok(self.shared.snapshot.load().len());
        };

        let _guard = self.shared.refresh_lock.lock().await;
        let next = self.shared.fetch_and_store(fetcher).await?;
        Ok(next.len())
    }

    /// Refresh the key set every `every` in a background task, starting one
    /// period from now. `every` is raised to at least one second.
    ///
    /// Failures are logged and the previous snapshot stays in place.
    pub fn spawn_refresh_task(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let every = every.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.refresh().await {
                    warn!(error = %e, "Background JWKS refresh failed");
                }
            }
        })
    }
}

fn missing_key(kid: Option<&str>) -> JwksCacheError {
    match kid {
        Some(k) => JwksCacheError::KeyNotFound(k.to_string()),
        None => JwksCacheError::NoKeysAvailable,
    }
}

/// Convert a JWK to a jsonwebtoken DecodingKey.
fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, JwksCacheError> {
    let n = jwk
        .n
        .as_ref()
        .ok_or_else(|| JwksCacheError::ParseError("Missing 'n' in RSA key".to_string()))?;
    let e = jwk
        .e
        .as_ref()
        .ok_or_else(|| JwksCacheError::ParseError("Missing 'e' in RSA key".to_string()))?;

    DecodingKey::from_rsa_components(n, e)
        .map_err(|e| JwksCacheError::ParseError(format!("Invalid RSA components: {}", e)))
}

/// Errors that can occur when working with the JWKS cache.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JwksCacheError {
    /// Failed to fetch JWKS from endpoint.
    #[error("Failed to fetch JWKS: {0}")]
    FetchError(String),
    /// Failed to parse JWKS response.
    #[error("Failed to parse JWKS: {0}")]
    ParseError(String),
    /// No valid keys found in JWKS.
    #[error("No valid keys found in JWKS")]
    NoValidKeys,
    /// Key with specified kid not found.
    #[error("Key not found: {0}")]
    KeyNotFound(String),
    /// No keys available in cache.
    #[error("No keys available in cache")]
    NoKeysAvailable,
}

impl JwksCacheError {
    /// True when the provider could not be reached or returned garbage, as
    /// opposed to a token naming a key the provider does not have.
    pub fn is_provider_unavailable(&self) -> bool {
        matches!(
            self,
            Self::FetchError(_) | Self::ParseError(_) | Self::NoValidKeys
        )
    }
}
