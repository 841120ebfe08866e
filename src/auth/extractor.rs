//! Bearer credential extraction from HTTP request headers.

use http::HeaderMap;
use http::header::AUTHORIZATION;

use crate::types::RawCredential;

/// Pull a bearer token out of the `Authorization` header.
///
/// The scheme keyword is matched case-insensitively. A missing header, a
/// different scheme, a non-ASCII header value or an empty token all yield
/// `None`; this never fails.
pub fn bearer_credential(headers: &HeaderMap) -> Option<RawCredential> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let token = token.trim();
    if token.is_empty() || token.contains(' ') {
        return None;
    }

    Some(RawCredential::new(token))
}
