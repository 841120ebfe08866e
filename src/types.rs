//! NewType wrappers for strong typing throughout the gateway.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a tenant ID where a principal ID is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Stable caller identifier issued by the identity provider (the `sub` claim).
    PrincipalId
);

newtype_string!(
    /// Organization (directory) identifier the caller belongs to (the `tid` claim).
    TenantId
);

newtype_string!(
    /// Client application the token was issued to (`appid` or `azp`).
    AppId
);

/// A bearer token taken verbatim from the `Authorization` header.
///
/// Has no `Display`, and `Debug` prints only the fingerprint. Log
/// [`RawCredential::fingerprint`] for correlation.
#[derive(Clone, PartialEq, Eq)]
pub struct RawCredential(String);

impl RawCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex characters of the SHA-256 of the token.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};

        let digest = Sha256::digest(self.0.as_bytes());
        let hex = format!("{:x}", digest);
        hex[..12].to_string()
    }
}

impl fmt::Debug for RawCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawCredential({})", self.fingerprint())
    }
}
