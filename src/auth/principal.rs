//! The authenticated caller for the duration of one request.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::auth::validator::{AuthFailure, ClaimSet};
use crate::error::ApiError;
use crate::types::{AppId, PrincipalId, TenantId};

/// How a principal came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalSource {
    /// Resolved from a validated bearer token.
    Token,
    /// The synthetic development identity.
    DebugFallback,
}

/// Resolved identity of the caller.
///
/// Built once per request from validated claims and never mutated after it
/// is handed to route handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    id: PrincipalId,
    name: Option<String>,
    email: Option<String>,
    roles: BTreeSet<String>,
    groups: BTreeSet<String>,
    tenant_id: Option<TenantId>,
    app_id: Option<AppId>,
    source: PrincipalSource,
}

impl Principal {
    /// A token-sourced principal with only an id.
    pub fn new(id: impl Into<PrincipalId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            email: None,
            roles: BTreeSet::new(),
            groups: BTreeSet::new(),
            tenant_id: None,
            app_id: None,
            source: PrincipalSource::Token,
        }
    }

    /// Map validated claims onto a principal.
    ///
    /// Only `sub` is required; every other attribute is optional and
    /// defaults to absent or empty.
    pub fn from_claims(claims: &ClaimSet) -> Result<Self, AuthFailure> {
        let id = claims
            .str("sub")
            .ok_or_else(|| AuthFailure::Malformed("missing subject".to_string()))?;

        let email = claims
            .str("email")
            .or_else(|| claims.str("preferred_username"))
            .or_else(|| claims.str("upn"))
            .map(str::to_string);

        Ok(Self {
            id: PrincipalId::new(id),
            name: claims.str("name").map(str::to_string),
            email,
            roles: claims.strings("roles"),
            groups: claims.strings("groups"),
            tenant_id: claims.str("tid").map(TenantId::new),
            app_id: claims
                .str("appid")
                .or_else(|| claims.str("azp"))
                .map(AppId::new),
            source: PrincipalSource::Token,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub(crate) fn with_source(mut self, source: PrincipalSource) -> Self {
        self.source = source;
        self
    }

    pub fn id(&self) -> &PrincipalId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    pub fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn app_id(&self) -> Option<&AppId> {
        self.app_id.as_ref()
    }

    pub fn source(&self) -> PrincipalSource {
        self.source
    }

    /// True for the synthetic development identity.
    pub fn is_debug_fallback(&self) -> bool {
        self.source == PrincipalSource::DebugFallback
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Fail with `Forbidden` unless the principal holds `role`.
    pub fn require_role(&self, role: &str) -> Result<(), ApiError> {
        if self.has_role(role) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("role `{}` required", role)))
        }
    }

    /// Get a display-friendly name for this principal.
    pub fn display(&self) -> String {
        if let Some(name) = &self.name {
            name.clone()
        } else if let Some(email) = &self.email {
            email.clone()
        } else {
            self.id.to_string()
        }
    }
}
