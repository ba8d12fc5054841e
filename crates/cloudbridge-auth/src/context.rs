//! Tenant identity derived from a credential

use thiserror::Error;
use tracing::{debug, warn};

use crate::claims::TenantClaims;

/// Tenant used when a credential cannot be attributed to one
pub const DEFAULT_TENANT: &str = "default-tenant";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token carries no {0} claim")]
    MissingClaim(&'static str),
}

/// Capability to read identity out of a credential string
pub trait AuthContext: Send + Sync {
    fn tenant_id(&self, credential: &str) -> Result<String, AuthError>;

    fn subject(&self, credential: &str) -> Result<String, AuthError>;
}

/// Reads identity from JWT claims without checking the signature
#[derive(Debug, Clone, Default)]
pub struct JwtAuthContext;

impl JwtAuthContext {
    pub fn new() -> Self {
        Self
    }

    pub fn claims(&self, credential: &str) -> Result<TenantClaims, AuthError> {
        TenantClaims::parse_unverified(credential)
    }
}

impl AuthContext for JwtAuthContext {
    fn tenant_id(&self, credential: &str) -> Result<String, AuthError> {
        let claims = self.claims(credential)?;
        if claims.tenant_id.is_empty() {
            return Err(AuthError::MissingClaim("tenant_id"));
        }
        Ok(claims.tenant_id)
    }

    fn subject(&self, credential: &str) -> Result<String, AuthError> {
        let claims = self.claims(credential)?;
        if claims.sub.is_empty() {
            return Err(AuthError::MissingClaim("sub"));
        }
        Ok(claims.sub)
    }
}

/// Tenant for `credential`, or [`DEFAULT_TENANT`] if it cannot be derived
///
/// Bootstrap must not block on an unreadable credential; the relay rejects it
/// later if it is actually invalid.
pub fn resolve_tenant(ctx: &dyn AuthContext, credential: &str) -> String {
    match ctx.tenant_id(credential) {
        Ok(tenant) => {
            debug!(tenant_id = %tenant, "resolved tenant from credential");
            tenant
        }
        Err(e) => {
            warn!("Failed to extract tenant from credential, using {}: {}", DEFAULT_TENANT, e);
            DEFAULT_TENANT.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    struct FixedTenant(&'static str);

    impl AuthContext for FixedTenant {
        fn tenant_id(&self, _credential: &str) -> Result<String, AuthError> {
            Ok(self.0.to_string())
        }

        fn subject(&self, _credential: &str) -> Result<String, AuthError> {
            Err(AuthError::MissingClaim("sub"))
        }
    }

    #[test]
    fn test_jwt_context_reads_tenant_and_subject() {
        let token = TenantClaims::new("device-9", "tenant-a", Duration::hours(1))
            .encode(b"secret")
            .unwrap();
        let ctx = JwtAuthContext::new();

        assert_eq!(ctx.tenant_id(&token).unwrap(), "tenant-a");
        assert_eq!(ctx.subject(&token).unwrap(), "device-9");
    }

    #[test]
    fn test_missing_tenant_claim() {
        let token = TenantClaims::new("device-9", "", Duration::hours(1))
            .encode(b"secret")
            .unwrap();

        let err = JwtAuthContext::new().tenant_id(&token).unwrap_err();
        assert!(matches!(err, AuthError::MissingClaim("tenant_id")));
    }

    #[test]
    fn test_resolve_tenant_degrades_to_default() {
        let ctx = JwtAuthContext::new();
        assert_eq!(resolve_tenant(&ctx, "not-a-jwt"), DEFAULT_TENANT);
        assert_eq!(resolve_tenant(&ctx, ""), DEFAULT_TENANT);
    }

    #[test]
    fn test_resolve_tenant_uses_context() {
        assert_eq!(resolve_tenant(&FixedTenant("acme"), "anything"), "acme");
    }
}
