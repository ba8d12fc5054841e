//! Credential inspection for the peer session layer
//!
//! The client only needs to know which tenant a credential belongs to. It does
//! not verify signatures: the transport authenticates against the relay, and
//! this crate merely reads the claims.

pub mod claims;
pub mod context;

pub use claims::{validate_basic_format, TenantClaims};
pub use context::{resolve_tenant, AuthContext, AuthError, JwtAuthContext, DEFAULT_TENANT};
