//! JWT claims carried by CloudBridge credentials

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::context::AuthError;

/// Claims of a tenant-scoped credential
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TenantClaims {
    /// Subject (user or device ID)
    pub sub: String,
    /// Tenant the credential belongs to
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_name: Option<String>,
    #[serde(rename = "organization_id", skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issued at (timestamp)
    pub iat: i64,
    pub iss: String,
    pub aud: String,
}

impl TenantClaims {
    pub fn new(subject: impl Into<String>, tenant_id: impl Into<String>, validity: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: subject.into(),
            tenant_id: tenant_id.into(),
            iat: now.timestamp(),
            exp: (now + validity).timestamp(),
            ..Default::default()
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.iss = issuer.into();
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.aud = audience.into();
        self
    }

    pub fn with_tenant_name(mut self, name: impl Into<String>) -> Self {
        self.tenant_name = Some(name.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    /// Read claims without verifying the signature
    ///
    /// This is for routing decisions only (which tenant, which subject), never
    /// for access control.
    pub fn parse_unverified(token: &str) -> Result<Self, AuthError> {
        validate_basic_format(token)?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation.required_spec_claims.clear();

        let data = decode::<TenantClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map_err(|e| AuthError::MalformedToken(e.to_string()))?;
        Ok(data.claims)
    }

    /// Sign claims with an HMAC-SHA256 secret
    pub fn encode(&self, secret: &[u8]) -> Result<String, AuthError> {
        encode(
            &Header::new(Algorithm::HS256),
            self,
            &EncodingKey::from_secret(secret),
        )
        .map_err(|e| AuthError::MalformedToken(e.to_string()))
    }
}

/// Check that a token has three base64url segments, without decoding claims
pub fn validate_basic_format(token: &str) -> Result<(), AuthError> {
    if token.is_empty() {
        return Err(AuthError::MissingCredential);
    }

    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::MalformedToken(format!(
            "expected 3 parts separated by dots, got {}",
            parts.len()
        )));
    }

    for (i, part) in parts.iter().enumerate() {
        URL_SAFE_NO_PAD.decode(part).map_err(|e| {
            AuthError::MalformedToken(format!("invalid base64 encoding in part {}: {}", i + 1, e))
        })?;
    }

    Ok(())
}
