use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::error::AppError;

use super::Claims;

/// Validates handshake tokens against the configured shared secret.
pub struct JwtValidator {
    key: DecodingKey,
    checks: Validation,
}

impl JwtValidator {
    /// Returns `None` when no secret is configured; the service then
    /// accepts anonymous connections only.
    pub fn from_config(config: &JwtConfig) -> Option<Self> {
        let secret = config.secret.as_ref()?;

        let mut checks = Validation::default();
        if let Some(ref issuer) = config.issuer {
            checks.set_issuer(&[issuer]);
        }
        if let Some(ref audience) = config.audience {
            checks.set_audience(&[audience]);
        }

        Some(Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            checks,
        })
    }

    /// Decode and verify a token, including signature and expiry.
    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        decode::<Claims>(token, &self.key, &self.checks)
            .map(|data| data.claims)
            .map_err(|e| AppError::Auth(format!("Invalid token: {e}")))
    }
}
