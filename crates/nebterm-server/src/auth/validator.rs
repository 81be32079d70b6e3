//! Credential validator seam.
//!
//! Login, refresh and second-factor flows live in another service; this
//! server only checks the access token presented on connect.

use nebterm_core::{verify_token, TermError, TermResult};
use tracing::debug;

/// Who a credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

/// Outcome of checking a credential.
#[derive(Debug, Clone)]
pub struct Validation {
    pub identity: Identity,
    /// `false` while a second factor is still pending.
    pub verified: bool,
}

/// Turns a presented token into an identity.
pub trait CredentialValidator: Send + Sync {
    fn validate(&self, token: &str) -> TermResult<Validation>;
}

/// Validates HMAC-SHA256 access tokens signed with a shared secret.
pub struct TokenValidator {
    secret: Vec<u8>,
}

impl TokenValidator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl CredentialValidator for TokenValidator {
    fn validate(&self, token: &str) -> TermResult<Validation> {
        let claims = verify_token(&self.secret, token)?;
        Ok(Validation {
            identity: Identity {
                user_id: claims.user_id,
                username: claims.username,
            },
            verified: !claims.partial,
        })
    }
}

/// Accept only a present, valid, fully verified credential.
pub fn authenticate(
    validator: &dyn CredentialValidator,
    token: Option<&str>,
) -> TermResult<Identity> {
    let token = match token {
        Some(t) if !t.is_empty() => t,
        _ => return Err(TermError::Unauthorized("token required".into())),
    };

    let validation = validator.validate(token).map_err(|e| {
        debug!(error = %e, "credential rejected");
        TermError::Unauthorized("invalid token".into())
    })?;

    if !validation.verified {
        debug!(user_id = %validation.identity.user_id, "partial credential rejected");
        return Err(TermError::Unauthorized("invalid token".into()));
    }

    Ok(validation.identity)
}
