//! Upgrade-request checks for the terminal endpoint.
//!
//! Runs before the WebSocket upgrade completes:
//! 1. Path must be [`TERMINAL_PATH`], else 404
//! 2. `token` query parameter must be a valid, fully verified credential, else 401
//! 3. The session key is derived from the token's user id and `instanceId`
//!
//! The session itself is not touched here; a rejected request never spawns
//! a shell.

use crate::auth::{authenticate, CredentialValidator, Identity};
use crate::bridge::OpenMode;
use nebterm_core::SessionKey;
use tracing::debug;

/// The single route served.
pub const TERMINAL_PATH: &str = "/ws/terminal";

/// An accepted upgrade request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub identity: Identity,
    pub key: SessionKey,
    pub mode: OpenMode,
}

/// Why an upgrade request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    NotFound,
    Unauthorized,
}

impl Rejection {
    pub fn body(&self) -> &'static str {
        match self {
            Rejection::NotFound => "not found",
            Rejection::Unauthorized => "unauthorized",
        }
    }
}

/// Query parameters understood by the terminal endpoint.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub token: Option<String>,
    pub instance_id: Option<String>,
    pub fresh: bool,
}

impl ConnectParams {
    /// Parse a raw (still percent-encoded) query string. Unknown parameters
    /// are ignored; the last occurrence of a repeated one wins.
    pub fn parse(query: Option<&str>) -> Self {
        let mut params = ConnectParams::default();
        let Some(query) = query else {
            return params;
        };
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match name.as_ref() {
                "token" => params.token = Some(value.into_owned()),
                "instanceId" => params.instance_id = Some(value.into_owned()),
                "fresh" => params.fresh = matches!(value.as_ref(), "1" | "true"),
                _ => {}
            }
        }
        params
    }
}

/// Decide whether to upgrade a request for `path` with `query`.
pub fn check_request(
    path: &str,
    query: Option<&str>,
    validator: &dyn CredentialValidator,
) -> Result<ConnectRequest, Rejection> {
    if path != TERMINAL_PATH {
        debug!(path, "unknown path");
        return Err(Rejection::NotFound);
    }

    let params = ConnectParams::parse(query);
    let identity = authenticate(validator, params.token.as_deref()).map_err(|e| {
        debug!(error = %e, "upgrade refused");
        Rejection::Unauthorized
    })?;

    let key = SessionKey::for_instance(&identity.user_id, params.instance_id.as_deref());
    let mode = if params.fresh {
        OpenMode::Fresh
    } else {
        OpenMode::Resume
    };

    Ok(ConnectRequest {
        identity,
        key,
        mode,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenValidator;
    use nebterm_core::{create_token, generate_secret};

    fn setup() -> (TokenValidator, Vec<u8>) {
        let secret = generate_secret();
        (TokenValidator::new(secret.clone()), secret)
    }

    #[test]
    fn parses_params() {
        let params = ConnectParams::parse(Some("token=abc.def&instanceId=tab%202&fresh=1&x=y"));
        assert_eq!(params.token.as_deref(), Some("abc.def"));
        assert_eq!(params.instance_id.as_deref(), Some("tab 2"));
        assert!(params.fresh);

        assert_eq!(ConnectParams::parse(None), ConnectParams::default());
        assert!(!ConnectParams::parse(Some("fresh=0")).fresh);
    }

    #[test]
    fn accepts_valid_token() {
        let (validator, secret) = setup();
        let token = create_token(&secret, "u1", "alice", false, 60).unwrap();
        let query = format!("token={token}&instanceId=tab2");

        let req = check_request(TERMINAL_PATH, Some(&query), &validator).unwrap();
        assert_eq!(req.identity.user_id, "u1");
        assert_eq!(req.key.as_str(), "term:u1:tab2");
        assert_eq!(req.mode, OpenMode::Resume);
    }

    #[test]
    fn missing_instance_uses_default() {
        let (validator, secret) = setup();
        let token = create_token(&secret, "u1", "alice", false, 60).unwrap();
        let query = format!("token={token}&instanceId=");

        let req = check_request(TERMINAL_PATH, Some(&query), &validator).unwrap();
        assert_eq!(req.key.as_str(), "term:u1:default");
    }

    #[test]
    fn fresh_flag_selects_fresh_mode() {
        let (validator, secret) = setup();
        let token = create_token(&secret, "u1", "alice", false, 60).unwrap();
        let query = format!("token={token}&fresh=true");

        let req = check_request(TERMINAL_PATH, Some(&query), &validator).unwrap();
        assert_eq!(req.mode, OpenMode::Fresh);
    }

    #[test]
    fn rejects_unknown_path() {
        let (validator, secret) = setup();
        let token = create_token(&secret, "u1", "alice", false, 60).unwrap();
        let query = format!("token={token}");
        assert_eq!(
            check_request("/ws/other", Some(&query), &validator).unwrap_err(),
            Rejection::NotFound
        );
    }

    #[test]
    fn rejects_bad_credentials() {
        let (validator, secret) = setup();
        assert_eq!(
            check_request(TERMINAL_PATH, None, &validator).unwrap_err(),
            Rejection::Unauthorized
        );
        assert_eq!(
            check_request(TERMINAL_PATH, Some("token=garbage"), &validator).unwrap_err(),
            Rejection::Unauthorized
        );

        let partial = create_token(&secret, "u1", "alice", true, 60).unwrap();
        let query = format!("token={partial}");
        assert_eq!(
            check_request(TERMINAL_PATH, Some(&query), &validator).unwrap_err(),
            Rejection::Unauthorized
        );
    }
}
