//! HMAC-signed access tokens.
//!
//! Compact `header.claims.signature` form (base64url, no padding), compatible
//! with HMAC-signed JWTs issued by the login service. Tokens are issued as
//! HS256; verification accepts HS256, HS384 and HS512. A
//! token whose `partial` claim is set was issued before the second factor was
//! verified; it decodes fine here and the caller decides whether to accept it.

use crate::error::{TermError, TermResult};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::hmac;
use serde::{Deserialize, Serialize};

const HEADER_JSON: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Deserialize)]
struct Header {
    alg: String,
}

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    /// Second factor still pending.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
    /// Issued-at, seconds since the Unix epoch.
    pub iat: u64,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
}

/// Create a token for `user_id` valid for `ttl_secs` seconds.
pub fn create_token(
    secret: &[u8],
    user_id: &str,
    username: &str,
    partial: bool,
    ttl_secs: u64,
) -> TermResult<String> {
    let now = now_secs()?;
    sign_claims(
        secret,
        &Claims {
            user_id: user_id.to_string(),
            username: username.to_string(),
            partial,
            iat: now,
            exp: now + ttl_secs,
        },
    )
}

/// Sign an arbitrary claim set.
pub fn sign_claims(secret: &[u8], claims: &Claims) -> TermResult<String> {
    let header = URL_SAFE_NO_PAD.encode(HEADER_JSON);
    let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
    let signing_input = format!("{header}.{body}");

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let tag = hmac::sign(&key, signing_input.as_bytes());

    Ok(format!(
        "{signing_input}.{}",
        URL_SAFE_NO_PAD.encode(tag.as_ref())
    ))
}

/// Verify signature and expiry, returning the claims.
pub fn verify_token(secret: &[u8], token: &str) -> TermResult<Claims> {
    let mut parts = token.split('.');
    let (header_part, body_part, signature_part) =
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(b), Some(s), None) => (h, b, s),
            _ => return Err(TermError::Token("malformed token".into())),
        };

    let header: Header = serde_json::from_slice(&decode_part(header_part)?)
        .map_err(|e| TermError::Token(format!("bad header: {e}")))?;
    let algorithm = hmac_algorithm(&header.alg)?;

    let signature = decode_part(signature_part)?;
    let key = hmac::Key::new(algorithm, secret);
    let signing_input = format!("{header_part}.{body_part}");
    hmac::verify(&key, signing_input.as_bytes(), &signature)
        .map_err(|_| TermError::Token("invalid token signature".into()))?;

    let claims: Claims = serde_json::from_slice(&decode_part(body_part)?)
        .map_err(|e| TermError::Token(format!("bad claims: {e}")))?;

    if now_secs()? >= claims.exp {
        return Err(TermError::Token("token expired".into()));
    }

    Ok(claims)
}

/// Generate a random signing secret (32 bytes).
pub fn generate_secret() -> Vec<u8> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut secret = vec![0u8; 32];
    rng.fill(&mut secret).expect("RNG failure");
    secret
}

/// HMAC algorithm for a JWT `alg` value. Anything outside the HS family is
/// refused, `none` included.
fn hmac_algorithm(alg: &str) -> TermResult<hmac::Algorithm> {
    match alg {
        "HS256" => Ok(hmac::HMAC_SHA256),
        "HS384" => Ok(hmac::HMAC_SHA384),
        "HS512" => Ok(hmac::HMAC_SHA512),
        other => Err(TermError::Token(format!("unexpected signing method: {other}"))),
    }
}

fn decode_part(part: &str) -> TermResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| TermError::Token(format!("bad encoding: {e}")))
}

fn now_secs() -> TermResult<u64> {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| TermError::Other(format!("system clock before epoch: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_verify() {
        let secret = generate_secret();
        let token = create_token(&secret, "u1", "alice", false, 3600).unwrap();
        let claims = verify_token(&secret, &token).unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.username, "alice");
        assert!(!claims.partial);
    }

    #[test]
    fn partial_flag_survives() {
        let secret = generate_secret();
        let token = create_token(&secret, "u1", "alice", true, 3600).unwrap();
        assert!(verify_token(&secret, &token).unwrap().partial);
    }

    #[test]
    fn wrong_secret() {
        let token = create_token(&generate_secret(), "u1", "alice", false, 3600).unwrap();
        assert!(verify_token(&generate_secret(), &token).is_err());
    }

    #[test]
    fn tampered_claims() {
        let secret = generate_secret();
        let token = create_token(&secret, "u1", "alice", false, 3600).unwrap();
        let forged_body = URL_SAFE_NO_PAD.encode(
            r#"{"user_id":"admin","username":"alice","iat":0,"exp":99999999999}"#,
        );
        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], forged_body, parts[2]);
        assert!(verify_token(&secret, &forged).is_err());
    }

    #[test]
    fn expired_token() {
        let secret = generate_secret();
        let token = sign_claims(
            &secret,
            &Claims {
                user_id: "u1".into(),
                username: "alice".into(),
                partial: false,
                iat: 1,
                exp: 2,
            },
        )
        .unwrap();
        match verify_token(&secret, &token) {
            Err(TermError::Token(msg)) => assert_eq!(msg, "token expired"),
            other => panic!("expected expiry error, got {other:?}"),
        }
    }

    /// Sign `claims` under an arbitrary header, as another issuer would.
    fn sign_with(secret: &[u8], alg: hmac::Algorithm, header: &str, claims: &Claims) -> String {
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap())
        );
        let tag = hmac::sign(&hmac::Key::new(alg, secret), signing_input.as_bytes());
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(tag.as_ref()))
    }

    fn live_claims() -> Claims {
        let now = now_secs().unwrap();
        Claims {
            user_id: "u1".into(),
            username: "alice".into(),
            partial: false,
            iat: now,
            exp: now + 3600,
        }
    }

    #[test]
    fn accepts_hs384_and_hs512() {
        let secret = generate_secret();
        let claims = live_claims();
        for (alg, name) in [(hmac::HMAC_SHA384, "HS384"), (hmac::HMAC_SHA512, "HS512")] {
            let header = format!(r#"{{"alg":"{name}","typ":"JWT"}}"#);
            let token = sign_with(&secret, alg, &header, &claims);
            assert_eq!(verify_token(&secret, &token).unwrap(), claims, "{name}");
        }
    }

    #[test]
    fn header_must_match_signature_algorithm() {
        let secret = generate_secret();
        let token = sign_with(
            &secret,
            hmac::HMAC_SHA256,
            r#"{"alg":"HS512","typ":"JWT"}"#,
            &live_claims(),
        );
        assert!(verify_token(&secret, &token).is_err());
    }

    #[test]
    fn rejects_non_hmac_methods() {
        let secret = generate_secret();
        for header in [r#"{"alg":"none"}"#, r#"{"alg":"RS256","typ":"JWT"}"#] {
            let token = sign_with(&secret, hmac::HMAC_SHA256, header, &live_claims());
            match verify_token(&secret, &token) {
                Err(TermError::Token(msg)) => assert!(msg.starts_with("unexpected signing method")),
                other => panic!("expected signing method error, got {other:?}"),
            }
        }
    }

    #[test]
    fn malformed() {
        let secret = generate_secret();
        assert!(verify_token(&secret, "").is_err());
        assert!(verify_token(&secret, "a.b").is_err());
        assert!(verify_token(&secret, "a.b.c.d").is_err());
        assert!(verify_token(&secret, "!!.??.**").is_err());
    }
}
