//! Credential validation: bearer JWTs and API keys.
//!
//! Bearer tokens are HS256 JWTs verified against the configured secret,
//! issuer, and audience, with a `jti` revocation set. API keys use the
//! `prefix_env_hex64` shape (e.g. `a2a_live_<64 hex>`); only their SHA-256
//! hash is stored, and hash comparison is constant-time.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::constant_time_eq;

/// An authenticated identity and its capability set.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub user_id: String,
    pub permissions: Vec<String>,
    /// `jti` for bearer tokens, key id for API keys.
    pub token_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Why a credential was rejected. The RPC layer collapses all of these to
/// `UNAUTHORIZED` so callers cannot probe which rule fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("credential expired")]
    Expired,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("credential revoked")]
    Revoked,
    #[error("malformed credential")]
    Malformed,
    #[error("credential not found")]
    NotFound,
    #[error("authentication method disabled")]
    DisabledMethod,
}

/// JWT claims we verify. `permissions` defaults to empty.
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default)]
    jti: Option<String>,
    #[serde(default)]
    permissions: Vec<String>,
}

/// A provisioned API key. The presented key never touches storage — only
/// its SHA-256 hash.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub key_hash: String,
    pub user_id: String,
    pub permissions: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct TokenValidator {
    decoding_key: Option<DecodingKey>,
    validation: Validation,
    revoked: RwLock<HashSet<String>>,
    /// SHA-256 hex of the full presented key → record.
    api_keys: RwLock<HashMap<String, ApiKeyRecord>>,
}

impl TokenValidator {
    /// Build a validator. An empty `jwt_secret` disables the bearer method
    /// (API keys keep working).
    pub fn new(jwt_secret: &str, issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.validate_exp = true;

        let decoding_key = if jwt_secret.is_empty() {
            None
        } else {
            Some(DecodingKey::from_secret(jwt_secret.as_bytes()))
        };

        Self {
            decoding_key,
            validation,
            revoked: RwLock::new(HashSet::new()),
            api_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Validate either credential kind, dispatching on shape.
    pub fn validate(&self, credential: &str) -> Result<Principal, AuthFailure> {
        if credential.is_empty() {
            return Err(AuthFailure::Malformed);
        }
        if looks_like_api_key(credential) {
            self.validate_api_key(credential)
        } else {
            self.validate_bearer(credential)
        }
    }

    /// Verify a bearer JWT: signature, issuer, audience, expiry, revocation.
    pub fn validate_bearer(&self, token: &str) -> Result<Principal, AuthFailure> {
        let key = self
            .decoding_key
            .as_ref()
            .ok_or(AuthFailure::DisabledMethod)?;

        let data = decode::<Claims>(token, key, &self.validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind::*;
            match e.kind() {
                ExpiredSignature => AuthFailure::Expired,
                InvalidSignature | InvalidIssuer | InvalidAudience | ImmatureSignature => {
                    AuthFailure::InvalidSignature
                }
                _ => AuthFailure::Malformed,
            }
        })?;

        if let Some(jti) = &data.claims.jti {
            if self.revoked.read().expect("revocation lock").contains(jti) {
                return Err(AuthFailure::Revoked);
            }
        }

        let expires_at = Utc
            .timestamp_opt(data.claims.exp, 0)
            .single()
            .ok_or(AuthFailure::Malformed)?;

        Ok(Principal {
            user_id: data.claims.sub,
            permissions: data.claims.permissions,
            token_id: data.claims.jti,
            expires_at: Some(expires_at),
        })
    }

    /// Verify an API key: shape, hashed lookup, expiry.
    pub fn validate_api_key(&self, key: &str) -> Result<Principal, AuthFailure> {
        if !looks_like_api_key(key) {
            return Err(AuthFailure::Malformed);
        }
        let presented_hash = hash_key(key);
        let keys = self.api_keys.read().expect("api key lock");
        let record = keys.get(&presented_hash).ok_or(AuthFailure::NotFound)?;

        // The map lookup already matched the hash; compare again without
        // short-circuiting so every path through here costs the same.
        if !constant_time_eq(&presented_hash, &record.key_hash) {
            return Err(AuthFailure::NotFound);
        }
        if let Some(expires_at) = record.expires_at {
            if Utc::now() >= expires_at {
                return Err(AuthFailure::Expired);
            }
        }

        Ok(Principal {
            user_id: record.user_id.clone(),
            permissions: record.permissions.clone(),
            token_id: Some(presented_hash[..16].to_string()),
            expires_at: record.expires_at,
        })
    }

    /// Provision an API key from its plaintext. Returns the stored hash.
    pub fn register_api_key(
        &self,
        key: &str,
        user_id: &str,
        permissions: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> String {
        let key_hash = hash_key(key);
        self.api_keys.write().expect("api key lock").insert(
            key_hash.clone(),
            ApiKeyRecord {
                key_hash: key_hash.clone(),
                user_id: user_id.to_string(),
                permissions,
                expires_at,
            },
        );
        key_hash
    }

    /// Add a bearer `jti` to the revocation set.
    pub fn revoke(&self, token_id: &str) {
        self.revoked
            .write()
            .expect("revocation lock")
            .insert(token_id.to_string());
    }
}

/// `prefix_env_hex64` — three `_`-separated fields, the last 64 hex chars.
/// JWTs always contain dots, so anything with one takes the bearer path.
fn looks_like_api_key(credential: &str) -> bool {
    if credential.contains('.') {
        return false;
    }
    let mut parts = credential.rsplitn(2, '_');
    let Some(tail) = parts.next() else {
        return false;
    };
    let Some(head) = parts.next() else {
        return false;
    };
    head.contains('_')
        && !head.starts_with('_')
        && tail.len() == 64
        && tail.chars().all(|c| c.is_ascii_hexdigit())
}

fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";
    const ISSUER: &str = "a2a";
    const AUDIENCE: &str = "a2a-clients";

    fn validator() -> TokenValidator {
        TokenValidator::new(SECRET, ISSUER, AUDIENCE)
    }

    fn mint_jwt(secret: &str, exp_offset_secs: i64, jti: Option<&str>) -> String {
        let claims = json!({
            "sub": "user-1",
            "iss": ISSUER,
            "aud": AUDIENCE,
            "exp": Utc::now().timestamp() + exp_offset_secs,
            "jti": jti,
            "permissions": ["tasks:write"],
        });
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn sample_key() -> String {
        format!("a2a_live_{}", "ab".repeat(32))
    }

    #[test]
    fn valid_jwt_yields_principal() {
        let v = validator();
        let token = mint_jwt(SECRET, 300, Some("jti-1"));
        let p = v.validate(&token).unwrap();
        assert_eq!(p.user_id, "user-1");
        assert_eq!(p.permissions, vec!["tasks:write"]);
        assert_eq!(p.token_id.as_deref(), Some("jti-1"));
    }

    #[test]
    fn expired_jwt_rejected() {
        let v = validator();
        let token = mint_jwt(SECRET, -300, None);
        assert_eq!(v.validate(&token), Err(AuthFailure::Expired));
    }

    #[test]
    fn wrong_secret_rejected() {
        let v = validator();
        let token = mint_jwt("other-secret", 300, None);
        assert_eq!(v.validate(&token), Err(AuthFailure::InvalidSignature));
    }

    #[test]
    fn wrong_issuer_rejected() {
        let v = validator();
        let claims = json!({
            "sub": "user-1",
            "iss": "evil",
            "aud": AUDIENCE,
            "exp": Utc::now().timestamp() + 300,
        });
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert_eq!(v.validate(&token), Err(AuthFailure::InvalidSignature));
    }

    #[test]
    fn revoked_jti_rejected() {
        let v = validator();
        let token = mint_jwt(SECRET, 300, Some("jti-gone"));
        v.revoke("jti-gone");
        assert_eq!(v.validate(&token), Err(AuthFailure::Revoked));
    }

    #[test]
    fn garbage_is_malformed() {
        let v = validator();
        assert_eq!(v.validate("not-a-token"), Err(AuthFailure::Malformed));
        assert_eq!(v.validate(""), Err(AuthFailure::Malformed));
    }

    #[test]
    fn bearer_disabled_without_secret() {
        let v = TokenValidator::new("", ISSUER, AUDIENCE);
        let token = mint_jwt(SECRET, 300, None);
        assert_eq!(v.validate(&token), Err(AuthFailure::DisabledMethod));
    }

    #[test]
    fn api_key_roundtrip() {
        let v = validator();
        let key = sample_key();
        v.register_api_key(&key, "svc-1", vec!["tasks:read".into()], None);
        let p = v.validate(&key).unwrap();
        assert_eq!(p.user_id, "svc-1");
        assert_eq!(p.permissions, vec!["tasks:read"]);
    }

    #[test]
    fn unknown_api_key_not_found() {
        let v = validator();
        assert_eq!(v.validate(&sample_key()), Err(AuthFailure::NotFound));
    }

    #[test]
    fn expired_api_key_rejected() {
        let v = validator();
        let key = sample_key();
        let past = Utc::now() - chrono::Duration::hours(1);
        v.register_api_key(&key, "svc-1", vec![], Some(past));
        assert_eq!(v.validate(&key), Err(AuthFailure::Expired));
    }

    #[test]
    fn api_key_shape_detection() {
        assert!(looks_like_api_key(&sample_key()));
        assert!(!looks_like_api_key("a2a_live_short"));
        assert!(!looks_like_api_key(&format!("nounderscore{}", "ab".repeat(32))));
        assert!(!looks_like_api_key(&format!("a2a_live_{}", "zz".repeat(32))));
    }
}
