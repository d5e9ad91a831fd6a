//! Tenant API key authentication
//!
//! Tenants authenticate with a bearer API key. Keys are stored as
//! HMAC-SHA256 digests, never in the clear; the extractor hashes the
//! presented key and resolves it to an organization in one indexed lookup.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

type HmacSha256 = Hmac<Sha256>;

const API_KEY_PREFIX: &str = "cc_live_";

/// Hashes and mints tenant API keys.
#[derive(Clone)]
pub struct ApiKeyManager {
    hmac_secret: String,
}

impl ApiKeyManager {
    pub fn new(hmac_secret: &str) -> Self {
        Self {
            hmac_secret: hmac_secret.to_string(),
        }
    }

    /// Deterministic digest of a presented key, hex-encoded.
    pub fn hash_key(&self, key: &str) -> String {
        let mut mac = match HmacSha256::new_from_slice(self.hmac_secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => {
                // HMAC accepts any key length; this arm is unreachable but
                // must not panic in an auth path
                return String::new();
            }
        };
        mac.update(key.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Mint a new API key. The caller stores only the digest.
    pub fn generate_key(&self) -> (String, String) {
        let mut bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut bytes);
        let key = format!("{}{}", API_KEY_PREFIX, hex::encode(bytes));
        let digest = self.hash_key(&key);
        (key, digest)
    }
}

/// An authenticated tenant, resolved from the Authorization header.
#[derive(Debug, Clone)]
pub struct AuthedTenant {
    pub org_id: Uuid,
}

impl FromRequestParts<AppState> for AuthedTenant {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;

        let key = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?;
        if !key.starts_with(API_KEY_PREFIX) {
            return Err(ApiError::Unauthorized);
        }

        let digest = state.api_keys.hash_key(key);
        let org: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM organizations WHERE api_key_hash = $1")
                .bind(&digest)
                .fetch_optional(&state.pool)
                .await
                .map_err(|e| ApiError::Internal(e.to_string()))?;

        match org {
            Some((org_id,)) => Ok(AuthedTenant { org_id }),
            None => Err(ApiError::Unauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_and_key_dependent() {
        let manager = ApiKeyManager::new("test-secret");
        let a = manager.hash_key("cc_live_abc");
        let b = manager.hash_key("cc_live_abc");
        let c = manager.hash_key("cc_live_abd");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn different_secrets_produce_different_digests() {
        let a = ApiKeyManager::new("secret-a").hash_key("cc_live_abc");
        let b = ApiKeyManager::new("secret-b").hash_key("cc_live_abc");
        assert_ne!(a, b);
    }

    #[test]
    fn generated_keys_carry_the_prefix_and_verify() {
        let manager = ApiKeyManager::new("test-secret");
        let (key, digest) = manager.generate_key();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(manager.hash_key(&key), digest);
    }
}
