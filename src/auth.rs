//! Session tokens for agent authentication.
//!
//! Tokens are HS256 JWTs signed with the configured secret, valid for
//! 30 days, issued by this service. Verification never propagates an
//! error into the registry: any failure yields `None`.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const TOKEN_ISSUER: &str = "cli-auth-backend";
pub const TOKEN_VALIDITY_DAYS: i64 = 30;

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub email: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

impl SessionClaims {
    pub fn new(user_id: String, email: String, device_id: String) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            email,
            device_id,
            iat: now.timestamp(),
            exp: (now + Duration::days(TOKEN_VALIDITY_DAYS)).timestamp(),
            iss: TOKEN_ISSUER.to_string(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Signs and verifies session tokens with a shared HMAC secret.
pub struct TokenSigner {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenSigner {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_issuer(&[TOKEN_ISSUER]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, jsonwebtoken::errors::Error> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
    }

    /// Verifies a token, returning `None` on altered payload, invalid
    /// signature, wrong issuer, or expiry.
    pub fn verify(&self, token: &str) -> Option<SessionClaims> {
        let data = decode::<SessionClaims>(token, &self.decoding_key, &self.validation).ok()?;
        if data.claims.is_expired() {
            return None;
        }
        Some(data.claims)
    }
}
