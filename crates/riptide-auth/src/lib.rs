//! Broker token issuance: short-lived HS256 bearer tokens asserting a user
//! identity so the broker accepts the client's subscriptions. The signing
//! key is shared with the broker and held only here.

use chrono::{Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use riptide_protocol::{EngineError, EngineResult, UserId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issues and verifies broker subscription tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    lifetime: Duration,
}

impl TokenIssuer {
    /// Default token lifetime: 24 hours.
    pub fn new(secret: &[u8]) -> Self {
        Self::with_lifetime(secret, Duration::hours(24))
    }

    pub fn with_lifetime(secret: &[u8], lifetime: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            lifetime,
        }
    }

    pub fn issue(&self, user_id: &UserId) -> EngineResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.as_str().to_owned(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|error| EngineError::Internal(format!("token signing failed: {error}")))
    }

    /// The broker side of the shared-key contract.
    pub fn verify(&self, token: &str) -> EngineResult<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|error| EngineError::denied(format!("invalid token: {error}")))
    }
}
