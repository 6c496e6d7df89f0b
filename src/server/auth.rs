//! Authentication policy
//!
//! Device auth at channel upgrade: allow-all when disabled, otherwise the
//! device must be allowlisted or present a configured bearer token. The
//! vision endpoint uses short-lived HS256 tokens signed with the server
//! auth key.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::GatewayError;

/// Injected policy run by the connection supervisor after identity
/// resolution. Rejection closes the channel without further I/O.
#[derive(Default)]
pub struct AuthPolicy;

impl AuthPolicy {
    pub fn authenticate(
        &self,
        device_id: &str,
        bearer_token: Option<&str>,
        config: &Config,
    ) -> Result<(), GatewayError> {
        let auth = &config.server.auth;
        if !auth.enabled {
            return Ok(());
        }

        if auth.allowed_devices.iter().any(|d| d == device_id) {
            return Ok(());
        }

        if let Some(token) = bearer_token {
            if auth.tokens.iter().any(|t| t == token) {
                return Ok(());
            }
        }

        Err(GatewayError::Auth(format!(
            "device {} not allowed and no valid token presented",
            device_id
        )))
    }
}

/// Claims for the vision-analysis endpoint token.
#[derive(Debug, Serialize, Deserialize)]
pub struct VisionClaims {
    pub device_id: String,
    pub exp: u64,
}

/// Mint a vision token for a device; handed out during bootstrap flows.
pub fn create_vision_token(auth_key: &str, device_id: &str) -> Result<String, GatewayError> {
    let claims = VisionClaims {
        device_id: device_id.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(1)).timestamp() as u64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(auth_key.as_bytes()),
    )
    .map_err(|e| GatewayError::Auth(e.to_string()))
}

/// Verify a vision token and return its claims.
pub fn verify_vision_token(auth_key: &str, token: &str) -> Result<VisionClaims, GatewayError> {
    decode::<VisionClaims>(
        token,
        &DecodingKey::from_secret(auth_key.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| GatewayError::Auth(e.to_string()))
}
