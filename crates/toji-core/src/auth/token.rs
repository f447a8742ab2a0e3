//! Session token decoding.
//!
//! Tokens are JWT-shaped: `header.payload[.signature]`, each segment
//! base64url without padding. Only the payload is read and the signature is
//! never checked, so the result is a hint about expiry and identity, not a
//! proof of either.

use base64::alphabet;
use base64::engine::{general_purpose::GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::timestamp::parse_instant;

/// Standard alphabet, padding required, lenient about trailing bits the
/// way browser `atob` is.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("Token has {0} segment(s), expected at least 2")]
    MissingPayload(usize),

    #[error("Payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Payload is not a JSON object: {0}")]
    Json(#[from] serde_json::Error),
}

/// Claims carried in the token payload. Every field is optional because
/// tokens are produced outside this crate, and a claim of the wrong type
/// reads as absent instead of failing the whole payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPayload {
    #[serde(default, deserialize_with = "lenient_id")]
    pub user_id: Option<i64>,
    #[serde(default, deserialize_with = "lenient")]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub expires_at: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub active: Option<bool>,
}

fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Ids also arrive quoted (`"user_id": "123"`).
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

impl SessionPayload {
    /// Expiry instant, if present and parsable
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.expires_at.as_deref().and_then(parse_instant)
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.created_at.as_deref().and_then(parse_instant)
    }
}

/// Decode the payload segment of a session token.
pub fn decode(token: &str) -> Result<SessionPayload, TokenError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() < 2 {
        return Err(TokenError::MissingPayload(parts.len()));
    }

    let bytes = PAYLOAD_ENGINE.decode(restore_base64(parts[1]))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Map the URL-safe alphabet back to the standard one and re-pad.
fn restore_base64(segment: &str) -> String {
    let mut restored: String = segment
        .chars()
        .map(|c| match c {
            '-' => '+',
            '_' => '/',
            other => other,
        })
        .collect();
    while restored.len() % 4 != 0 {
        restored.push('=');
    }
    restored
}
