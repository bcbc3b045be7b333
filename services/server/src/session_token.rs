//! Signed, expiring session tokens.
//!
//! A token is `base64url(payload_json) + "." + hex(hmac_sha256(payload))`.
//! The codec is stateless and deterministic in its inputs; nothing about a
//! session is stored server-side beyond the connection it names.
//!
//! Refresh never rotates the session id: it re-mints with a fresh issuance
//! and expiry, preserving all other fields.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

/// The claims carried inside a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub connection_id: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Unix millis.
    pub issued_at: i64,
    /// Unix millis.
    pub expires_at: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("signing key rejected")]
    InvalidKey,
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("token payload encode: {0}")]
    Encode(String),
}

#[derive(Clone)]
pub struct SessionTokenCodec {
    mac: HmacSha256,
}

impl SessionTokenCodec {
    pub fn new(secret: &[u8]) -> Result<Self, TokenError> {
        let mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidKey)?;
        Ok(Self { mac })
    }

    /// Mint a token for `session_id` expiring `ttl` from now.
    pub fn mint(
        &self,
        session_id: &str,
        connection_id: &str,
        metadata: &serde_json::Value,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let issued_at = chrono::Utc::now().timestamp_millis();
        let record = SessionRecord {
            session_id: session_id.to_owned(),
            connection_id: connection_id.to_owned(),
            metadata: metadata.clone(),
            issued_at,
            expires_at: issued_at + i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX),
        };
        let json = serde_json::to_vec(&record).map_err(|e| TokenError::Encode(e.to_string()))?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let tag = self.sign(payload.as_bytes());
        Ok(format!("{payload}.{tag}"))
    }

    /// Verify a token's signature and expiry, returning its claims.
    pub fn verify(&self, token: &str) -> Result<SessionRecord, TokenError> {
        let (payload, tag_hex) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let tag = hex::decode(tag_hex).map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&tag).map_err(|_| TokenError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let record: SessionRecord =
            serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;

        if chrono::Utc::now().timestamp_millis() >= record.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(record)
    }

    fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }
}
