// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Signed short-lived site token.
//!
//! Format: `base64(payload) "." base64(hmac_sha256(key, payload))` with
//! payload `exp=<unix seconds>`.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::TokenError;

type HmacSha256 = Hmac<Sha256>;

/// Site token proving the host's identity to the control plane.
pub struct SiteToken;

impl SiteToken {
    /// Create a token valid until `expires_at`.
    pub fn create(expires_at: DateTime<Utc>, key: &[u8]) -> Result<String, TokenError> {
        let payload = format!("exp={}", expires_at.timestamp());
        let signature = sign(payload.as_bytes(), key)?;
        Ok(format!(
            "{}.{}",
            general_purpose::STANDARD.encode(payload),
            general_purpose::STANDARD.encode(signature)
        ))
    }

    /// Check signature and expiry. Returns the expiry on success.
    pub fn validate(token: &str, key: &[u8], now: DateTime<Utc>) -> Result<DateTime<Utc>, TokenError> {
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let payload = general_purpose::STANDARD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let signature = general_purpose::STANDARD
            .decode(signature_b64)
            .map_err(|_| TokenError::Malformed)?;

        if key.is_empty() {
            return Err(TokenError::EmptyKey);
        }
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TokenError::EmptyKey)?;
        mac.update(&payload);
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let payload = std::str::from_utf8(&payload).map_err(|_| TokenError::Malformed)?;
        let expires_at = payload
            .strip_prefix("exp=")
            .and_then(|secs| secs.parse::<i64>().ok())
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or(TokenError::Malformed)?;

        if expires_at <= now {
            return Err(TokenError::Expired(expires_at));
        }
        Ok(expires_at)
    }
}

fn sign(payload: &[u8], key: &[u8]) -> Result<Vec<u8>, TokenError> {
    if key.is_empty() {
        return Err(TokenError::EmptyKey);
    }
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TokenError::EmptyKey)?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const KEY: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_create_and_validate() {
        let now = Utc::now();
        let expires = now + Duration::minutes(5);
        let token = SiteToken::create(expires, KEY).unwrap();

        let validated = SiteToken::validate(&token, KEY, now).unwrap();
        assert_eq!(validated.timestamp(), expires.timestamp());
    }

    #[test]
    fn test_payload_is_readable() {
        let expires = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let token = SiteToken::create(expires, KEY).unwrap();
        let (payload, _) = token.split_once('.').unwrap();
        let decoded = general_purpose::STANDARD.decode(payload).unwrap();
        assert_eq!(decoded, b"exp=1700000000");
    }

    #[test]
    fn test_expired_token_rejected() {
        let now = Utc::now();
        let token = SiteToken::create(now - Duration::seconds(1), KEY).unwrap();
        assert!(matches!(
            SiteToken::validate(&token, KEY, now),
            Err(TokenError::Expired(_))
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let now = Utc::now();
        let token = SiteToken::create(now + Duration::minutes(5), KEY).unwrap();
        assert_eq!(
            SiteToken::validate(&token, b"another-key", now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let now = Utc::now();
        let token = SiteToken::create(now + Duration::minutes(5), KEY).unwrap();
        let (_, signature) = token.split_once('.').unwrap();
        let forged = format!(
            "{}.{}",
            general_purpose::STANDARD.encode("exp=99999999999"),
            signature
        );
        assert_eq!(
            SiteToken::validate(&forged, KEY, now),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn test_malformed_and_empty_key() {
        assert_eq!(
            SiteToken::validate("no-dot-here", KEY, Utc::now()),
            Err(TokenError::Malformed)
        );
        assert_eq!(
            SiteToken::create(Utc::now(), b""),
            Err(TokenError::EmptyKey)
        );
    }
}
