use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value as JsonValue;
use thiserror::Error;
use time::OffsetDateTime;

use crate::types::{Identity, Role};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token format")]
    Format,
    #[error("invalid token encoding")]
    Encoding,
    #[error("missing claim: {0}")]
    MissingClaim(&'static str),
}

/// Unverified claims read from the payload segment of a compact token.
///
/// The client never checks signatures; the claims are only used to decide
/// when to renew and who the token belongs to.
#[derive(Debug, Clone)]
pub struct UnverifiedClaims {
    inner: JsonValue,
}

impl UnverifiedClaims {
    #[must_use]
    pub fn get_claim(&self, key: &str) -> Option<&JsonValue> {
        self.inner.get(key)
    }

    /// Expiry in seconds since the epoch. Fractional values are truncated.
    pub fn expires_at(&self) -> Result<i64, TokenError> {
        match self.inner.get("exp") {
            Some(JsonValue::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or(TokenError::MissingClaim("exp")),
            _ => Err(TokenError::MissingClaim("exp")),
        }
    }

    /// Identity from the `user_id` and `role` claims.
    pub fn identity(&self) -> Result<Identity, TokenError> {
        let id = match self.inner.get("user_id") {
            Some(JsonValue::Number(n)) => n.as_i64(),
            Some(JsonValue::String(s)) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
        .ok_or(TokenError::MissingClaim("user_id"))?;
        let role = self
            .inner
            .get("role")
            .and_then(|v| v.as_str())
            .map(Role::parse)
            .ok_or(TokenError::MissingClaim("role"))?;
        Ok(Identity { id, role })
    }
}

/// Decodes the middle segment of a three-segment token.
pub fn decode_claims(token: &str) -> Result<UnverifiedClaims, TokenError> {
    let parts: Vec<&str> = token.trim().split('.').collect();
    if parts.len() != 3 || parts[1].is_empty() {
        return Err(TokenError::Format);
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|_| TokenError::Encoding)?;
    let inner: JsonValue = serde_json::from_slice(&payload).map_err(|_| TokenError::Encoding)?;
    if !inner.is_object() {
        return Err(TokenError::Format);
    }
    Ok(UnverifiedClaims { inner })
}

/// Fail-closed expiry check: anything that cannot be decoded counts as expired.
pub fn is_expired_at(token: &str, now_unix: i64, skew_seconds: i64) -> bool {
    match decode_claims(token).and_then(|c| c.expires_at()) {
        Ok(exp) => exp <= now_unix.saturating_add(skew_seconds),
        Err(_) => true,
    }
}

pub fn is_expired(token: &str, skew_seconds: i64) -> bool {
    is_expired_at(token, OffsetDateTime::now_utc().unix_timestamp(), skew_seconds)
}

#[cfg(test)]
pub(crate) fn encode_for_test(claims: JsonValue) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_800_000_000;

    #[test]
    fn token_expired_ten_seconds_ago_is_expired() {
        let token = encode_for_test(json!({ "exp": NOW - 10 }));
        assert!(is_expired_at(&token, NOW, 0));
    }

    #[test]
    fn token_valid_for_an_hour_is_not_expired() {
        let token = encode_for_test(json!({ "exp": NOW + 3600 }));
        assert!(!is_expired_at(&token, NOW, 0));
    }

    #[test]
    fn skew_pulls_expiry_forward() {
        let token = encode_for_test(json!({ "exp": NOW + 20 }));
        assert!(!is_expired_at(&token, NOW, 0));
        assert!(is_expired_at(&token, NOW, 30));
    }

    #[test]
    fn undecodable_tokens_are_expired() {
        assert!(is_expired_at("not-a-token", NOW, 0));
        assert!(is_expired_at("a.!!!.c", NOW, 0));
        assert!(is_expired_at("", NOW, 0));

        let no_exp = encode_for_test(json!({ "user_id": 3 }));
        assert!(is_expired_at(&no_exp, NOW, 0));

        let string_exp = encode_for_test(json!({ "exp": "soon" }));
        assert!(is_expired_at(&string_exp, NOW, 0));
    }

    #[test]
    fn identity_reads_user_id_and_role() {
        let token = encode_for_test(json!({ "exp": NOW, "user_id": "12", "role": "admin" }));
        let identity = decode_claims(&token).unwrap().identity().unwrap();
        assert_eq!(identity.id, 12);
        assert_eq!(identity.role, Role::Admin);

        let token = encode_for_test(json!({ "exp": NOW, "user_id": 12 }));
        assert_eq!(
            decode_claims(&token).unwrap().identity(),
            Err(TokenError::MissingClaim("role"))
        );
    }
}
