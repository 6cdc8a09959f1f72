use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use shared_models::auth::{JwtClaims, User};

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("JWT secret is not set")]
    MissingSecret,

    #[error("Invalid token format")]
    Malformed,

    #[error("Invalid token signature")]
    BadSignature,

    #[error("Invalid claims format")]
    BadClaims,

    #[error("Token expired")]
    Expired,
}

/// Validates an HS256 token issued by the identity provider and returns the user it names.
pub fn validate_token(token: &str, jwt_secret: &str) -> Result<User, TokenError> {
    if jwt_secret.is_empty() {
        return Err(TokenError::MissingSecret);
    }

    let mut parts = token.split('.');
    let (header_b64, claims_b64, signature_b64) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s), None) => (h, c, s),
        _ => return Err(TokenError::Malformed),
    };

    let signature = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|e| {
        debug!("Failed to decode signature: {}", e);
        TokenError::BadSignature
    })?;

    let mut mac = HmacSha256::new_from_slice(jwt_secret.as_bytes())
        .map_err(|_| TokenError::MissingSecret)?;
    mac.update(format!("{}.{}", header_b64, claims_b64).as_bytes());

    if mac.verify_slice(&signature).is_err() {
        debug!("Token signature verification failed");
        return Err(TokenError::BadSignature);
    }

    let claims_json = URL_SAFE_NO_PAD.decode(claims_b64).map_err(|_| TokenError::BadClaims)?;
    let claims: JwtClaims = serde_json::from_slice(&claims_json).map_err(|e| {
        debug!("Failed to parse claims: {}", e);
        TokenError::BadClaims
    })?;

    if let Some(exp) = claims.exp {
        let now = Utc::now().timestamp().max(0) as u64;
        if exp < now {
            debug!("Token expired at {} (now: {})", exp, now);
            return Err(TokenError::Expired);
        }
    }

    // Supabase puts the application role in app_metadata; the top-level role is usually "authenticated"
    let role = claims.app_metadata
        .as_ref()
        .and_then(|meta| meta.get("role"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or(claims.role);

    let user = User {
        id: claims.sub,
        email: claims.email,
        role,
        metadata: claims.user_metadata,
        created_at: claims.iat.and_then(|ts| Utc.timestamp_opt(ts as i64, 0).single()),
    };

    debug!("Token validated successfully for user: {}", user.id);
    Ok(user)
}

/// Produces an HS256 token over `claims`. Used by tooling and tests.
pub fn sign_token(claims: &Value, jwt_secret: &str) -> Result<String, TokenError> {
    let header = serde_json::json!({ "alg": "HS256", "typ": "JWT" });
    let header_b64 = URL_SAFE_NO_PAD.encode(header.to_string());
    let claims_b64 = URL_SAFE_NO_PAD.encode(claims.to_string());
    let signing_input = format!("{}.{}", header_b64, claims_b64);

    let mut mac = HmacSha256::new_from_slice(jwt_secret.as_bytes())
        .map_err(|_| TokenError::MissingSecret)?;
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", signing_input, signature))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    const SECRET: &str = "unit-test-secret";

    #[test]
    fn round_trips_claims_and_prefers_app_metadata_role() {
        let exp = Utc::now().timestamp() + 3600;
        let token = sign_token(&json!({
            "sub": "8d3c2a7e-4a57-4a0c-8f55-7b7f5e6f2b10",
            "role": "authenticated",
            "app_metadata": { "role": "doctor" },
            "exp": exp
        }), SECRET).unwrap();

        let user = validate_token(&token, SECRET).unwrap();
        assert_eq!(user.role.as_deref(), Some("doctor"));
    }

    #[test]
    fn rejects_tampered_and_expired_tokens() {
        let expired = sign_token(&json!({ "sub": "u", "exp": 1 }), SECRET).unwrap();
        assert_matches!(validate_token(&expired, SECRET), Err(TokenError::Expired));

        let valid = sign_token(&json!({ "sub": "u" }), SECRET).unwrap();
        assert_matches!(validate_token(&valid, "other-secret"), Err(TokenError::BadSignature));
        assert_matches!(validate_token("a.b", SECRET), Err(TokenError::Malformed));
        assert_matches!(validate_token(&valid, ""), Err(TokenError::MissingSecret));
    }
}
