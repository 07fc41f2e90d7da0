//! Token authority
//!
//! Mints and verifies the signed access/refresh token pair. Both tokens are
//! HS256 JWTs signed with separate secrets. Each carries the session id under
//! which the session store keeps its authoritative copy.

use chrono::{DateTime, Utc};
use jsonwebtoken::{
    decode, decode_header, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::models::TokenDetail;

const BEARER_PREFIX: &str = "Bearer ";

/// Token authority errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// Signing a token failed
    #[error("Failed to sign token: {0}")]
    Signing(String),

    /// The token is not a well-formed HS256 JWT
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// Signature verification failed or the token expired
    #[error("Invalid token signature: {0}")]
    InvalidSignature(String),

    /// Claims are missing, unknown, mistyped or carry unexpected values
    #[error("Invalid token claim: {0}")]
    InvalidClaim(String),
}

/// Claims carried by an access token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct AccessClaims {
    authorized: bool,
    access_uuid: String,
    user_id: String,
    exp: i64,
}

/// Claims carried by a refresh token
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RefreshClaims {
    authorized: bool,
    refresh_uuid: String,
    user_id: String,
    exp: i64,
}

trait SessionClaims: DeserializeOwned {
    fn authorized(&self) -> bool;
    fn session_id(&self) -> &str;
    fn user_id(&self) -> &str;
}

impl SessionClaims for AccessClaims {
    fn authorized(&self) -> bool {
        self.authorized
    }
    fn session_id(&self) -> &str {
        &self.access_uuid
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl SessionClaims for RefreshClaims {
    fn authorized(&self) -> bool {
        self.authorized
    }
    fn session_id(&self) -> &str {
        &self.refresh_uuid
    }
    fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// A signing key pair for one token kind
#[derive(Clone)]
struct KeyPair {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl KeyPair {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Mints and verifies access/refresh token pairs.
///
/// Secrets and lifetimes are fixed at construction.
#[derive(Clone)]
pub struct TokenAuthority {
    access: KeyPair,
    refresh: KeyPair,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl TokenAuthority {
    /// Create a new token authority
    pub fn new(
        access_secret: &str,
        refresh_secret: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            access: KeyPair::from_secret(access_secret),
            refresh: KeyPair::from_secret(refresh_secret),
            access_ttl,
            refresh_ttl,
        }
    }

    /// Lifetime of access tokens
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Lifetime of refresh tokens
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Mint a fresh access/refresh pair for `user_id`.
    pub fn create_access_token(&self, user_id: &str) -> Result<TokenDetail, TokenError> {
        let now = Utc::now();
        let (access_token, access_session_id, access_expires_at) = self.sign_access(user_id, now)?;

        let refresh_session_id = Uuid::new_v4().to_string();
        let refresh_expires_at = expiry(now, self.refresh_ttl)?;
        let refresh_claims = RefreshClaims {
            authorized: true,
            refresh_uuid: refresh_session_id.clone(),
            user_id: user_id.to_string(),
            exp: refresh_expires_at.timestamp(),
        };
        let refresh_token = sign(&refresh_claims, &self.refresh.encoding)?;

        Ok(TokenDetail {
            access_token,
            refresh_token,
            access_session_id,
            refresh_session_id,
            user_id: user_id.to_string(),
            access_expires_at: Some(access_expires_at),
            refresh_expires_at: Some(refresh_expires_at),
        })
    }

    /// Mint a new access token alone, leaving the refresh fields empty.
    pub fn renew_access_token(&self, user_id: &str) -> Result<TokenDetail, TokenError> {
        let (access_token, access_session_id, access_expires_at) =
            self.sign_access(user_id, Utc::now())?;

        Ok(TokenDetail {
            access_token,
            access_session_id,
            user_id: user_id.to_string(),
            access_expires_at: Some(access_expires_at),
            ..Default::default()
        })
    }

    /// Verify an access token.
    ///
    /// An optional `Bearer ` prefix is stripped. On success only
    /// `access_session_id`, `user_id` and `access_token` are populated.
    pub fn validate_access_token(&self, token: &str) -> Result<TokenDetail, TokenError> {
        let token = strip_bearer(token);
        let claims: AccessClaims = verify(token, &self.access.decoding, true)?;
        Ok(access_detail(token, claims))
    }

    /// Verify a refresh token.
    ///
    /// On success only `refresh_session_id`, `user_id` and `refresh_token`
    /// are populated.
    pub fn validate_refresh_token(&self, token: &str) -> Result<TokenDetail, TokenError> {
        let token = strip_bearer(token);
        let claims: RefreshClaims = verify(token, &self.refresh.decoding, true)?;
        Ok(TokenDetail {
            refresh_token: token.to_string(),
            refresh_session_id: claims.refresh_uuid,
            user_id: claims.user_id,
            ..Default::default()
        })
    }

    /// Verify an access token's signature and claims without enforcing expiry.
    ///
    /// Used to identify the session of an access token that is being replaced.
    pub fn decode_access_token_unchecked_expiry(
        &self,
        token: &str,
    ) -> Result<TokenDetail, TokenError> {
        let token = strip_bearer(token);
        let claims: AccessClaims = verify(token, &self.access.decoding, false)?;
        Ok(access_detail(token, claims))
    }

    fn sign_access(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(String, String, DateTime<Utc>), TokenError> {
        let session_id = Uuid::new_v4().to_string();
        let expires_at = expiry(now, self.access_ttl)?;
        let claims = AccessClaims {
            authorized: true,
            access_uuid: session_id.clone(),
            user_id: user_id.to_string(),
            exp: expires_at.timestamp(),
        };
        let token = sign(&claims, &self.access.encoding)?;
        Ok((token, session_id, expires_at))
    }
}

/// Strip an optional `Bearer ` prefix
pub fn strip_bearer(token: &str) -> &str {
    token.strip_prefix(BEARER_PREFIX).unwrap_or(token)
}

fn access_detail(token: &str, claims: AccessClaims) -> TokenDetail {
    TokenDetail {
        access_token: token.to_string(),
        access_session_id: claims.access_uuid,
        user_id: claims.user_id,
        ..Default::default()
    }
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>, TokenError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| TokenError::Signing(format!("token lifetime out of range: {:?}", ttl)))
}

fn sign<C: Serialize>(claims: &C, key: &EncodingKey) -> Result<String, TokenError> {
    encode(&Header::new(Algorithm::HS256), claims, key)
        .map_err(|e| TokenError::Signing(e.to_string()))
}

fn verify<C: SessionClaims>(
    token: &str,
    key: &DecodingKey,
    enforce_expiry: bool,
) -> Result<C, TokenError> {
    let header = decode_header(token).map_err(|e| TokenError::Malformed(e.to_string()))?;
    if header.alg != Algorithm::HS256 {
        return Err(TokenError::Malformed(format!(
            "unexpected signing method: {:?}",
            header.alg
        )));
    }

    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = enforce_expiry;
    validation.set_required_spec_claims(&["exp"]);

    let data = decode::<C>(token, key, &validation).map_err(|e| {
        let message = e.to_string();
        match e.kind() {
            ErrorKind::InvalidSignature | ErrorKind::ExpiredSignature => {
                TokenError::InvalidSignature(message)
            }
            ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => {
                TokenError::InvalidClaim(message)
            }
            ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Utf8(_) => TokenError::Malformed(message),
            _ => TokenError::InvalidSignature(message),
        }
    })?;

    let claims = data.claims;
    if !claims.authorized() {
        return Err(TokenError::InvalidClaim("token is not authorized".to_string()));
    }
    if claims.session_id().is_empty() {
        return Err(TokenError::InvalidClaim("missing session id".to_string()));
    }
    if claims.user_id().is_empty() {
        return Err(TokenError::InvalidClaim("missing user id".to_string()));
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ACCESS_SECRET: &str = "access-secret-for-tests";
    const REFRESH_SECRET: &str = "refresh-secret-for-tests";

    fn authority() -> TokenAuthority {
        TokenAuthority::new(
            ACCESS_SECRET,
            REFRESH_SECRET,
            Duration::from_secs(900),
            Duration::from_secs(7 * 24 * 3600),
        )
    }

    fn sign_raw(claims: serde_json::Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("Failed to sign raw claims")
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 600
    }

    /// Flip one character in the middle of the signature segment
    fn mutate_signature(token: &str) -> String {
        let mut chars: Vec<char> = token.chars().collect();
        let idx = chars.len() - 10;
        chars[idx] = if chars[idx] == 'A' { 'B' } else { 'A' };
        chars.into_iter().collect()
    }

    #[test]
    fn test_create_access_token_pair() {
        let detail = authority().create_access_token("user-1").expect("Failed to mint pair");

        assert_eq!(detail.user_id, "user-1");
        assert!(!detail.access_token.is_empty());
        assert!(!detail.refresh_token.is_empty());
        assert_ne!(detail.access_session_id, detail.refresh_session_id);
        assert_ne!(detail.access_token, detail.refresh_token);

        let access_exp = detail.access_expires_at.expect("access expiry");
        let refresh_exp = detail.refresh_expires_at.expect("refresh expiry");
        assert!(refresh_exp > access_exp);
    }

    #[test]
    fn test_validate_access_token_round_trip() {
        let tokens = authority();
        let detail = tokens.create_access_token("user-1").unwrap();

        let validated = tokens.validate_access_token(&detail.access_token).unwrap();
        assert_eq!(validated.access_session_id, detail.access_session_id);
        assert_eq!(validated.user_id, "user-1");
        assert_eq!(validated.access_token, detail.access_token);
        assert!(validated.refresh_token.is_empty());
        assert!(validated.refresh_session_id.is_empty());
    }

    #[test]
    fn test_validate_strips_bearer_prefix() {
        let tokens = authority();
        let detail = tokens.create_access_token("user-1").unwrap();

        let validated = tokens
            .validate_access_token(&format!("Bearer {}", detail.access_token))
            .unwrap();
        assert_eq!(validated.access_token, detail.access_token);
    }

    #[test]
    fn test_validate_refresh_token_round_trip() {
        let tokens = authority();
        let detail = tokens.create_access_token("user-1").unwrap();

        let validated = tokens.validate_refresh_token(&detail.refresh_token).unwrap();
        assert_eq!(validated.refresh_session_id, detail.refresh_session_id);
        assert_eq!(validated.user_id, "user-1");
        assert!(validated.access_token.is_empty());
    }

    #[test]
    fn test_tokens_are_not_interchangeable() {
        let tokens = authority();
        let detail = tokens.create_access_token("user-1").unwrap();

        assert!(matches!(
            tokens.validate_refresh_token(&detail.access_token),
            Err(TokenError::InvalidSignature(_))
        ));
        assert!(matches!(
            tokens.validate_access_token(&detail.refresh_token),
            Err(TokenError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_mutated_signature_is_rejected() {
        let tokens = authority();
        let detail = tokens.create_access_token("user-1").unwrap();

        let tampered = mutate_signature(&detail.access_token);
        assert!(matches!(
            tokens.validate_access_token(&tampered),
            Err(TokenError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let tokens = authority();
        assert!(matches!(tokens.validate_access_token(""), Err(TokenError::Malformed(_))));
        assert!(matches!(
            tokens.validate_access_token("not-a-jwt"),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_other_algorithm_is_malformed() {
        let claims = json!({
            "authorized": true,
            "access_uuid": "s-1",
            "user_id": "user-1",
            "exp": future_exp(),
        });
        let token = encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(ACCESS_SECRET.as_bytes()),
        )
        .unwrap();

        assert!(matches!(
            authority().validate_access_token(&token),
            Err(TokenError::Malformed(_))
        ));
    }

    #[test]
    fn test_expired_token_fails_signature_check() {
        let token = sign_raw(
            json!({
                "authorized": true,
                "access_uuid": "s-1",
                "user_id": "user-1",
                "exp": Utc::now().timestamp() - 60,
            }),
            ACCESS_SECRET,
        );

        assert!(matches!(
            authority().validate_access_token(&token),
            Err(TokenError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_unchecked_expiry_decode_accepts_expired_token() {
        let token = sign_raw(
            json!({
                "authorized": true,
                "access_uuid": "s-1",
                "user_id": "user-1",
                "exp": Utc::now().timestamp() - 60,
            }),
            ACCESS_SECRET,
        );

        let detail = authority().decode_access_token_unchecked_expiry(&token).unwrap();
        assert_eq!(detail.access_session_id, "s-1");
        assert_eq!(detail.user_id, "user-1");
    }

    #[test]
    fn test_unauthorized_claim_is_rejected() {
        let token = sign_raw(
            json!({
                "authorized": false,
                "access_uuid": "s-1",
                "user_id": "user-1",
                "exp": future_exp(),
            }),
            ACCESS_SECRET,
        );

        assert!(matches!(
            authority().validate_access_token(&token),
            Err(TokenError::InvalidClaim(_))
        ));
    }

    #[test]
    fn test_unknown_claim_is_rejected() {
        let token = sign_raw(
            json!({
                "authorized": true,
                "access_uuid": "s-1",
                "user_id": "user-1",
                "exp": future_exp(),
                "role": "admin",
            }),
            ACCESS_SECRET,
        );

        assert!(matches!(
            authority().validate_access_token(&token),
            Err(TokenError::InvalidClaim(_))
        ));
    }

    #[test]
    fn test_missing_or_mistyped_claims_are_rejected() {
        let tokens = authority();

        let missing_user = sign_raw(
            json!({ "authorized": true, "access_uuid": "s-1", "exp": future_exp() }),
            ACCESS_SECRET,
        );
        assert!(matches!(
            tokens.validate_access_token(&missing_user),
            Err(TokenError::InvalidClaim(_))
        ));

        let mistyped = sign_raw(
            json!({ "authorized": "yes", "access_uuid": "s-1", "user_id": "u", "exp": future_exp() }),
            ACCESS_SECRET,
        );
        assert!(matches!(
            tokens.validate_access_token(&mistyped),
            Err(TokenError::InvalidClaim(_))
        ));

        let empty_session = sign_raw(
            json!({ "authorized": true, "access_uuid": "", "user_id": "u", "exp": future_exp() }),
            ACCESS_SECRET,
        );
        assert!(matches!(
            tokens.validate_access_token(&empty_session),
            Err(TokenError::InvalidClaim(_))
        ));

        let no_exp = sign_raw(
            json!({ "authorized": true, "access_uuid": "s-1", "user_id": "u" }),
            ACCESS_SECRET,
        );
        assert!(matches!(
            tokens.validate_access_token(&no_exp),
            Err(TokenError::InvalidClaim(_))
        ));
    }

    #[test]
    fn test_renew_access_token_leaves_refresh_empty() {
        let tokens = authority();
        let renewed = tokens.renew_access_token("user-1").unwrap();

        assert!(!renewed.access_token.is_empty());
        assert!(renewed.refresh_token.is_empty());
        assert!(renewed.refresh_expires_at.is_none());
        assert_eq!(
            tokens.validate_access_token(&renewed.access_token).unwrap().user_id,
            "user-1"
        );
    }
}
