//! Identity service
//!
//! The five identity operations:
//! - Register: create an account with a hashed password
//! - Login: verify credentials and open a session (access/refresh pair)
//! - Validate: check an access token against its live session
//! - RefreshToken: mint a new access token from a live refresh session
//! - GetUser: look a user up by contact info
//!
//! The service holds no state of its own. Every session it opens lives in the
//! session store, so revoking a session is a matter of deleting its entry.

use crate::cache::{SessionStore, SessionStoreError};
use crate::context::RequestContext;
use crate::db::repositories::{DirectoryError, UserRepository};
use crate::models::{ContactInfo, Credentials, NewUser, TokenDetail, User, UserStatus, USER_SCHEMA_VERSION};
use crate::services::password::{hash_password, verify_dummy, verify_password, HashError};
use crate::services::token::{TokenAuthority, TokenError};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Error types for identity operations
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Required input is missing
    #[error("Validation error: {0}")]
    Validation(String),

    /// Credentials were rejected
    #[error("Invalid user name or password")]
    Unauthorized,

    /// Duplicate user, or a token that does not match its session
    #[error("Conflict: {0}")]
    Conflict(String),

    /// No such user
    #[error("User not found")]
    NotFound,

    /// Token is not a well-formed JWT
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Token signature did not verify, or the token expired
    #[error("Invalid token signature: {0}")]
    InvalidSignature(String),

    /// Token claims are missing or unexpected
    #[error("Invalid token claim: {0}")]
    InvalidClaim(String),

    /// The session store could not be reached
    #[error("Session store unavailable after {attempts} reconnect attempts")]
    ExhaustedRetries { attempts: u32 },

    /// The request deadline passed
    #[error("Operation timed out")]
    Timeout,

    /// The request was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Discriminant of an `IdentityError`, used by adapters to pick a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Conflict,
    NotFound,
    MalformedToken,
    InvalidSignature,
    InvalidClaim,
    ExhaustedRetries,
    Timeout,
    Cancelled,
    Internal,
}

impl IdentityError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IdentityError::Validation(_) => ErrorKind::Validation,
            IdentityError::Unauthorized => ErrorKind::Unauthorized,
            IdentityError::Conflict(_) => ErrorKind::Conflict,
            IdentityError::NotFound => ErrorKind::NotFound,
            IdentityError::MalformedToken(_) => ErrorKind::MalformedToken,
            IdentityError::InvalidSignature(_) => ErrorKind::InvalidSignature,
            IdentityError::InvalidClaim(_) => ErrorKind::InvalidClaim,
            IdentityError::ExhaustedRetries { .. } => ErrorKind::ExhaustedRetries,
            IdentityError::Timeout => ErrorKind::Timeout,
            IdentityError::Cancelled => ErrorKind::Cancelled,
            IdentityError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<TokenError> for IdentityError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Malformed(msg) => IdentityError::MalformedToken(msg),
            TokenError::InvalidSignature(msg) => IdentityError::InvalidSignature(msg),
            TokenError::InvalidClaim(msg) => IdentityError::InvalidClaim(msg),
            TokenError::Signing(_) => IdentityError::Internal(anyhow::Error::new(e)),
        }
    }
}

impl From<SessionStoreError> for IdentityError {
    fn from(e: SessionStoreError) -> Self {
        match e {
            SessionStoreError::NotFound => IdentityError::Conflict("session not found".to_string()),
            SessionStoreError::ExhaustedRetries { attempts } => {
                IdentityError::ExhaustedRetries { attempts }
            }
            SessionStoreError::Timeout => IdentityError::Timeout,
            SessionStoreError::Cancelled => IdentityError::Cancelled,
            SessionStoreError::Backend(_) => IdentityError::Internal(anyhow::Error::new(e)),
        }
    }
}

impl From<DirectoryError> for IdentityError {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::Conflict(msg) => IdentityError::Conflict(msg),
            DirectoryError::NotFound => IdentityError::NotFound,
            DirectoryError::Timeout => IdentityError::Timeout,
            DirectoryError::Cancelled => IdentityError::Cancelled,
            DirectoryError::Internal(e) => IdentityError::Internal(e),
        }
    }
}

impl From<HashError> for IdentityError {
    fn from(e: HashError) -> Self {
        IdentityError::Internal(anyhow::Error::new(e))
    }
}

type IdentityResult<T> = std::result::Result<T, IdentityError>;

/// Identity service: registration, authentication and session tokens
pub struct IdentityService {
    users: Arc<dyn UserRepository>,
    sessions: Arc<SessionStore>,
    tokens: Arc<TokenAuthority>,
}

impl IdentityService {
    /// Create a new identity service
    pub fn new(
        users: Arc<dyn UserRepository>,
        sessions: Arc<SessionStore>,
        tokens: Arc<TokenAuthority>,
    ) -> Self {
        Self {
            users,
            sessions,
            tokens,
        }
    }

    /// Register a new user
    ///
    /// # Errors
    ///
    /// - `Validation` if the user name, password or email is empty
    /// - `Conflict` if a live user already holds the name or email
    pub async fn register(&self, ctx: &RequestContext, input: NewUser) -> IdentityResult<User> {
        if input.user_name.trim().is_empty() {
            return Err(IdentityError::Validation("user name is required".to_string()));
        }
        if input.password.is_empty() {
            return Err(IdentityError::Validation("password is required".to_string()));
        }
        if input.contact_info.email.trim().is_empty() {
            return Err(IdentityError::Validation("email is required".to_string()));
        }

        let password_hash = hash_password(&input.password)?;
        let now = Utc::now();

        let user = User {
            user_id: Uuid::new_v4().to_string(),
            user_name: input.user_name,
            password_hash,
            contact_info: input.contact_info,
            status: input.status.unwrap_or_else(|| UserStatus::active(now)),
            permissions: input.permissions,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            schema_version: USER_SCHEMA_VERSION,
        };

        let saved = self.users.save(ctx, &user).await?;
        tracing::info!(user_id = %saved.user_id, user_name = %saved.user_name, "User registered");

        Ok(saved.redacted())
    }

    /// Authenticate and open a session
    ///
    /// An unknown user, a wrong password and an inactive account all give the
    /// same `Unauthorized`. The access entry is written before the refresh
    /// entry; if the refresh write fails the access entry is removed again.
    pub async fn login(&self, ctx: &RequestContext, credentials: Credentials) -> IdentityResult<TokenDetail> {
        let user = match self.users.find_by_user_name(ctx, &credentials.user_name).await {
            Ok(user) => user,
            Err(DirectoryError::NotFound) => {
                verify_dummy(&credentials.password);
                tracing::warn!(user_name = %credentials.user_name, "Login failed: unknown user");
                return Err(IdentityError::Unauthorized);
            }
            Err(e) => return Err(e.into()),
        };

        if !verify_password(&credentials.password, &user.password_hash) {
            tracing::warn!(user_id = %user.user_id, "Login failed: wrong password");
            return Err(IdentityError::Unauthorized);
        }
        if !user.is_active() {
            tracing::warn!(user_id = %user.user_id, "Login failed: account inactive");
            return Err(IdentityError::Unauthorized);
        }

        let detail = self.tokens.create_access_token(&user.user_id)?;
        let now = Utc::now();

        self.sessions
            .set(ctx, &detail.access_session_id, &detail.access_token, detail.access_ttl(now))
            .await?;

        if let Err(e) = self
            .sessions
            .set(ctx, &detail.refresh_session_id, &detail.refresh_token, detail.refresh_ttl(now))
            .await
        {
            if let Err(rollback) = self.sessions.remove(ctx, &detail.access_session_id).await {
                tracing::warn!(
                    session_id = %detail.access_session_id,
                    error = %rollback,
                    "Failed to roll back access session"
                );
            }
            return Err(e.into());
        }

        tracing::info!(
            user_id = %user.user_id,
            session_id = %detail.access_session_id,
            "User logged in"
        );
        Ok(detail)
    }

    /// Check an access token against its live session
    ///
    /// Returns the validated access fields. A token whose session entry is
    /// gone or holds a different token gives `Conflict`.
    pub async fn validate(&self, ctx: &RequestContext, detail: TokenDetail) -> IdentityResult<TokenDetail> {
        let validated = self.tokens.validate_access_token(&detail.access_token)?;

        if validated.user_id != detail.user_id {
            return Err(IdentityError::Conflict("token does not belong to user".to_string()));
        }

        let cached = self.sessions.get(ctx, &validated.access_session_id).await?;
        if cached != validated.access_token {
            return Err(IdentityError::Conflict("token does not match session".to_string()));
        }

        tracing::debug!(
            user_id = %validated.user_id,
            session_id = %validated.access_session_id,
            "Access token validated"
        );
        Ok(validated)
    }

    /// Mint a new access token from a live refresh session
    ///
    /// The new access session is stored first. When the request also carries
    /// the access token being replaced, its session is then removed so the old
    /// token stops validating; without it the old token lives out its TTL.
    /// The refresh fields are returned unchanged.
    pub async fn refresh_token(&self, ctx: &RequestContext, detail: TokenDetail) -> IdentityResult<TokenDetail> {
        if detail.refresh_token.trim().is_empty() {
            return Err(IdentityError::Validation("refresh token is required".to_string()));
        }

        let validated = self.tokens.validate_refresh_token(&detail.refresh_token)?;

        let cached = self.sessions.get(ctx, &validated.refresh_session_id).await?;
        if cached != validated.refresh_token {
            return Err(IdentityError::Conflict("token does not match session".to_string()));
        }
        if validated.user_id != detail.user_id {
            return Err(IdentityError::Conflict("token does not belong to user".to_string()));
        }

        let renewed = self.tokens.renew_access_token(&validated.user_id)?;
        self.sessions
            .set(
                ctx,
                &renewed.access_session_id,
                &renewed.access_token,
                renewed.access_ttl(Utc::now()),
            )
            .await?;

        // The old session goes only once the new one is stored
        if !detail.access_token.is_empty() {
            self.revoke_replaced_access(ctx, &detail.access_token, &validated.user_id)
                .await?;
        }

        tracing::info!(
            user_id = %validated.user_id,
            session_id = %renewed.access_session_id,
            "Access token refreshed"
        );

        Ok(TokenDetail {
            refresh_token: detail.refresh_token,
            refresh_session_id: validated.refresh_session_id,
            refresh_expires_at: detail.refresh_expires_at,
            ..renewed
        })
    }

    /// Look up a user by contact info: email, then mobile, then phone
    pub async fn get_user(&self, ctx: &RequestContext, contact: ContactInfo) -> IdentityResult<User> {
        if contact.is_empty() {
            return Err(IdentityError::Validation(
                "email, mobile or phone is required".to_string(),
            ));
        }

        let user = self.users.find_by_contact(ctx, &contact).await?;
        Ok(user.redacted())
    }

    /// Drop the session of an access token that is being replaced.
    ///
    /// Tokens that fail to decode or belong to another user are ignored.
    async fn revoke_replaced_access(
        &self,
        ctx: &RequestContext,
        access_token: &str,
        user_id: &str,
    ) -> IdentityResult<()> {
        let old = match self.tokens.decode_access_token_unchecked_expiry(access_token) {
            Ok(old) if old.user_id == user_id => old,
            Ok(_) => return Ok(()),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring undecodable access token on refresh");
                return Ok(());
            }
        };

        self.sessions.remove(ctx, &old.access_session_id).await?;
        tracing::debug!(user_id, session_id = %old.access_session_id, "Replaced access session removed");
        Ok(())
    }
}
