//! Password hashing, bearer tokens and request authentication.

use anyhow::Result;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::api::{ApiError, SharedState};
use super::db::HubDb;
use super::models::{EventLevel, Role, User};
use crate::config::AuthSection;
use crate::errors::HubError;

// ── Passwords ─────────────────────────────────────────────────────────

pub fn hash_password(password: &str) -> Result<String, HubError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| HubError::PasswordHash(e.to_string()))
}

/// False for a wrong password and for an unparseable stored hash.
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

// ── Tokens ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// Issues and verifies HS256 access tokens whose subject is the user id.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_minutes: i64,
}

impl TokenService {
    pub fn new(secret: &str, ttl_minutes: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_minutes,
        }
    }

    pub fn from_config(auth: &AuthSection) -> Self {
        Self::new(&auth.jwt_secret, auth.token_ttl_minutes)
    }

    pub fn issue(&self, user_id: i64) -> Result<String, HubError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now,
            exp: now + self.ttl_minutes * 60,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| HubError::InvalidToken(e.to_string()))
    }

    /// The user id carried by a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Result<i64, HubError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| HubError::InvalidToken(e.to_string()))?;
        data.claims
            .sub
            .parse::<i64>()
            .map_err(|_| HubError::InvalidToken("subject is not a user id".into()))
    }
}

// ── Login / bootstrap ─────────────────────────────────────────────────

/// Check credentials. Unknown user, inactive user and wrong password all
/// produce the same `InvalidCredentials` error.
pub fn authenticate(db: &HubDb, username: &str, password: &str) -> Result<User> {
    let user = match db.get_user_by_username(username)? {
        Some(user) if user.is_active && verify_password(password, &user.password_hash) => user,
        _ => return Err(HubError::InvalidCredentials.into()),
    };
    db.set_last_login(user.id)?;
    db.log_event(
        EventLevel::Info,
        "login",
        &format!("User {} logged in", user.username),
        Some(user.id),
        &serde_json::json!({}),
    )?;
    db.get_user(user.id)?
        .ok_or_else(|| HubError::NotFound { kind: "User", id: user.id }.into())
}

/// Create the configured admin account on first start.
///
/// Returns the created user, or `None` when the account already exists or no
/// password is configured.
pub fn bootstrap_admin(db: &HubDb, auth: &AuthSection) -> Result<Option<User>> {
    let username = auth.admin_username.trim().to_lowercase();
    if username.is_empty() || db.get_user_by_username(&username)?.is_some() {
        return Ok(None);
    }

    let Some(password) = auth.admin_password.as_deref().filter(|p| !p.is_empty()) else {
        warn!(username = %username, "admin bootstrap skipped: ADMIN_PASSWORD is not set");
        db.log_event(
            EventLevel::Warning,
            "bootstrap_admin_skipped",
            "Admin bootstrap skipped because no admin password is configured",
            None,
            &serde_json::json!({"username": username}),
        )?;
        return Ok(None);
    };

    let hash = hash_password(password)?;
    let user = db.create_user(&username, auth.admin_email.as_deref(), Role::Admin, &hash)?;
    db.log_event(
        EventLevel::Info,
        "bootstrap_admin",
        &format!("Created admin user {}", user.username),
        Some(user.id),
        &serde_json::json!({}),
    )?;
    info!(username = %user.username, "bootstrapped admin user");
    Ok(Some(user))
}

// ── Extractors ────────────────────────────────────────────────────────

/// Resolve a raw bearer token to an active user.
pub async fn user_from_token(state: &SharedState, token: &str) -> Result<User, ApiError> {
    let user_id = state
        .tokens
        .verify(token)
        .map_err(|_| ApiError::Unauthorized("Invalid token".into()))?;
    let user = state.db.call(move |db| db.get_user(user_id)).await?;
    match user {
        Some(user) if user.is_active => Ok(user),
        _ => Err(ApiError::Unauthorized("User inactive".into())),
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() { None } else { Some(token) }
}

/// The authenticated caller, from `Authorization: Bearer <token>`.
pub struct CurrentUser(pub User);

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ApiError::Unauthorized("Not authenticated".into()))?
            .to_string();
        user_from_token(state, &token).await.map(CurrentUser)
    }
}

/// An authenticated caller with the admin role.
pub struct AdminUser(pub User);

impl FromRequestParts<SharedState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        require_admin(&user)?;
        Ok(AdminUser(user))
    }
}

pub fn require_admin(user: &User) -> Result<(), ApiError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Forbidden("Admin access required".into()))
    }
}
