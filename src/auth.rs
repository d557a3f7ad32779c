//! Accounts: registration, login and password changes.
//!
//! There are no sessions or tokens. Login answers with the user and the
//! client keeps the id. Accounts created before passwords existed have no
//! hash and accept any password.

use crate::error::AppError;
use crate::hub::ServerEvent;
use crate::models::{User, UserProfile};
use crate::state::SharedState;
use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

const MIN_PASSWORD_LEN: usize = 3;
const DEFAULT_AVATAR: &str = "👤";

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)?
        .to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };

    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

fn check_new_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn hashed(password: &str) -> Result<String, AppError> {
    hash_password(password).map_err(|e| AppError::Internal(e.to_string()))
}

// ── Requests ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub password: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    pub user_id: Option<Uuid>,
    pub current_password: Option<String>,
    #[serde(default)]
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub user: UserProfile,
}

// ── Handlers ───────────────────────────────────────────────────

// POST /api/auth/register
pub async fn register(
    State(state): State<SharedState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::validation("Name is required"));
    }
    check_new_password(&payload.password)?;
    let password_hash = hashed(&payload.password)?;

    let profile = {
        let mut world = state.write();
        if world.user_by_name_loose(name).is_some() {
            return Err(AppError::Conflict(format!("A user named {name} already exists")));
        }
        let avatar = payload
            .avatar
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_AVATAR.to_string());
        let mut user = User::new(name, Some(avatar), Utc::now());
        user.password_hash = Some(password_hash);
        let profile = world.insert_user(user)?.profile();
        state.commit(&mut world)?;
        profile
    };

    tracing::info!(user_id = %profile.id, name = %profile.name, "account registered");
    state.hub.publish(ServerEvent::UsersUpdated);
    Ok((StatusCode::CREATED, Json(AccountResponse { user: profile })))
}

// POST /api/auth/login
pub async fn login(
    State(state): State<SharedState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    let name = payload.name.trim();
    if name.is_empty() || payload.password.is_empty() {
        return Err(AppError::validation("Name and password are required"));
    }

    let world = state.read();
    let user = world
        .user_by_name_loose(name)
        .ok_or_else(|| AppError::Unauthorized("Unknown user".into()))?;

    if let Some(hash) = &user.password_hash {
        if !verify_password(&payload.password, hash) {
            tracing::debug!(user_id = %user.id, "login refused");
            return Err(AppError::Unauthorized("Wrong password".into()));
        }
    }

    tracing::debug!(user_id = %user.id, "login");
    Ok(Json(AccountResponse {
        user: user.profile(),
    }))
}

// PATCH /api/auth/change-password
pub async fn change_password(
    State(state): State<SharedState>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    let Some(user_id) = payload.user_id.filter(|_| !payload.new_password.is_empty()) else {
        return Err(AppError::validation("User id and new password are required"));
    };
    check_new_password(&payload.new_password)?;

    let current_hash = state.read().user(user_id)?.password_hash.clone();
    if let (Some(hash), Some(current)) = (current_hash, payload.current_password.as_deref()) {
        if !verify_password(current, &hash) {
            return Err(AppError::Unauthorized("Current password is incorrect".into()));
        }
    }

    let password_hash = hashed(&payload.new_password)?;
    {
        let mut world = state.write();
        world.modify_user(user_id, |u| u.password_hash = Some(password_hash))?;
        state.commit(&mut world)?;
    }

    tracing::info!(%user_id, "password changed");
    Ok(Json(json!({ "message": "Password updated" })))
}
