use axum::{
    extract::{FromRef, State},
    routing::{get, post},
    Json, Router,
};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{
        dto::{
            AuthResponse, LoginRequest, ProfileResponse, PublicUser, RefreshRequest,
            RegisterRequest,
        },
        repo::{TakenField, User},
        services::{hash_password, is_valid_email, is_valid_phone, verify_password, AuthUser, JwtKeys},
    },
    entitlement::{self, store::StoreError},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, (axum::http::StatusCode, String)> {
    payload.email = payload.email.trim().to_lowercase();
    payload.username = payload.username.trim().to_string();

    if payload.username.len() < 3 {
        warn!("username too short");
        return Err((
            axum::http::StatusCode::BAD_REQUEST,
            "Username must be at least 3 characters".into(),
        ));
    }

    if payload.password.len() < 8 {
        warn!("password too short");
        return Err((
            axum::http::StatusCode::BAD_REQUEST,
            "Password too short".into(),
        ));
    }

    if !is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err((axum::http::StatusCode::BAD_REQUEST, "Invalid email".into()));
    }

    if !is_valid_phone(&payload.phone_number) {
        warn!("invalid phone number");
        return Err((
            axum::http::StatusCode::BAD_REQUEST,
            "Invalid phone number".into(),
        ));
    }

    match User::find_taken(&state.db, &payload.username, &payload.email, &payload.phone_number)
        .await
    {
        Ok(None) => {}
        Ok(Some(field)) => {
            let message = match field {
                TakenField::Username => "Username already taken",
                TakenField::Email => "Email already registered",
                TakenField::Phone => "Phone number already registered",
            };
            warn!(username = %payload.username, "registration conflict: {message}");
            return Err((axum::http::StatusCode::CONFLICT, message.into()));
        }
        Err(e) => {
            error!(error = %e, "find_taken failed");
            return Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    }

    let hash = match hash_password(&payload.password) {
        Ok(h) => h,
        Err(e) => {
            error!(error = %e, "hash_password failed");
            return Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };

    let user = match User::create(
        &state.db,
        &payload.username,
        &payload.email,
        &payload.phone_number,
        &hash,
    )
    .await
    {
        Ok(u) => u,
        Err(e) => {
            error!(error = %e, "create user failed");
            return Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };

    info!(user_id = %user.id, username = %user.username, role = %user.role, "user registered");
    issue_tokens(&state, user)
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, (axum::http::StatusCode, String)> {
    let user = match User::find_by_username(&state.db, payload.username.trim()).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!(username = %payload.username, "login unknown username");
            return Err((
                axum::http::StatusCode::UNAUTHORIZED,
                "Invalid credentials".into(),
            ));
        }
        Err(e) => {
            error!(error = %e, "find_by_username failed");
            return Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };

    let ok = match verify_password(&payload.password, &user.password_hash) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "verify_password failed");
            return Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };

    if !ok {
        warn!(username = %payload.username, user_id = %user.id, "login invalid password");
        return Err((
            axum::http::StatusCode::UNAUTHORIZED,
            "Invalid credentials".into(),
        ));
    }

    // Entitlement gate: expired accounts cannot log in. The gate only
    // reads the counter, it never decrements.
    if user.remaining_days <= 0 {
        warn!(user_id = %user.id, "login blocked, access period expired");
        return Err((
            axum::http::StatusCode::UNAUTHORIZED,
            "Access period has expired; contact your administrator".into(),
        ));
    }

    if let Err(e) = User::touch_last_login(&state.db, user.id).await {
        error!(error = %e, user_id = %user.id, "touch_last_login failed");
        return Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
    }

    info!(user_id = %user.id, username = %user.username, "user logged in");
    issue_tokens(&state, user)
}

#[instrument(skip(state, payload))]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<AuthResponse>, (axum::http::StatusCode, String)> {
    let keys = JwtKeys::from_ref(&state);
    let claims = keys
        .verify_refresh(&payload.refresh_token)
        .map_err(|e| (axum::http::StatusCode::UNAUTHORIZED, format!("{}", e)))?;

    let user = User::find_by_id(&state.db, claims.sub)
        .await
        .ok()
        .flatten()
        .ok_or((
            axum::http::StatusCode::UNAUTHORIZED,
            "User not found".to_string(),
        ))?;

    issue_tokens(&state, user)
}

/// GET /me. Runs the lazy entitlement check synchronously before the
/// response is built, so the returned `remaining_days` already reflects a
/// decrement applied by this very request.
#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ProfileResponse>, (axum::http::StatusCode, String)> {
    let now = OffsetDateTime::now_utc();
    if let Err(e) = entitlement::services::lazy_check(state.entitlements.as_ref(), user_id, now)
        .await
    {
        return Err(match e {
            StoreError::NotFound(_) => {
                warn!(user_id = %user_id, "profile fetch for missing user");
                (axum::http::StatusCode::NOT_FOUND, "User not found".into())
            }
            StoreError::Unavailable(e) => {
                error!(error = %e, user_id = %user_id, "lazy entitlement check failed");
                (
                    axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                    "Entitlement store unavailable".into(),
                )
            }
        });
    }

    let user = match User::find_by_id(&state.db, user_id).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            warn!(user_id = %user_id, "user row vanished after lazy check");
            return Err((axum::http::StatusCode::NOT_FOUND, "User not found".into()));
        }
        Err(e) => {
            error!(error = %e, user_id = %user_id, "find_by_id failed");
            return Err((axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()));
        }
    };

    Ok(Json(ProfileResponse {
        id: user.id,
        username: user.username,
        email: user.email,
        phone_number: user.phone_number,
        remaining_days: user.remaining_days,
        role: user.role,
        created_at: user.created_at,
        last_login_at: user.last_login_at,
    }))
}

fn issue_tokens(
    state: &AppState,
    user: User,
) -> Result<Json<AuthResponse>, (axum::http::StatusCode, String)> {
    let keys = JwtKeys::from_ref(state);
    let access_token = keys
        .sign_access(user.id, &user.role)
        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let refresh_token = keys
        .sign_refresh(user.id, &user.role)
        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(AuthResponse {
        access_token,
        refresh_token,
        user: PublicUser {
            id: user.id,
            username: user.username,
            email: user.email,
            remaining_days: user.remaining_days,
            role: user.role,
        },
    }))
}

#[cfg(test)]
mod me_tests {
    use super::*;

    #[test]
    fn profile_response_serializes_remaining_days() {
        let response = ProfileResponse {
            id: uuid::Uuid::new_v4(),
            username: "tester".to_string(),
            email: "test@example.com".to_string(),
            phone_number: "+905551234567".to_string(),
            remaining_days: 29,
            role: "user".to_string(),
            created_at: OffsetDateTime::now_utc(),
            last_login_at: None,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("test@example.com"));
        assert!(json.contains("\"remaining_days\":29"));
        assert!(json.contains("\"last_login_at\":null"));
    }
}
