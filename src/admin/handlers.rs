use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::{auth::services::AdminUser, state::AppState};

use super::dto::{AdminUserRow, SetRemainingDaysRequest, SetRemainingDaysResponse};

pub fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/admin/users", get(list_users))
        .route("/admin/users/:id/remaining-days", put(set_remaining_days))
}

/// The fixed set of entitlement packages an administrator may grant.
fn is_permitted_remaining(days: i32) -> bool {
    matches!(days, 15 | 30 | 90)
}

#[instrument(skip(state))]
pub async fn list_users(
    State(state): State<AppState>,
    AdminUser(_admin_id): AdminUser,
) -> Result<Json<Vec<AdminUserRow>>, (StatusCode, String)> {
    let rows = sqlx::query_as::<_, AdminUserRow>(
        r#"
        SELECT id, username, email, phone_number, role, remaining_days,
               last_decrement_at, created_at, last_login_at
        FROM users
        ORDER BY created_at DESC
        "#,
    )
    .fetch_all(&state.db)
    .await
    .map_err(|e| {
        error!(error = %e, "list users failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    Ok(Json(rows))
}

/// Administrative override of a user's counter. Deliberately leaves
/// `last_decrement_at` as-is; the lazy window keeps running from the last
/// lazy decrement.
#[instrument(skip(state))]
pub async fn set_remaining_days(
    State(state): State<AppState>,
    AdminUser(admin_id): AdminUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<SetRemainingDaysRequest>,
) -> Result<Json<SetRemainingDaysResponse>, (StatusCode, String)> {
    if !is_permitted_remaining(payload.remaining_days) {
        warn!(requested = payload.remaining_days, "rejected remaining-days value");
        return Err((
            StatusCode::BAD_REQUEST,
            "remaining_days must be one of 15, 30 or 90".into(),
        ));
    }

    let result = sqlx::query(r#"UPDATE users SET remaining_days = $2 WHERE id = $1"#)
        .bind(id)
        .bind(payload.remaining_days)
        .execute(&state.db)
        .await
        .map_err(|e| {
            error!(error = %e, user_id = %id, "set remaining_days failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "User not found".into()));
    }

    info!(user_id = %id, admin_id = %admin_id, remaining_days = payload.remaining_days, "remaining days overridden");
    Ok(Json(SetRemainingDaysResponse {
        id,
        remaining_days: payload.remaining_days,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_fixed_packages_are_permitted() {
        for ok in [15, 30, 90] {
            assert!(is_permitted_remaining(ok));
        }
        for bad in [0, -15, 1, 14, 31, 91, 365] {
            assert!(!is_permitted_remaining(bad));
        }
    }
}
