use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// One row of the back-office user table.
#[derive(Debug, Serialize, FromRow)]
pub struct AdminUserRow {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub phone_number: String,
    pub role: String,
    pub remaining_days: i32,
    pub last_decrement_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
}

/// Body for the remaining-days override.
#[derive(Debug, Deserialize)]
pub struct SetRemainingDaysRequest {
    pub remaining_days: i32,
}

#[derive(Debug, Serialize)]
pub struct SetRemainingDaysResponse {
    pub id: Uuid,
    pub remaining_days: i32,
}
