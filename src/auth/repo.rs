use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

const USER_COLUMNS: &str = "id, username, email, phone_number, password_hash, role, \
     remaining_days, last_decrement_at, created_at, last_login_at";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub phone_number: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    pub remaining_days: i32,
    pub last_decrement_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_login_at: Option<OffsetDateTime>,
}

/// Which unique field an existing account already occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakenField {
    Username,
    Email,
    Phone,
}

impl User {
    pub async fn find_by_username(db: &PgPool, username: &str) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(db)
        .await?;
        Ok(user)
    }

    pub async fn find_by_id(db: &PgPool, id: Uuid) -> anyhow::Result<Option<User>> {
        let user =
            sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
                .bind(id)
                .fetch_optional(db)
                .await?;
        Ok(user)
    }

    /// Check whether any of the unique registration fields is taken,
    /// reporting which one so the handler can name it.
    pub async fn find_taken(
        db: &PgPool,
        username: &str,
        email: &str,
        phone_number: &str,
    ) -> anyhow::Result<Option<TakenField>> {
        let existing = sqlx::query_as::<_, (String, String, String)>(
            r#"
            SELECT username, email, phone_number
            FROM users
            WHERE username = $1 OR email = $2 OR phone_number = $3
            LIMIT 1
            "#,
        )
        .bind(username)
        .bind(email)
        .bind(phone_number)
        .fetch_optional(db)
        .await?;

        Ok(existing.map(|(u, e, _)| {
            if u == username {
                TakenField::Username
            } else if e == email {
                TakenField::Email
            } else {
                TakenField::Phone
            }
        }))
    }

    /// Create a new user with hashed password. The very first account
    /// becomes the admin, matching the back-office bootstrap flow.
    pub async fn create(
        db: &PgPool,
        username: &str,
        email: &str,
        phone_number: &str,
        password_hash: &str,
    ) -> anyhow::Result<User> {
        let any_users =
            sqlx::query_scalar::<_, bool>(r#"SELECT EXISTS (SELECT 1 FROM users)"#)
                .fetch_one(db)
                .await?;
        let role = if any_users { "user" } else { "admin" };

        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (username, email, phone_number, password_hash, role)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(username)
        .bind(email)
        .bind(phone_number)
        .bind(password_hash)
        .bind(role)
        .fetch_one(db)
        .await?;
        Ok(user)
    }

    pub async fn touch_last_login(db: &PgPool, id: Uuid) -> anyhow::Result<()> {
        sqlx::query(r#"UPDATE users SET last_login_at = now() WHERE id = $1"#)
            .bind(id)
            .execute(db)
            .await?;
        Ok(())
    }
}
