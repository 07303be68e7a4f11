use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use super::store::{EntitlementStore, StoreError, UserEntitlement};

/// Postgres-backed entitlement store over the `users` table.
pub struct PgEntitlementStore {
    db: PgPool,
}

impl PgEntitlementStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn list_with_remaining(&self) -> Result<Vec<UserEntitlement>, StoreError> {
        let rows = sqlx::query_as::<_, UserEntitlement>(
            r#"
            SELECT id AS user_id, remaining_days, last_decrement_at
            FROM users
            WHERE remaining_days > 0
            "#,
        )
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn get(&self, user_id: Uuid) -> Result<UserEntitlement, StoreError> {
        let row = sqlx::query_as::<_, UserEntitlement>(
            r#"
            SELECT id AS user_id, remaining_days, last_decrement_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;
        row.ok_or(StoreError::NotFound(user_id))
    }

    async fn apply_decrement(
        &self,
        user_id: Uuid,
        new_remaining: i32,
        new_last_decrement_at: Option<OffsetDateTime>,
    ) -> Result<(), StoreError> {
        // Single statement, so racing callers can never drive the counter
        // negative; GREATEST backstops the floor invariant.
        let result = sqlx::query(
            r#"
            UPDATE users
            SET remaining_days = GREATEST($2, 0),
                last_decrement_at = COALESCE($3, last_decrement_at)
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(new_remaining)
        .bind(new_last_decrement_at)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(user_id));
        }
        Ok(())
    }
}
