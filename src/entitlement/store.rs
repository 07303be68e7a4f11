use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// The per-user access countdown state: how many whole days of access are
/// left, and when the lazy path last took one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct UserEntitlement {
    pub user_id: Uuid,
    pub remaining_days: i32,
    pub last_decrement_at: Option<OffsetDateTime>,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("user {0} not found")]
    NotFound(Uuid),
    #[error("entitlement store unavailable")]
    Unavailable(#[from] sqlx::Error),
}

/// Durable access to entitlement records. The coordinator never caches
/// these; every check re-reads through this trait.
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Every user still holding remaining days, for the daily sweep.
    /// Ordering is not significant.
    async fn list_with_remaining(&self) -> Result<Vec<UserEntitlement>, StoreError>;

    async fn get(&self, user_id: Uuid) -> Result<UserEntitlement, StoreError>;

    /// Persist a decremented counter. `new_last_decrement_at = None` leaves
    /// the stored timestamp untouched (the sweep path never writes it).
    async fn apply_decrement(
        &self,
        user_id: Uuid,
        new_remaining: i32,
        new_last_decrement_at: Option<OffsetDateTime>,
    ) -> Result<(), StoreError>;
}
