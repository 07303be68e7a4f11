use std::sync::Arc;
use std::time::Duration;

use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SweepConfig;

use super::store::{EntitlementStore, StoreError, UserEntitlement};

/// Rolling wall-clock window for the per-request lazy decrement. Distinct
/// from the sweep's midnight-aligned cadence; the two are not reconciled.
const LAZY_WINDOW: TimeDuration = TimeDuration::hours(24);

/// Outcome of one lazy per-access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyCheck {
    pub entitlement: UserEntitlement,
    pub decremented: bool,
}

/// Per-request decrement evaluation, run synchronously while serving a
/// profile fetch. Takes one remaining day when the last lazy decrement is
/// absent or at least 24 hours old, and records the instant it did so.
/// Exhausted users (zero days left) are a normal no-op, not an error.
pub async fn lazy_check(
    store: &dyn EntitlementStore,
    user_id: Uuid,
    now: OffsetDateTime,
) -> Result<LazyCheck, StoreError> {
    let current = store.get(user_id).await?;

    if current.remaining_days <= 0 {
        return Ok(LazyCheck {
            entitlement: current,
            decremented: false,
        });
    }

    let due = match current.last_decrement_at {
        None => true,
        Some(last) => now - last >= LAZY_WINDOW,
    };
    if !due {
        return Ok(LazyCheck {
            entitlement: current,
            decremented: false,
        });
    }

    let updated = UserEntitlement {
        user_id,
        remaining_days: current.remaining_days - 1,
        last_decrement_at: Some(now),
    };
    store
        .apply_decrement(user_id, updated.remaining_days, Some(now))
        .await?;
    debug!(%user_id, remaining_days = updated.remaining_days, "lazy decrement applied");

    Ok(LazyCheck {
        entitlement: updated,
        decremented: true,
    })
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub eligible: usize,
    pub decremented: usize,
    pub failed: usize,
}

/// One sweep fire: decrement every user with days left by exactly one.
/// The sweep leaves `last_decrement_at` alone; only the lazy path owns that
/// timestamp. A failed write for one user is logged and skipped; a failed
/// listing aborts the whole cycle and the caller waits for the next fire.
pub async fn run_sweep(store: &dyn EntitlementStore) -> Result<SweepReport, StoreError> {
    let users = store.list_with_remaining().await?;
    let mut report = SweepReport {
        eligible: users.len(),
        ..Default::default()
    };

    for user in users {
        let new_remaining = (user.remaining_days - 1).max(0);
        match store.apply_decrement(user.user_id, new_remaining, None).await {
            Ok(()) => report.decremented += 1,
            Err(e) => {
                warn!(user_id = %user.user_id, error = %e, "sweep decrement failed; skipping user");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

/// Delay from `now` until the next sweep fire: the next midnight plus the
/// configured offset, clamped to a minimum so a clock anomaly can never
/// produce a tight firing loop.
pub fn next_sweep_delay(now: OffsetDateTime, cfg: &SweepConfig) -> Duration {
    clamp_delay(next_fire_time(now, cfg) - now, cfg)
}

fn next_fire_time(now: OffsetDateTime, cfg: &SweepConfig) -> OffsetDateTime {
    let next_midnight = match now.date().next_day() {
        Some(day) => day.midnight().assume_offset(now.offset()),
        // Only reachable at the calendar's far end.
        None => now,
    };
    next_midnight + TimeDuration::minutes(cfg.offset_minutes)
}

fn clamp_delay(delay: TimeDuration, cfg: &SweepConfig) -> Duration {
    let min = Duration::from_secs(cfg.min_clamp_secs);
    if delay <= TimeDuration::ZERO {
        return min;
    }
    Duration::try_from(delay).unwrap_or(min).max(min)
}

fn local_now() -> OffsetDateTime {
    // Falls back to UTC when the local offset cannot be determined, which
    // is the common case once the runtime has spawned threads.
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

/// Daily sweep loop, one instance per process, spawned at boot. Sleeps
/// until the next fire time, runs the sweep to completion, then sleeps
/// again; exits at the next sleep boundary once `shutdown` flips.
pub async fn sweep_loop(
    store: Arc<dyn EntitlementStore>,
    cfg: SweepConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let delay = next_sweep_delay(local_now(), &cfg);
        debug!(delay_secs = delay.as_secs(), "sweep sleeping until next fire");

        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                match run_sweep(store.as_ref()).await {
                    Ok(report) => info!(
                        eligible = report.eligible,
                        decremented = report.decremented,
                        failed = report.failed,
                        "daily sweep finished"
                    ),
                    Err(e) => {
                        error!(error = %e, "daily sweep could not list users; retrying at next fire");
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("sweep loop stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use time::macros::datetime;

    use async_trait::async_trait;

    /// In-memory store double mirroring the Postgres store's guarantees,
    /// with per-user write-failure injection for fault-isolation tests.
    #[derive(Default)]
    struct MemStore {
        records: Mutex<HashMap<Uuid, UserEntitlement>>,
        fail_writes_for: Mutex<HashSet<Uuid>>,
        fail_listing: Mutex<bool>,
        writes: AtomicUsize,
    }

    impl MemStore {
        fn insert(&self, remaining_days: i32, last_decrement_at: Option<OffsetDateTime>) -> Uuid {
            let user_id = Uuid::new_v4();
            self.records.lock().unwrap().insert(
                user_id,
                UserEntitlement {
                    user_id,
                    remaining_days,
                    last_decrement_at,
                },
            );
            user_id
        }

        fn record(&self, user_id: Uuid) -> UserEntitlement {
            self.records.lock().unwrap().get(&user_id).unwrap().clone()
        }

        fn fail_writes(&self, user_id: Uuid) {
            self.fail_writes_for.lock().unwrap().insert(user_id);
        }

        fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EntitlementStore for MemStore {
        async fn list_with_remaining(&self) -> Result<Vec<UserEntitlement>, StoreError> {
            if *self.fail_listing.lock().unwrap() {
                return Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut));
            }
            Ok(self
                .records
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.remaining_days > 0)
                .cloned()
                .collect())
        }

        async fn get(&self, user_id: Uuid) -> Result<UserEntitlement, StoreError> {
            self.records
                .lock()
                .unwrap()
                .get(&user_id)
                .cloned()
                .ok_or(StoreError::NotFound(user_id))
        }

        async fn apply_decrement(
            &self,
            user_id: Uuid,
            new_remaining: i32,
            new_last_decrement_at: Option<OffsetDateTime>,
        ) -> Result<(), StoreError> {
            if self.fail_writes_for.lock().unwrap().contains(&user_id) {
                return Err(StoreError::Unavailable(sqlx::Error::PoolTimedOut));
            }
            let mut records = self.records.lock().unwrap();
            let record = records
                .get_mut(&user_id)
                .ok_or(StoreError::NotFound(user_id))?;
            record.remaining_days = new_remaining.max(0);
            if let Some(at) = new_last_decrement_at {
                record.last_decrement_at = Some(at);
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_sweep_config() -> SweepConfig {
        SweepConfig {
            offset_minutes: 5,
            min_clamp_secs: 60,
        }
    }

    const T0: OffsetDateTime = datetime!(2025-08-01 12:00:00 UTC);

    #[tokio::test]
    async fn remaining_days_never_go_negative() {
        let store = MemStore::default();
        let user = store.insert(2, None);

        for round in 0..5i64 {
            let report = run_sweep(&store).await.unwrap();
            assert!(report.failed == 0);
            assert!(store.record(user).remaining_days >= 0);

            let now = T0 + TimeDuration::hours(25 * (round + 1));
            let check = lazy_check(&store, user, now).await.unwrap();
            assert!(check.entitlement.remaining_days >= 0);
        }

        assert_eq!(store.record(user).remaining_days, 0);
    }

    #[tokio::test]
    async fn sweep_decrements_each_eligible_user_exactly_once() {
        let empty = MemStore::default();
        let report = run_sweep(&empty).await.unwrap();
        assert_eq!(report, SweepReport::default());

        let store = MemStore::default();
        let users: Vec<(Uuid, i32)> = (1..=5).map(|d| (store.insert(d * 3, None), d * 3)).collect();

        let report = run_sweep(&store).await.unwrap();
        assert_eq!(report.eligible, 5);
        assert_eq!(report.decremented, 5);
        assert_eq!(report.failed, 0);
        for (user, before) in users {
            assert_eq!(store.record(user).remaining_days, before - 1);
        }
    }

    #[tokio::test]
    async fn sweep_skips_exhausted_users() {
        let store = MemStore::default();
        let exhausted = store.insert(0, Some(T0));
        let active = store.insert(7, None);

        let report = run_sweep(&store).await.unwrap();
        assert_eq!(report.eligible, 1);
        assert_eq!(store.record(exhausted).remaining_days, 0);
        assert_eq!(store.record(active).remaining_days, 6);
    }

    #[tokio::test]
    async fn sweep_does_not_touch_last_decrement_timestamp() {
        let store = MemStore::default();
        let user = store.insert(10, Some(T0));

        run_sweep(&store).await.unwrap();

        let record = store.record(user);
        assert_eq!(record.remaining_days, 9);
        assert_eq!(record.last_decrement_at, Some(T0));
    }

    #[tokio::test]
    async fn lazy_check_respects_the_24h_boundary() {
        let store = MemStore::default();

        let just_inside = store.insert(10, Some(T0 - TimeDuration::hours(23) - TimeDuration::minutes(59)));
        let check = lazy_check(&store, just_inside, T0).await.unwrap();
        assert!(!check.decremented);
        assert_eq!(store.record(just_inside).remaining_days, 10);

        let at_boundary = store.insert(10, Some(T0 - TimeDuration::hours(24)));
        let check = lazy_check(&store, at_boundary, T0).await.unwrap();
        assert!(check.decremented);
        let record = store.record(at_boundary);
        assert_eq!(record.remaining_days, 9);
        assert_eq!(record.last_decrement_at, Some(T0));

        let never_decremented = store.insert(10, None);
        let check = lazy_check(&store, never_decremented, T0).await.unwrap();
        assert!(check.decremented);
        assert_eq!(store.record(never_decremented).last_decrement_at, Some(T0));
    }

    #[tokio::test]
    async fn lazy_check_is_a_silent_noop_at_zero() {
        let store = MemStore::default();
        let user = store.insert(0, Some(T0 - TimeDuration::hours(48)));

        let check = lazy_check(&store, user, T0).await.unwrap();
        assert!(!check.decremented);
        assert_eq!(check.entitlement.remaining_days, 0);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn lazy_check_reports_missing_users() {
        let store = MemStore::default();
        let err = lazy_check(&store, Uuid::new_v4(), T0).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn non_positive_delays_clamp_to_the_minimum() {
        let cfg = test_sweep_config();
        let min = Duration::from_secs(cfg.min_clamp_secs);
        assert_eq!(clamp_delay(TimeDuration::seconds(-5), &cfg), min);
        assert_eq!(clamp_delay(TimeDuration::ZERO, &cfg), min);
        assert_eq!(clamp_delay(TimeDuration::seconds(30), &cfg), min);
        assert_eq!(
            clamp_delay(TimeDuration::hours(3), &cfg),
            Duration::from_secs(3 * 3600)
        );
    }

    #[test]
    fn next_fire_is_the_coming_midnight_plus_offset() {
        let cfg = test_sweep_config();

        let late_evening = datetime!(2025-08-01 23:59:00 UTC);
        assert_eq!(
            next_sweep_delay(late_evening, &cfg),
            Duration::from_secs(6 * 60)
        );

        // Just past a fire: the next one is a full day out.
        let just_fired = datetime!(2025-08-01 00:05:00 UTC);
        assert_eq!(
            next_sweep_delay(just_fired, &cfg),
            Duration::from_secs(24 * 3600)
        );
    }

    #[tokio::test]
    async fn sweep_write_failure_for_one_user_does_not_abort_the_rest() {
        let store = MemStore::default();
        let user1 = store.insert(5, None);
        let user2 = store.insert(5, None);
        let user3 = store.insert(5, None);
        store.fail_writes(user2);

        let report = run_sweep(&store).await.unwrap();
        assert_eq!(report.eligible, 3);
        assert_eq!(report.decremented, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(store.record(user1).remaining_days, 4);
        assert_eq!(store.record(user2).remaining_days, 5);
        assert_eq!(store.record(user3).remaining_days, 4);
    }

    #[tokio::test]
    async fn listing_failure_aborts_the_cycle() {
        let store = MemStore::default();
        store.insert(5, None);
        *store.fail_listing.lock().unwrap() = true;

        let err = run_sweep(&store).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.write_count(), 0);
    }

    /// The full two-clock scenario: a fresh user loses days to both the
    /// lazy path and the sweep, including the expected double decrement
    /// inside one human day.
    #[tokio::test]
    async fn both_triggers_interleave_as_designed() {
        let store = MemStore::default();
        let user = store.insert(30, None);

        // First profile fetch takes a day and stamps the timestamp.
        let check = lazy_check(&store, user, T0).await.unwrap();
        assert!(check.decremented);
        assert_eq!(check.entitlement.remaining_days, 29);

        // Ten hours later: inside the rolling window, untouched.
        let check = lazy_check(&store, user, T0 + TimeDuration::hours(10))
            .await
            .unwrap();
        assert!(!check.decremented);
        assert_eq!(check.entitlement.remaining_days, 29);

        // The nightly sweep fires in between, leaving the timestamp alone.
        run_sweep(&store).await.unwrap();
        let record = store.record(user);
        assert_eq!(record.remaining_days, 28);
        assert_eq!(record.last_decrement_at, Some(T0));

        // 25h after the first fetch the rolling window has elapsed again.
        let check = lazy_check(&store, user, T0 + TimeDuration::hours(25))
            .await
            .unwrap();
        assert!(check.decremented);
        assert_eq!(check.entitlement.remaining_days, 27);
        assert_eq!(
            store.record(user).last_decrement_at,
            Some(T0 + TimeDuration::hours(25))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_exits_on_shutdown() {
        let store = Arc::new(MemStore::default());
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        // Shutdown was signalled before the first sleep; the loop must
        // return without firing.
        sweep_loop(store.clone(), test_sweep_config(), rx).await;
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_loop_fires_once_per_day() {
        let store = Arc::new(MemStore::default());
        let user = store.insert(30, None);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(sweep_loop(store.clone(), test_sweep_config(), rx));

        // Paused time auto-advances through the loop's sleep. The first
        // delay is at most 24h05m and every later one exceeds 24h, so this
        // window covers exactly one fire.
        tokio::time::sleep(Duration::from_secs(24 * 3600 + 320)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.record(user).remaining_days, 29);
    }
}
