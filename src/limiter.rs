//! Attempt Limiter: a per-key cooldown state machine preventing repeated
//! re-analysis of the same artifact from draining the inference quota.
//!
//! States per `(user, key)`: Fresh → Attempted(n) → Blocked{until} →
//! (cooldown elapses) → Fresh. The transitions are pure functions over an
//! [`AttemptState`]; the store persists the equivalent nullable-field
//! record and applies each transition inside a single transaction so two
//! concurrent requests for the same key cannot both slip through the gate.
//!
//! Two key spaces are maintained independently: the artifact content hash
//! (cross-session dedup) and the crash-signature key (per-device-report
//! dedup). States are never deleted; they decay naturally once the
//! cooldown passes and the counters reset.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// Persisted counters for one `(user, key)` pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptState {
    pub repeat_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// The explicit phase behind the nullable fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttemptPhase {
    Fresh,
    Attempted(u32),
    Blocked(DateTime<Utc>),
}

/// Limiter thresholds, from `[limiter]` config.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_attempts: u32,
    pub cooldown: Duration,
}

impl Limits {
    pub fn new(max_attempts: u32, cooldown_hours: i64) -> Self {
        Self {
            max_attempts,
            cooldown: Duration::hours(cooldown_hours),
        }
    }
}

/// Gate decision for an incoming analysis request.
#[derive(Debug, Clone, PartialEq)]
pub enum Gate {
    Allow {
        /// The cooldown elapsed and the stored counters must be reset as
        /// part of letting this request through.
        reset: bool,
    },
    Reject {
        message: String,
        retry_in: Duration,
    },
}

impl Gate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Gate::Allow { .. })
    }
}

pub fn phase_of(state: &AttemptState, now: DateTime<Utc>) -> AttemptPhase {
    if let Some(until) = state.blocked_until {
        if now < until {
            return AttemptPhase::Blocked(until);
        }
    }
    if state.repeat_attempts > 0 {
        AttemptPhase::Attempted(state.repeat_attempts)
    } else {
        AttemptPhase::Fresh
    }
}

/// Human-readable remaining wait, floored to minutes like the rest of the
/// user-facing messaging.
pub fn wait_message(remaining: Duration) -> String {
    let total_secs = remaining.num_seconds().max(0);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    if hours > 0 {
        format!("{} h {} min", hours, minutes)
    } else {
        format!("{} min", minutes)
    }
}

/// Decide whether an analysis request may proceed.
pub fn evaluate(state: &AttemptState, now: DateTime<Utc>, limits: Limits) -> Gate {
    if let Some(until) = state.blocked_until {
        if now < until {
            let remaining = until - now;
            return Gate::Reject {
                message: format!(
                    "This artifact is blocked for re-analysis. Try again in {}",
                    wait_message(remaining)
                ),
                retry_in: remaining,
            };
        }
    }

    if state.repeat_attempts >= limits.max_attempts {
        if let Some(last) = state.last_attempt_at {
            if now - last >= limits.cooldown {
                return Gate::Allow { reset: true };
            }
        }
        return Gate::Reject {
            message: format!(
                "Analysis attempt limit reached ({}). Try again in {} h",
                limits.max_attempts,
                limits.cooldown.num_hours()
            ),
            retry_in: limits.cooldown,
        };
    }

    Gate::Allow { reset: false }
}

/// Transition for a failed (no-solution) outcome.
pub fn on_failure(state: &AttemptState, now: DateTime<Utc>, limits: Limits) -> AttemptState {
    let repeat_attempts = state.repeat_attempts + 1;
    let blocked_until = if repeat_attempts >= limits.max_attempts {
        Some(now + limits.cooldown)
    } else {
        None
    };
    AttemptState {
        repeat_attempts,
        last_attempt_at: Some(now),
        blocked_until,
    }
}

/// Transition for a successful (solution-found) outcome.
pub fn on_success(_state: &AttemptState) -> AttemptState {
    AttemptState::default()
}

/// The two independently tracked key spaces.
#[derive(Debug, Clone, Copy)]
pub enum LimiterKey<'a> {
    FileHash(&'a str),
    CrashKey(&'a str),
}

impl LimiterKey<'_> {
    fn kind(&self) -> &'static str {
        match self {
            LimiterKey::FileHash(_) => "file_hash",
            LimiterKey::CrashKey(_) => "crash_key",
        }
    }

    fn value(&self) -> &str {
        match self {
            LimiterKey::FileHash(v) | LimiterKey::CrashKey(v) => v,
        }
    }
}

/// SQLite-backed store applying limiter transitions atomically per key.
pub struct AttemptStore {
    pool: SqlitePool,
    limits: Limits,
}

impl AttemptStore {
    pub fn new(pool: SqlitePool, limits: Limits) -> Self {
        Self { pool, limits }
    }

    async fn load(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
        key: &LimiterKey<'_>,
    ) -> Result<AttemptState> {
        let row = sqlx::query(
            "SELECT repeat_attempts, last_attempt_at, blocked_until
             FROM attempt_states WHERE user_id = ? AND key_kind = ? AND key = ?",
        )
        .bind(user_id)
        .bind(key.kind())
        .bind(key.value())
        .fetch_optional(&mut **tx)
        .await?;

        Ok(match row {
            Some(row) => {
                let attempts: i64 = row.get("repeat_attempts");
                let last: Option<i64> = row.get("last_attempt_at");
                let blocked: Option<i64> = row.get("blocked_until");
                AttemptState {
                    repeat_attempts: attempts.max(0) as u32,
                    last_attempt_at: last.and_then(|t| DateTime::from_timestamp(t, 0)),
                    blocked_until: blocked.and_then(|t| DateTime::from_timestamp(t, 0)),
                }
            }
            None => AttemptState::default(),
        })
    }

    async fn save(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        user_id: i64,
        key: &LimiterKey<'_>,
        state: &AttemptState,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO attempt_states (user_id, key_kind, key, repeat_attempts, last_attempt_at, blocked_until)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, key_kind, key) DO UPDATE SET
                repeat_attempts = excluded.repeat_attempts,
                last_attempt_at = excluded.last_attempt_at,
                blocked_until = excluded.blocked_until
            "#,
        )
        .bind(user_id)
        .bind(key.kind())
        .bind(key.value())
        .bind(state.repeat_attempts as i64)
        .bind(state.last_attempt_at.map(|t| t.timestamp()))
        .bind(state.blocked_until.map(|t| t.timestamp()))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Gate an incoming request, applying the lazy cooldown reset in the
    /// same transaction when it fires.
    pub async fn check(&self, user_id: i64, key: &LimiterKey<'_>) -> Result<Gate> {
        let mut tx = self.pool.begin().await?;
        let state = Self::load(&mut tx, user_id, key).await?;
        let gate = evaluate(&state, Utc::now(), self.limits);
        if let Gate::Allow { reset: true } = gate {
            debug!(user_id, kind = key.kind(), "cooldown elapsed, resetting counters");
            Self::save(&mut tx, user_id, key, &AttemptState::default()).await?;
        }
        tx.commit().await?;
        Ok(gate)
    }

    pub async fn record_failure(&self, user_id: i64, key: &LimiterKey<'_>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let state = Self::load(&mut tx, user_id, key).await?;
        let next = on_failure(&state, Utc::now(), self.limits);
        Self::save(&mut tx, user_id, key, &next).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_success(&self, user_id: i64, key: &LimiterKey<'_>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let state = Self::load(&mut tx, user_id, key).await?;
        let next = on_success(&state);
        Self::save(&mut tx, user_id, key, &next).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits::new(2, 3)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn fresh_state_allows() {
        let state = AttemptState::default();
        assert_eq!(phase_of(&state, at(0)), AttemptPhase::Fresh);
        assert_eq!(evaluate(&state, at(0), limits()), Gate::Allow { reset: false });
    }

    #[test]
    fn two_failures_block_for_three_hours() {
        let mut state = AttemptState::default();

        state = on_failure(&state, at(0), limits());
        assert_eq!(state.repeat_attempts, 1);
        assert!(state.blocked_until.is_none());
        assert!(evaluate(&state, at(60), limits()).is_allowed());

        state = on_failure(&state, at(60), limits());
        assert_eq!(state.repeat_attempts, 2);
        // Block lands at the failure time plus the cooldown.
        assert_eq!(state.blocked_until, Some(at(60) + Duration::hours(3)));
        assert_eq!(phase_of(&state, at(120)), AttemptPhase::Blocked(at(60) + Duration::hours(3)));

        // Third attempt shortly after is rejected with the remaining wait.
        match evaluate(&state, at(120), limits()) {
            Gate::Reject { message, retry_in } => {
                assert!(message.contains("2 h 59 min"), "message: {}", message);
                assert_eq!(retry_in, Duration::hours(3) - Duration::seconds(60));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn cooldown_elapse_resets_and_allows() {
        let mut state = AttemptState::default();
        state = on_failure(&state, at(0), limits());
        state = on_failure(&state, at(60), limits());

        let after = at(60) + Duration::hours(3) + Duration::seconds(1);
        assert_eq!(evaluate(&state, after, limits()), Gate::Allow { reset: true });
        // The reset leaves a Fresh state behind.
        let reset = AttemptState::default();
        assert_eq!(phase_of(&reset, after), AttemptPhase::Fresh);
        assert!(evaluate(&reset, after, limits()).is_allowed());
    }

    #[test]
    fn limit_reached_without_block_still_rejects() {
        // Counter at the limit but blocked_until unset (legacy rows).
        let state = AttemptState {
            repeat_attempts: 2,
            last_attempt_at: Some(at(0)),
            blocked_until: None,
        };
        match evaluate(&state, at(60), limits()) {
            Gate::Reject { message, .. } => assert!(message.contains("limit reached")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn success_resets_everything() {
        let mut state = AttemptState::default();
        state = on_failure(&state, at(0), limits());
        state = on_failure(&state, at(60), limits());
        let reset = on_success(&state);
        assert_eq!(reset, AttemptState::default());
        assert!(evaluate(&reset, at(120), limits()).is_allowed());
    }

    #[test]
    fn wait_message_formats() {
        assert_eq!(wait_message(Duration::minutes(45)), "45 min");
        assert_eq!(wait_message(Duration::minutes(179)), "2 h 59 min");
        assert_eq!(wait_message(Duration::hours(3)), "3 h 0 min");
        assert_eq!(wait_message(Duration::seconds(-5)), "0 min");
    }

    #[tokio::test]
    async fn store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::Config {
            db: crate::config::DbConfig {
                path: dir.path().join("triage.sqlite"),
            },
            ..crate::config::Config::minimal()
        };
        crate::migrate::run_migrations(&config).await.unwrap();
        let pool = crate::db::connect(&config).await.unwrap();
        let store = AttemptStore::new(pool, limits());
        let key = LimiterKey::FileHash("abc123");

        assert!(store.check(7, &key).await.unwrap().is_allowed());
        store.record_failure(7, &key).await.unwrap();
        assert!(store.check(7, &key).await.unwrap().is_allowed());
        store.record_failure(7, &key).await.unwrap();
        assert!(!store.check(7, &key).await.unwrap().is_allowed());

        // The crash-key space is independent.
        let crash = LimiterKey::CrashKey("abc123");
        assert!(store.check(7, &crash).await.unwrap().is_allowed());
        // So is another user.
        assert!(store.check(8, &key).await.unwrap().is_allowed());

        // Success clears the file-hash state.
        store.record_success(7, &key).await.unwrap();
        assert!(store.check(7, &key).await.unwrap().is_allowed());
    }
}
