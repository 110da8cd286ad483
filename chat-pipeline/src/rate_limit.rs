use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{
    error::AppError,
    storage::{db::SurrealDbClient, types::message::Message},
};

/// Outcome of one quota check, also the source of the rate-limit response
/// headers. `remaining` already accounts for the turn being decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset: DateTime<Utc>,
}

impl QuotaDecision {
    /// Decision used when no check ran: anonymous turns and fail-open after
    /// a checker error. Reports the full ceiling as remaining.
    pub fn open(limit: u32, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset: now + window,
        }
    }
}

#[async_trait]
pub trait TurnQuota: Send + Sync {
    async fn check(&self, user_id: &str) -> Result<QuotaDecision, AppError>;
    fn ceiling(&self) -> u32;
    fn window(&self) -> Duration;
}

/// Counts a user's recent messages in the shared store, so the window spans
/// every instance serving that user rather than one process's memory.
pub struct SlidingWindowQuota {
    db: Arc<SurrealDbClient>,
    limit: u32,
    window: Duration,
}

impl SlidingWindowQuota {
    pub fn new(db: Arc<SurrealDbClient>, limit: u32, window_secs: u64) -> Self {
        Self {
            db,
            limit,
            window: Duration::seconds(window_secs.try_into().unwrap_or(i64::MAX)),
        }
    }
}

#[async_trait]
impl TurnQuota for SlidingWindowQuota {
    async fn check(&self, user_id: &str) -> Result<QuotaDecision, AppError> {
        let now = Utc::now();
        let cutoff = now - self.window;
        let turns =
            Message::user_turns_since(&self.db, user_id, cutoff, self.limit).await?;

        let used = turns.len() as u32;
        let reset = turns
            .first()
            .map_or(now + self.window, |oldest| *oldest + self.window);

        if used >= self.limit {
            Ok(QuotaDecision {
                allowed: false,
                limit: self.limit,
                remaining: 0,
                reset,
            })
        } else {
            Ok(QuotaDecision {
                allowed: true,
                limit: self.limit,
                remaining: self.limit - used - 1,
                reset,
            })
        }
    }

    fn ceiling(&self) -> u32 {
        self.limit
    }

    fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn seed_user_message(db: &SurrealDbClient, user_id: &str, age_secs: i64) {
        let mut message = Message::user(
            "conv-1".to_string(),
            Some(user_id.to_string()),
            "hello".to_string(),
        );
        message.created_at = Utc::now() - Duration::seconds(age_secs);
        db.store_item(message).await.expect("Failed to store message");
    }

    async fn test_db() -> Arc<SurrealDbClient> {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        Arc::new(
            SurrealDbClient::memory(namespace, database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        )
    }

    #[tokio::test]
    async fn test_fresh_user_is_allowed_with_full_window() {
        let db = test_db().await;
        let quota = SlidingWindowQuota::new(Arc::clone(&db), 5, 60);

        let decision = quota.check("user-1").await.expect("Check failed");
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_remaining_shrinks_with_recent_messages() {
        let db = test_db().await;
        seed_user_message(&db, "user-1", 30).await;
        seed_user_message(&db, "user-1", 20).await;
        seed_user_message(&db, "user-1", 10).await;
        // Another user's traffic does not count against this window.
        seed_user_message(&db, "user-2", 10).await;

        let quota = SlidingWindowQuota::new(Arc::clone(&db), 5, 60);
        let decision = quota.check("user-1").await.expect("Check failed");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
    }

    #[tokio::test]
    async fn test_full_window_blocks_with_reset_time() {
        let db = test_db().await;
        for age in [50, 40, 30, 20, 10] {
            seed_user_message(&db, "user-1", age).await;
        }

        let quota = SlidingWindowQuota::new(Arc::clone(&db), 5, 60);
        let decision = quota.check("user-1").await.expect("Check failed");
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        // Oldest message was ~50s ago, so the window frees up in ~10s.
        let until_reset = decision.reset - Utc::now();
        assert!(until_reset <= Duration::seconds(11));
        assert!(until_reset > Duration::seconds(5));
    }

    #[tokio::test]
    async fn test_messages_outside_window_do_not_count() {
        let db = test_db().await;
        for age in [600, 500, 400, 300, 200] {
            seed_user_message(&db, "user-1", age).await;
        }
        seed_user_message(&db, "user-1", 10).await;

        let quota = SlidingWindowQuota::new(Arc::clone(&db), 5, 60);
        let decision = quota.check("user-1").await.expect("Check failed");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3);
    }
}
