#![allow(clippy::module_name_repetitions)]
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(ChunkPerformance, "chunk_performance", {
    chunk_id: String,
    chatbot_id: String,
    source_id: String,
    month: u32,
    year: i32,
    usage_count: u32,
    helpful_count: u32,
    not_helpful_count: u32,
    needs_examples_count: u32,
    needs_steps_count: u32,
    needs_scripts_count: u32,
    needs_case_study_count: u32,
    copy_count: u32,
    satisfaction_rate: f64,
    chunk_text: Option<String>
});

/// Identity of one performance row: chunk and chatbot, bucketed by calendar
/// month. The record id is deterministic so every writer lands on the same
/// row without a lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PerfKey {
    pub chunk_id: String,
    pub chatbot_id: String,
    pub source_id: String,
    pub month: u32,
    pub year: i32,
}

impl PerfKey {
    pub fn new(chunk_id: &str, chatbot_id: &str, source_id: &str, at: DateTime<Utc>) -> Self {
        use chrono::Datelike;
        Self {
            chunk_id: chunk_id.to_string(),
            chatbot_id: chatbot_id.to_string(),
            source_id: source_id.to_string(),
            month: at.month(),
            year: at.year(),
        }
    }

    pub fn record_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.chunk_id, self.chatbot_id, self.month, self.year
        )
    }
}

/// Counter increments to fold into a row. All deltas are non-negative;
/// counters never go down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PerfDelta {
    pub usage: u32,
    pub helpful: u32,
    pub not_helpful: u32,
    pub needs_examples: u32,
    pub needs_steps: u32,
    pub needs_scripts: u32,
    pub needs_case_study: u32,
    pub copy: u32,
}

impl PerfDelta {
    pub fn usage_only() -> Self {
        Self {
            usage: 1,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ChunkPerformance {
    /// Fold a delta into the row in one UPSERT, creating it if absent.
    ///
    /// The satisfaction rate is computed inside the same statement from
    /// (stored value ?? 0) + delta, so counters and rate always move
    /// together; concurrent writers on the same key serialize at the store
    /// and conflicting attempts are retried with backoff.
    pub async fn apply_delta(
        db: &SurrealDbClient,
        key: &PerfKey,
        delta: &PerfDelta,
        chunk_text: Option<String>,
    ) -> Result<Self, AppError> {
        let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(5);
        Retry::spawn(strategy, || {
            Self::apply_delta_once(db, key, delta, chunk_text.clone())
        })
        .await
    }

    async fn apply_delta_once(
        db: &SurrealDbClient,
        key: &PerfKey,
        delta: &PerfDelta,
        chunk_text: Option<String>,
    ) -> Result<Self, AppError> {
        let mut response = db
            .query(
                "UPSERT type::thing('chunk_performance', $key) SET \
                 satisfaction_rate = (((helpful_count ?? 0) + $helpful) * 1.0) / math::max([1, (helpful_count ?? 0) + $helpful + (not_helpful_count ?? 0) + $not_helpful]), \
                 usage_count = (usage_count ?? 0) + $usage, \
                 helpful_count = (helpful_count ?? 0) + $helpful, \
                 not_helpful_count = (not_helpful_count ?? 0) + $not_helpful, \
                 needs_examples_count = (needs_examples_count ?? 0) + $needs_examples, \
                 needs_steps_count = (needs_steps_count ?? 0) + $needs_steps, \
                 needs_scripts_count = (needs_scripts_count ?? 0) + $needs_scripts, \
                 needs_case_study_count = (needs_case_study_count ?? 0) + $needs_case_study, \
                 copy_count = (copy_count ?? 0) + $copy, \
                 chunk_id = $chunk_id, \
                 chatbot_id = $chatbot_id, \
                 source_id = $source_id, \
                 month = $month, \
                 year = $year, \
                 chunk_text = chunk_text ?? $chunk_text, \
                 created_at = created_at ?? $now, \
                 updated_at = $now \
                 RETURN AFTER",
            )
            .bind(("key", key.record_key()))
            .bind(("usage", i64::from(delta.usage)))
            .bind(("helpful", i64::from(delta.helpful)))
            .bind(("not_helpful", i64::from(delta.not_helpful)))
            .bind(("needs_examples", i64::from(delta.needs_examples)))
            .bind(("needs_steps", i64::from(delta.needs_steps)))
            .bind(("needs_scripts", i64::from(delta.needs_scripts)))
            .bind(("needs_case_study", i64::from(delta.needs_case_study)))
            .bind(("copy", i64::from(delta.copy)))
            .bind(("chunk_id", key.chunk_id.clone()))
            .bind(("chatbot_id", key.chatbot_id.clone()))
            .bind(("source_id", key.source_id.clone()))
            .bind(("month", i64::from(key.month)))
            .bind(("year", i64::from(key.year)))
            .bind(("chunk_text", chunk_text))
            .bind(("now", surrealdb::sql::Datetime::from(Utc::now())))
            .await?;

        let updated: Option<Self> = response.take(0)?;
        updated.ok_or_else(|| {
            AppError::InternalError("chunk_performance upsert returned no row".to_string())
        })
    }

    pub async fn exists(db: &SurrealDbClient, key: &PerfKey) -> Result<bool, AppError> {
        let row: Option<Self> = db.get_item(&key.record_key()).await?;
        Ok(row.is_some())
    }

    /// Most recently touched row for a chunk, any month. The aggregation job
    /// uses it to recover source and chatbot ids for bare chunk references.
    pub async fn latest_for_chunk(
        db: &SurrealDbClient,
        chunk_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) WHERE chunk_id = $chunk_id ORDER BY updated_at DESC LIMIT 1",
            )
            .bind(("table", Self::table_name()))
            .bind(("chunk_id", chunk_id.to_string()))
            .await?;
        let row: Option<Self> = response.take(0)?;
        Ok(row)
    }
}
