#![allow(clippy::module_name_repetitions)]
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One retrieved passage frozen into an assistant message: what grounded the
/// reply, at what similarity, and with what attribution weight.
#[derive(Deserialize, Debug, Clone, Serialize, PartialEq)]
pub struct ContextChunk {
    pub chunk_id: String,
    pub source_id: String,
    pub source_title: String,
    pub text: String,
    pub page: Option<u32>,
    pub section: Option<String>,
    pub score: f32,
    pub weight: f64,
}

stored_object!(Message, "message", {
    conversation_id: String,
    user_id: Option<String>,
    role: MessageRole,
    content: String,
    context: Option<Vec<ContextChunk>>,
    follow_up_suggestions: Option<Vec<String>>,
    source_ids: Option<Vec<String>>
});

impl Message {
    /// A user turn never carries grounding context.
    pub fn user(conversation_id: String, user_id: Option<String>, content: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            conversation_id,
            user_id,
            role: MessageRole::User,
            content,
            context: None,
            follow_up_suggestions: None,
            source_ids: None,
        }
    }

    pub fn assistant(
        conversation_id: String,
        content: String,
        context: Option<Vec<ContextChunk>>,
        source_ids: Option<Vec<String>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            conversation_id,
            user_id: None,
            role: MessageRole::Assistant,
            content,
            context,
            follow_up_suggestions: None,
            source_ids,
        }
    }

    pub async fn for_conversation(
        db: &SurrealDbClient,
        conversation_id: &str,
    ) -> Result<Vec<Self>, AppError> {
        let messages: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table) WHERE conversation_id = $conversation_id ORDER BY created_at",
            )
            .bind(("table", Self::table_name()))
            .bind(("conversation_id", conversation_id.to_string()))
            .await?
            .take(0)?;
        Ok(messages)
    }

    pub async fn count_for_conversation(
        db: &SurrealDbClient,
        conversation_id: &str,
    ) -> Result<u32, AppError> {
        #[derive(Deserialize)]
        struct CountRow {
            count: u32,
        }

        let mut response = db
            .query(
                "SELECT count() FROM type::table($table) WHERE conversation_id = $conversation_id GROUP ALL",
            )
            .bind(("table", Self::table_name()))
            .bind(("conversation_id", conversation_id.to_string()))
            .await?;
        let row: Option<CountRow> = response.take(0)?;
        Ok(row.map_or(0, |r| r.count))
    }

    /// Creation instants of a user's own turns after `cutoff`, oldest first.
    /// Capped at `limit` rows, which is all a quota check needs to see.
    pub async fn user_turns_since(
        db: &SurrealDbClient,
        user_id: &str,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<DateTime<Utc>>, AppError> {
        #[derive(Deserialize)]
        struct CreatedAtRow {
            #[serde(deserialize_with = "deserialize_datetime")]
            created_at: DateTime<Utc>,
        }

        let mut response = db
            .query(
                "SELECT created_at FROM type::table($table) WHERE user_id = $user_id AND role = 'user' AND created_at > $cutoff ORDER BY created_at ASC LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("user_id", user_id.to_string()))
            .bind(("cutoff", surrealdb::sql::Datetime::from(cutoff)))
            .bind(("limit", i64::from(limit)))
            .await?;
        let rows: Vec<CreatedAtRow> = response.take(0)?;
        Ok(rows.into_iter().map(|row| row.created_at).collect())
    }

    /// Newest-first bounded scan of assistant messages that carry context.
    /// The aggregation job uses this as its lossy source-id fallback.
    pub async fn recent_assistant_contexts(
        db: &SurrealDbClient,
        limit: u32,
    ) -> Result<Vec<Self>, AppError> {
        let messages: Vec<Self> = db
            .query(
                "SELECT * FROM type::table($table) WHERE role = 'assistant' AND context != NONE ORDER BY created_at DESC LIMIT $limit",
            )
            .bind(("table", Self::table_name()))
            .bind(("limit", i64::from(limit)))
            .await?
            .take(0)?;
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_context() -> Vec<ContextChunk> {
        vec![ContextChunk {
            chunk_id: "chunk-1".to_string(),
            source_id: "source-1".to_string(),
            source_title: "Handbook".to_string(),
            text: "Turn it off and on again.".to_string(),
            page: Some(3),
            section: None,
            score: 0.91,
            weight: 1.0,
        }]
    }

    #[tokio::test]
    async fn test_message_persistence_roundtrip() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let message = Message::assistant(
            "conv-1".to_string(),
            "Answer text".to_string(),
            Some(sample_context()),
            Some(vec!["source-1".to_string()]),
        );
        let message_id = message.id.clone();

        db.store_item(message.clone())
            .await
            .expect("Failed to store message");

        let retrieved: Message = db
            .get_item(&message_id)
            .await
            .expect("Failed to retrieve message")
            .expect("Message missing");
        assert_eq!(retrieved.role, MessageRole::Assistant);
        assert_eq!(retrieved.context, message.context);
        assert_eq!(retrieved.source_ids, message.source_ids);
    }

    #[tokio::test]
    async fn test_user_messages_have_no_context() {
        let message = Message::user("conv-1".to_string(), None, "hello".to_string());
        assert_eq!(message.role, MessageRole::User);
        assert!(message.context.is_none());
        assert!(message.source_ids.is_none());
    }

    #[tokio::test]
    async fn test_for_conversation_orders_by_creation() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let mut first = Message::user("conv-1".to_string(), None, "first".to_string());
        first.created_at = Utc::now() - Duration::seconds(20);
        let mut second = Message::assistant("conv-1".to_string(), "second".to_string(), None, None);
        second.created_at = Utc::now() - Duration::seconds(10);
        let third = Message::user("conv-1".to_string(), None, "third".to_string());
        let unrelated = Message::user("conv-2".to_string(), None, "other".to_string());

        for message in [second, third, first, unrelated] {
            db.store_item(message).await.expect("Failed to store");
        }

        let messages = Message::for_conversation(&db, "conv-1")
            .await
            .expect("Query failed");
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);

        let count = Message::count_for_conversation(&db, "conv-1")
            .await
            .expect("Count failed");
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_user_turns_since_filters_role_and_cutoff() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let now = Utc::now();

        let mut old = Message::user(
            "conv-1".to_string(),
            Some("user-1".to_string()),
            "old".to_string(),
        );
        old.created_at = now - Duration::seconds(120);

        let mut recent = Message::user(
            "conv-1".to_string(),
            Some("user-1".to_string()),
            "recent".to_string(),
        );
        recent.created_at = now - Duration::seconds(10);

        let mut assistant = Message::assistant("conv-1".to_string(), "reply".to_string(), None, None);
        assistant.created_at = now - Duration::seconds(5);

        let mut other_user = Message::user(
            "conv-2".to_string(),
            Some("user-2".to_string()),
            "unrelated".to_string(),
        );
        other_user.created_at = now - Duration::seconds(10);

        for message in [old, recent, assistant, other_user] {
            db.store_item(message).await.expect("Failed to store");
        }

        let cutoff = now - Duration::seconds(60);
        let turns = Message::user_turns_since(&db, "user-1", cutoff, 10)
            .await
            .expect("Window query failed");
        assert_eq!(turns.len(), 1);
        assert!(*turns.first().expect("Turn missing") > cutoff);
    }

    #[tokio::test]
    async fn test_recent_assistant_contexts_skips_bare_messages() {
        let namespace = "test_ns";
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory(namespace, database)
            .await
            .expect("Failed to start in-memory surrealdb");

        let with_context = Message::assistant(
            "conv-1".to_string(),
            "grounded".to_string(),
            Some(sample_context()),
            Some(vec!["source-1".to_string()]),
        );
        let without_context =
            Message::assistant("conv-1".to_string(), "bare".to_string(), None, None);
        let user_message = Message::user("conv-1".to_string(), None, "question".to_string());

        for message in [with_context, without_context, user_message] {
            db.store_item(message).await.expect("Failed to store");
        }

        let scanned = Message::recent_assistant_contexts(&db, 50)
            .await
            .expect("Scan failed");
        assert_eq!(scanned.len(), 1);
        assert_eq!(
            scanned.first().expect("Message missing").content,
            "grounded"
        );
    }
}
