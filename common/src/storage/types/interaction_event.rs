use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(InteractionEvent, "interaction_event", {
    kind: String,
    chatbot_id: Option<String>,
    conversation_id: Option<String>,
    chunk_ids: Vec<String>,
    metadata: serde_json::Value
});

impl InteractionEvent {
    pub fn new(
        kind: &str,
        chatbot_id: Option<String>,
        conversation_id: Option<String>,
        chunk_ids: Vec<String>,
        metadata: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            chatbot_id,
            conversation_id,
            chunk_ids,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// Events recorded at or after the cutoff, oldest first.
    pub async fn since(
        db: &SurrealDbClient,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Self>, AppError> {
        let mut response = db
            .query(
                "SELECT * FROM type::table($table) WHERE created_at >= $cutoff ORDER BY created_at ASC",
            )
            .bind(("table", Self::table_name()))
            .bind(("cutoff", surrealdb::sql::Datetime::from(cutoff)))
            .await?;
        let rows: Vec<Self> = response.take(0)?;
        Ok(rows)
    }

    /// Copy events only count when the client marked the copy as taken to
    /// use, not merely selected. The marker lives in free-form metadata.
    pub fn is_copy_to_use(&self) -> bool {
        self.kind == "copy"
            && self
                .metadata
                .get("copy_to_use")
                .and_then(serde_json::Value::as_bool)
                == Some(true)
    }
}
