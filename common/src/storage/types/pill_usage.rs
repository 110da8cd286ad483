use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(PillUsage, "pill_usage", {
    pill_id: String,
    paired_pill_id: Option<String>,
    chatbot_id: String,
    conversation_id: String,
    user_id: Option<String>,
    chunk_ids: Vec<String>,
    shown_text: Option<String>,
    sent_text: Option<String>,
    edited: bool
});

impl PillUsage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pill_id: &str,
        paired_pill_id: Option<String>,
        chatbot_id: &str,
        conversation_id: &str,
        user_id: Option<String>,
        chunk_ids: Vec<String>,
        shown_text: Option<String>,
        sent_text: Option<String>,
        edited: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            pill_id: pill_id.to_string(),
            paired_pill_id,
            chatbot_id: chatbot_id.to_string(),
            conversation_id: conversation_id.to_string(),
            user_id,
            chunk_ids,
            shown_text,
            sent_text,
            edited,
            created_at: now,
            updated_at: now,
        }
    }

    /// Usage rows recorded at or after the cutoff, oldest first.
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
}
