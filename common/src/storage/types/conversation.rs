use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Deserialize, Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Closed,
}

stored_object!(Conversation, "conversation", {
    chatbot_id: String,
    user_id: Option<String>,
    status: ConversationStatus,
    message_count: u32,
    pill_suggestions: Option<Vec<String>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    pill_suggestions_cached_at: Option<DateTime<Utc>>
});

impl Conversation {
    pub fn new(chatbot_id: String, user_id: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            chatbot_id,
            user_id,
            status: ConversationStatus::Active,
            message_count: 0,
            pill_suggestions: None,
            pill_suggestions_cached_at: None,
        }
    }

    /// Hand an anonymous conversation to an identified user. The guard in the
    /// statement keeps this one-directional: a conversation that already has
    /// an owner is left untouched.
    pub async fn claim_owner(
        db: &SurrealDbClient,
        conversation_id: &str,
        user_id: &str,
    ) -> Result<(), AppError> {
        db.query(
            "UPDATE type::thing('conversation', $id) SET user_id = $user_id, updated_at = $now WHERE user_id = NONE",
        )
        .bind(("id", conversation_id.to_string()))
        .bind(("user_id", user_id.to_string()))
        .bind(("now", surrealdb::sql::Datetime::from(Utc::now())))
        .await?
        .check()?;
        Ok(())
    }

    /// One completed turn = one user message + one assistant message.
    pub async fn bump_after_turn(
        db: &SurrealDbClient,
        conversation_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query(
                "UPDATE type::thing('conversation', $id) SET message_count += 2, updated_at = $now RETURN AFTER",
            )
            .bind(("id", conversation_id.to_string()))
            .bind(("now", surrealdb::sql::Datetime::from(Utc::now())))
            .await?;
        let updated: Option<Self> = response.take(0)?;
        Ok(updated)
    }
}
