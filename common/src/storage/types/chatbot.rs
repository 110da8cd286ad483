use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Chatbot, "chatbot", {
    name: String,
    system_prompt: String,
    namespace: String,
    active: bool
});

impl Chatbot {
    pub fn new(name: String, system_prompt: String, namespace: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name,
            system_prompt,
            namespace,
            active: true,
        }
    }

    /// A deactivated chatbot is indistinguishable from a missing one: both
    /// come back as `None`.
    pub async fn find_active(
        db: &SurrealDbClient,
        chatbot_id: &str,
    ) -> Result<Option<Self>, AppError> {
        let chatbot: Option<Self> = db.get_item(chatbot_id).await?;
        Ok(chatbot.filter(|bot| bot.active))
    }
}
