use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(User, "user", {
    subject: String
});

impl User {
    /// The subject is the opaque id the external identity provider vouches
    /// for. We never interpret it.
    pub fn new(subject: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            subject,
        }
    }

    pub async fn find_by_subject(
        db: &SurrealDbClient,
        subject: &str,
    ) -> Result<Option<Self>, AppError> {
        let mut response = db
            .query("SELECT * FROM type::table($table) WHERE subject = $subject LIMIT 1")
            .bind(("table", Self::table_name()))
            .bind(("subject", subject.to_string()))
            .await?;
        let user: Option<Self> = response.take(0)?;
        Ok(user)
    }

    /// Resolve a subject to a user row, creating one on first sight. Two
    /// requests racing on a fresh subject are settled by the unique index:
    /// the loser re-reads the winner's row.
    pub async fn find_or_create_by_subject(
        db: &SurrealDbClient,
        subject: &str,
    ) -> Result<Self, AppError> {
        if let Some(user) = Self::find_by_subject(db, subject).await? {
            return Ok(user);
        }

        let candidate = Self::new(subject.to_string());
        match db.store_item(candidate).await {
            Ok(Some(created)) => Ok(created),
            Ok(None) => Self::find_by_subject(db, subject)
                .await?
                .ok_or_else(|| AppError::NotFound("User row vanished after create".to_string())),
            Err(create_err) => match Self::find_by_subject(db, subject).await? {
                Some(existing) => Ok(existing),
                None => Err(create_err.into()),
            },
        }
    }
}
