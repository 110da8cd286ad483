use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Authorization error: {0}")]
    Forbidden(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Whether the failure is the store being unreachable, as opposed to a
    /// query the store executed and rejected.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, AppError::Database(surrealdb::Error::Api(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_is_not_connectivity() {
        assert!(!AppError::NotFound("conversation".to_string()).is_connectivity());
    }

    #[test]
    fn api_class_database_error_is_connectivity() {
        let err = AppError::Database(surrealdb::Error::Api(
            surrealdb::error::Api::ConnectionUninitialised,
        ));
        assert!(err.is_connectivity());
    }
}
