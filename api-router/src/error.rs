use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chat_pipeline::{CompletionError, QuotaDecision, TurnError};
use common::error::AppError;
use serde::Serialize;
use thiserror::Error;

/// The API's outward error surface. Every internal failure class maps to one
/// of these; the mapping decides what detail leaves the process.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("message quota exceeded")]
    RateLimited { decision: QuotaDecision },
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    GatewayTimeout(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn from_turn(error: TurnError, expose_details: bool) -> Self {
        match error {
            TurnError::InvalidRequest(message) => Self::BadRequest(message),
            TurnError::ChatbotNotFound => Self::NotFound("chatbot not found".to_string()),
            TurnError::ConversationNotFound => {
                Self::NotFound("conversation not found".to_string())
            }
            TurnError::Forbidden(message) => Self::Forbidden(message),
            TurnError::QuotaExceeded(decision) => Self::RateLimited { decision },
            TurnError::RetrievalUnavailable(detail) => {
                tracing::warn!(%detail, "turn rejected, retrieval unavailable");
                Self::ServiceUnavailable("knowledge search is temporarily unavailable".to_string())
            }
            TurnError::EmbeddingUnavailable(detail) => {
                tracing::warn!(%detail, "turn rejected, query embedding unavailable");
                Self::ServiceUnavailable(
                    "answer grounding is temporarily unavailable".to_string(),
                )
            }
            TurnError::StoreUnavailable(detail) => {
                tracing::error!(%detail, "turn rejected, conversation store unavailable");
                Self::ServiceUnavailable(
                    "conversation storage is temporarily unavailable".to_string(),
                )
            }
            TurnError::Completion(error) => Self::from_completion(error),
            TurnError::Internal(detail) => Self::internal(detail, expose_details),
        }
    }

    pub fn from_app(error: AppError, expose_details: bool) -> Self {
        match error {
            AppError::NotFound(message) => Self::NotFound(message),
            AppError::Validation(message) => Self::BadRequest(message),
            AppError::Forbidden(message) => Self::Forbidden(message),
            error if error.is_connectivity() => {
                tracing::error!(%error, "store unreachable");
                Self::ServiceUnavailable("storage is temporarily unavailable".to_string())
            }
            error => Self::internal(error.to_string(), expose_details),
        }
    }

    fn from_completion(error: CompletionError) -> Self {
        match error {
            CompletionError::Quota(detail) | CompletionError::Overloaded(detail) => {
                tracing::warn!(%detail, "completion provider unavailable");
                Self::ServiceUnavailable(
                    "answer generation is temporarily unavailable".to_string(),
                )
            }
            CompletionError::Auth(detail) => {
                // Rejected credentials need an operator, not a client retry.
                tracing::error!(%detail, "completion provider rejected our credentials");
                Self::Internal("answer generation is unavailable".to_string())
            }
            CompletionError::InvalidRequest(detail) => {
                tracing::error!(%detail, "completion provider rejected the request");
                Self::Internal("internal server error".to_string())
            }
            CompletionError::Timeout(detail) => {
                tracing::warn!(%detail, "completion provider timed out");
                Self::GatewayTimeout("the answer took too long to start".to_string())
            }
            CompletionError::Network(detail) => {
                tracing::warn!(%detail, "completion provider unreachable");
                Self::GatewayTimeout("the answer provider could not be reached".to_string())
            }
        }
    }

    fn internal(detail: String, expose_details: bool) -> Self {
        tracing::error!(%detail, "internal error");
        if expose_details {
            Self::Internal(detail)
        } else {
            Self::Internal("internal server error".to_string())
        }
    }
}

/// Write the rate-limit headers a quota decision carries. Also used on
/// successful turn responses.
pub(crate) fn quota_headers(headers: &mut HeaderMap, decision: &QuotaDecision) {
    if let Ok(value) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&decision.reset.timestamp().to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorResponse {
            error: self.to_string(),
        };
        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimited { decision } = &self {
            quota_headers(response.headers_mut(), decision);
        }
        response
    }
}

#[derive(Serialize, Debug)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::fmt::Debug;

    fn assert_status_code<T: IntoResponse + Debug>(response: T, expected_status: StatusCode) {
        let response = response.into_response();
        assert_eq!(response.status(), expected_status);
    }

    fn decision() -> QuotaDecision {
        QuotaDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset: Utc::now() + Duration::seconds(30),
        }
    }

    #[test]
    fn test_turn_error_statuses() {
        let expose = false;
        assert_status_code(
            ApiError::from_turn(TurnError::InvalidRequest("bad".to_string()), expose),
            StatusCode::BAD_REQUEST,
        );
        assert_status_code(
            ApiError::from_turn(TurnError::ChatbotNotFound, expose),
            StatusCode::NOT_FOUND,
        );
        assert_status_code(
            ApiError::from_turn(TurnError::ConversationNotFound, expose),
            StatusCode::NOT_FOUND,
        );
        assert_status_code(
            ApiError::from_turn(TurnError::Forbidden("no".to_string()), expose),
            StatusCode::FORBIDDEN,
        );
        assert_status_code(
            ApiError::from_turn(TurnError::QuotaExceeded(decision()), expose),
            StatusCode::TOO_MANY_REQUESTS,
        );
        assert_status_code(
            ApiError::from_turn(
                TurnError::RetrievalUnavailable("search down".to_string()),
                expose,
            ),
            StatusCode::SERVICE_UNAVAILABLE,
        );
        assert_status_code(
            ApiError::from_turn(
                TurnError::EmbeddingUnavailable("embed timed out".to_string()),
                expose,
            ),
            StatusCode::SERVICE_UNAVAILABLE,
        );
        assert_status_code(
            ApiError::from_turn(TurnError::StoreUnavailable("db down".to_string()), expose),
            StatusCode::SERVICE_UNAVAILABLE,
        );
    }

    #[test]
    fn test_retrieval_and_embedding_messages_differ() {
        let retrieval = ApiError::from_turn(
            TurnError::RetrievalUnavailable("search down".to_string()),
            false,
        );
        let embedding = ApiError::from_turn(
            TurnError::EmbeddingUnavailable("embed timed out".to_string()),
            false,
        );
        assert_ne!(retrieval.to_string(), embedding.to_string());
    }

    #[test]
    fn test_completion_error_statuses() {
        let expose = false;
        assert_status_code(
            ApiError::from_turn(
                TurnError::Completion(CompletionError::Quota("billing".to_string())),
                expose,
            ),
            StatusCode::SERVICE_UNAVAILABLE,
        );
        assert_status_code(
            ApiError::from_turn(
                TurnError::Completion(CompletionError::Overloaded("busy".to_string())),
                expose,
            ),
            StatusCode::SERVICE_UNAVAILABLE,
        );
        assert_status_code(
            ApiError::from_turn(
                TurnError::Completion(CompletionError::Auth("bad key".to_string())),
                expose,
            ),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
        assert_status_code(
            ApiError::from_turn(
                TurnError::Completion(CompletionError::Timeout("slow".to_string())),
                expose,
            ),
            StatusCode::GATEWAY_TIMEOUT,
        );
        assert_status_code(
            ApiError::from_turn(
                TurnError::Completion(CompletionError::Network("reset".to_string())),
                expose,
            ),
            StatusCode::GATEWAY_TIMEOUT,
        );
    }

    #[test]
    fn test_rate_limited_response_carries_quota_headers() {
        let response =
            ApiError::from_turn(TurnError::QuotaExceeded(decision()), false).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(
            headers.get("x-ratelimit-limit").map(|v| v.to_str().ok()),
            Some(Some("10"))
        );
        assert_eq!(
            headers
                .get("x-ratelimit-remaining")
                .map(|v| v.to_str().ok()),
            Some(Some("0"))
        );
        assert!(headers.contains_key("x-ratelimit-reset"));
    }

    #[test]
    fn test_internal_detail_hidden_unless_exposed() {
        let hidden = ApiError::from_turn(
            TurnError::Internal("password incorrect for db".to_string()),
            false,
        );
        assert_eq!(hidden.to_string(), "internal server error");

        let exposed = ApiError::from_turn(
            TurnError::Internal("password incorrect for db".to_string()),
            true,
        );
        assert_eq!(exposed.to_string(), "password incorrect for db");
    }

    #[test]
    fn test_app_error_mapping() {
        let expose = false;
        assert_status_code(
            ApiError::from_app(AppError::NotFound("gone".to_string()), expose),
            StatusCode::NOT_FOUND,
        );
        assert_status_code(
            ApiError::from_app(AppError::Validation("bad".to_string()), expose),
            StatusCode::BAD_REQUEST,
        );
        assert_status_code(
            ApiError::from_app(AppError::Forbidden("no".to_string()), expose),
            StatusCode::FORBIDDEN,
        );
        let connectivity = AppError::Database(surrealdb::Error::Api(
            surrealdb::error::Api::ConnectionUninitialised,
        ));
        assert_status_code(
            ApiError::from_app(connectivity, expose),
            StatusCode::SERVICE_UNAVAILABLE,
        );
        assert_status_code(
            ApiError::from_app(AppError::InternalError("oops".to_string()), expose),
            StatusCode::INTERNAL_SERVER_ERROR,
        );
    }
}
