use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};

use common::storage::types::user::User;

use crate::{api_state::ApiState, error::ApiError};

/// Resolves `Authorization: Bearer <subject>` to a user row and attaches it
/// to the request. A missing or blank header means an anonymous request;
/// every route behind this middleware accepts those. The token itself is
/// opaque here, its validation belongs to the identity provider in front.
pub async fn resolve_identity(
    State(state): State<ApiState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(subject) = bearer_token(request.headers()) {
        let user = User::find_or_create_by_subject(&state.db, &subject)
            .await
            .map_err(|error| ApiError::from_app(error, state.config.expose_error_details))?;
        request.extensions_mut().insert(user);
    }

    Ok(next.run(request).await)
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(String::from)
}
