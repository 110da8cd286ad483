use std::time::Instant;

use analytics_pipeline::{run_aggregation, AggregationReport};
use axum::{extract::State, http::HeaderMap, response::IntoResponse, Json};
use serde::Serialize;

use crate::{api_state::ApiState, error::ApiError, middleware_identity::bearer_token};

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct AggregationResponse {
    success: bool,
    processed: AggregationReport,
    /// Milliseconds spent in the run.
    duration: u128,
}

/// Trigger one aggregation run. The job itself decides what to fold in; this
/// endpoint only guards access and reports the outcome.
pub async fn trigger_aggregation(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(secret) = &state.config.aggregation_secret {
        if bearer_token(&headers).as_deref() != Some(secret.as_str()) {
            return Err(ApiError::Forbidden(
                "a valid job secret is required".to_string(),
            ));
        }
    }

    let started = Instant::now();
    let report = run_aggregation(&state.db, &state.aggregation)
        .await
        .map_err(|error| {
            tracing::error!(%error, "aggregation run failed");
            ApiError::from_app(error, state.config.expose_error_details)
        })?;

    Ok(Json(AggregationResponse {
        success: true,
        processed: report,
        duration: started.elapsed().as_millis(),
    }))
}
