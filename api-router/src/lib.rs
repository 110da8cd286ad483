use api_state::ApiState;
use axum::{
    extract::FromRef,
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use middleware_identity::resolve_identity;
use routes::{
    aggregation::trigger_aggregation, chat::chat_turn, liveness::live, readiness::ready,
};

pub mod api_state;
pub mod error;
mod middleware_identity;
mod routes;

/// Router for API functionality, version 1
pub fn api_routes_v1<S>(app_state: &ApiState) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    ApiState: FromRef<S>,
{
    // Public, unauthenticated endpoints (for k8s/systemd probes)
    let public = Router::new()
        .route("/ready", get(ready))
        .route("/live", get(live));

    // The turn endpoint accepts anonymous and identified callers; the
    // middleware only resolves identity, it never rejects.
    let chat = Router::new()
        .route("/chat/turn", post(chat_turn))
        .route_layer(from_fn_with_state(app_state.clone(), resolve_identity));

    // Job triggers guard themselves with the shared secret instead.
    let jobs = Router::new().route("/jobs/aggregate-performance", post(trigger_aggregation));

    public.merge(chat).merge(jobs)
}
