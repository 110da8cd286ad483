use std::sync::Arc;

use analytics_pipeline::AggregationSettings;
use chat_pipeline::TurnDeps;
use common::{storage::db::SurrealDbClient, utils::config::AppConfig};

/// Shared state for every API route: the store, the parsed configuration and
/// the wired turn dependencies. Construction happens at startup, where the
/// binary decides which provider backends to plug in.
#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub config: AppConfig,
    pub turn: TurnDeps,
    pub aggregation: AggregationSettings,
}

impl ApiState {
    pub fn new(db: Arc<SurrealDbClient>, config: AppConfig, turn: TurnDeps) -> Self {
        let aggregation = AggregationSettings {
            lookback_hours: config.aggregation_lookback_hours,
            scan_limit: config.aggregation_scan_limit,
        };

        Self {
            db,
            config,
            turn,
            aggregation,
        }
    }
}
