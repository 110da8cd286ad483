use analytics_pipeline::{run_aggregation, AggregationSettings};
use common::{storage::db::SurrealDbClient, utils::config::get_config};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let db = SurrealDbClient::new(
        &config.surrealdb_address,
        &config.surrealdb_username,
        &config.surrealdb_password,
        &config.surrealdb_namespace,
        &config.surrealdb_database,
    )
    .await?;

    let settings = AggregationSettings {
        lookback_hours: config.aggregation_lookback_hours,
        scan_limit: config.aggregation_scan_limit,
    };

    let started = std::time::Instant::now();
    let report = run_aggregation(&db, &settings).await?;
    info!(
        duration_ms = started.elapsed().as_millis(),
        "Aggregation run finished"
    );

    // Machine-readable summary for whatever scheduled the run.
    println!("{}", serde_json::to_string(&report)?);

    Ok(())
}
