use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(AggregationRun, "aggregation_run", {
    #[serde(
        serialize_with = "serialize_datetime",
        deserialize_with = "deserialize_datetime"
    )]
    watermark: DateTime<Utc>
});

const LATEST_RUN_ID: &str = "latest";

impl AggregationRun {
    /// Start of the window already covered by a completed run, if any.
    pub async fn latest(db: &SurrealDbClient) -> Result<Option<DateTime<Utc>>, AppError> {
        let row: Option<Self> = db.get_item(LATEST_RUN_ID).await?;
        Ok(row.map(|run| run.watermark))
    }

    /// Record that everything before `watermark` has been folded in. Called
    /// only after a run completes, so a failed run is retried from the old
    /// watermark.
    pub async fn advance(db: &SurrealDbClient, watermark: DateTime<Utc>) -> Result<(), AppError> {
        db.query(
            "UPSERT type::thing('aggregation_run', $id) SET \
             watermark = $watermark, \
             created_at = created_at ?? $now, \
             updated_at = $now",
        )
        .bind(("id", LATEST_RUN_ID))
        .bind(("watermark", surrealdb::sql::Datetime::from(watermark)))
        .bind(("now", surrealdb::sql::Datetime::from(Utc::now())))
        .await?
        .check()?;
        Ok(())
    }
}
