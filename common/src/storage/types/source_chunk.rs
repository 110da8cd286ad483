use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(SourceChunk, "source_chunk", {
    namespace: String,
    source_id: String,
    source_title: String,
    text: String,
    page: Option<u32>,
    section: Option<String>,
    embedding: Vec<f32>
});

/// One KNN hit: a chunk row plus its distance to the query vector.
#[derive(Debug, Clone, Deserialize)]
pub struct RankedSourceChunk {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub namespace: String,
    pub source_id: String,
    pub source_title: String,
    pub text: String,
    pub page: Option<u32>,
    pub section: Option<String>,
    pub distance: f32,
}

impl SourceChunk {
    pub fn new(
        namespace: String,
        source_id: String,
        source_title: String,
        text: String,
        page: Option<u32>,
        section: Option<String>,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            namespace,
            source_id,
            source_title,
            text,
            page,
            section,
            embedding,
        }
    }

    /// KNN search over the HNSW index, scoped to one namespace and ordered by
    /// ascending distance. The embedding length must match the index
    /// dimension or Surreal returns no candidates.
    pub async fn vector_search(
        db: &SurrealDbClient,
        namespace: &str,
        embedding: &[f32],
        take: usize,
    ) -> Result<Vec<RankedSourceChunk>, AppError> {
        let query = format!(
            "SELECT *, vector::distance::knn() AS distance FROM {table} WHERE namespace = $namespace AND embedding <|{take},40|> {embedding:?} ORDER BY distance",
            table = Self::table_name(),
        );

        let mut response = db
            .query(query)
            .bind(("namespace", namespace.to_string()))
            .await?;
        let hits: Vec<RankedSourceChunk> = response.take(0)?;
        Ok(hits)
    }

    /// Recreate the HNSW index with a new embedding dimension.
    ///
    /// Surreal requires the index definition to be recreated when the
    /// embedding length changes; tests use this to run at small dimensions.
    pub async fn redefine_hnsw_index(
        db: &SurrealDbClient,
        dimension: usize,
    ) -> Result<(), AppError> {
        let query = format!(
            "BEGIN TRANSACTION;
             REMOVE INDEX IF EXISTS idx_embedding_source_chunk ON TABLE {table};
             DEFINE INDEX idx_embedding_source_chunk ON TABLE {table} FIELDS embedding HNSW DIMENSION {dimension};
             COMMIT TRANSACTION;",
            table = Self::table_name(),
        );

        let res = db.client.query(query).await.map_err(AppError::Database)?;
        res.check().map_err(AppError::Database)?;

        Ok(())
    }
}
