pub mod weighting;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::source_chunk::{RankedSourceChunk, SourceChunk},
    },
    utils::embedding::EmbeddingProvider,
};
use thiserror::Error;
use tracing::instrument;

use crate::weighting::distance_to_score;

// Supporting passage plus its relevance score, handed to prompt assembly.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: RankedSourceChunk,
    pub score: f32,
}

/// Failure modes of a retrieval attempt. `Connectivity` means the backend is
/// down and `Embedding` means the query never became a vector; both abort the
/// turn. `Query` means the search itself ran and failed, and an answer can
/// still be produced without grounding context.
#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query embedding failed: {0}")]
    Embedding(String),
    #[error("search backend unreachable: {0}")]
    Connectivity(String),
    #[error("similarity search failed: {0}")]
    Query(String),
}

impl RetrievalError {
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, RetrievalError::Connectivity(_))
    }
}

fn classify_search_error(error: AppError) -> RetrievalError {
    if error.is_connectivity() {
        RetrievalError::Connectivity(error.to_string())
    } else {
        RetrievalError::Query(error.to_string())
    }
}

/// Source of grounding context for a chat turn. Object safe so handlers can
/// hold a boxed instance and tests can substitute a scripted one.
#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Best-matching passages for `query` within one namespace, ordered by
    /// descending relevance. An empty result is a valid outcome, not an
    /// error.
    async fn retrieve(
        &self,
        namespace: &str,
        query: &str,
        take: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError>;
}

/// Embeds the query and runs KNN search over the chunk store.
pub struct VectorContextSource {
    db: Arc<SurrealDbClient>,
    embedder: EmbeddingProvider,
    timeout: Duration,
}

impl VectorContextSource {
    pub fn new(db: Arc<SurrealDbClient>, embedder: EmbeddingProvider, timeout: Duration) -> Self {
        Self {
            db,
            embedder,
            timeout,
        }
    }
}

#[async_trait]
impl ContextSource for VectorContextSource {
    #[instrument(skip_all, fields(namespace = %namespace, take))]
    async fn retrieve(
        &self,
        namespace: &str,
        query: &str,
        take: usize,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let embedding = tokio::time::timeout(self.timeout, self.embedder.embed(query))
            .await
            .map_err(|_| RetrievalError::Embedding("embedding request timed out".to_string()))?
            .map_err(|e| RetrievalError::Embedding(e.to_string()))?;

        let hits = tokio::time::timeout(
            self.timeout,
            SourceChunk::vector_search(&self.db, namespace, &embedding, take),
        )
        .await
        .map_err(|_| RetrievalError::Connectivity("similarity search timed out".to_string()))?
        .map_err(classify_search_error)?;

        Ok(hits
            .into_iter()
            .map(|chunk| {
                let score = distance_to_score(chunk.distance);
                RetrievedChunk { chunk, score }
            })
            .collect())
    }
}
