use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_openai::{types::CreateEmbeddingRequestArgs, Client};

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};

/// Produces fixed-length query/document vectors. The OpenAI backend shares
/// the process-wide completion client; the hashed backend is deterministic
/// and needs no network, which is what tests and offline runs use.
#[derive(Clone)]
pub struct EmbeddingProvider {
    inner: EmbeddingInner,
}

#[derive(Clone)]
enum EmbeddingInner {
    OpenAI {
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    },
    Hashed {
        dimensions: u32,
    },
}

impl EmbeddingProvider {
    pub fn from_config(
        config: &AppConfig,
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
    ) -> Self {
        match config.embedding_backend {
            EmbeddingBackend::OpenAI => Self::new_openai(
                client,
                config.embedding_model.clone(),
                config.embedding_dimensions,
            ),
            EmbeddingBackend::Hashed => Self::new_hashed(config.embedding_dimensions),
        }
    }

    pub fn new_openai(
        client: Arc<Client<async_openai::config::OpenAIConfig>>,
        model: String,
        dimensions: u32,
    ) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            },
        }
    }

    pub fn new_hashed(dimensions: u32) -> Self {
        EmbeddingProvider {
            inner: EmbeddingInner::Hashed {
                dimensions: dimensions.max(1),
            },
        }
    }

    pub fn backend_label(&self) -> &'static str {
        match self.inner {
            EmbeddingInner::Hashed { .. } => "hashed",
            EmbeddingInner::OpenAI { .. } => "openai",
        }
    }

    pub fn dimensions(&self) -> u32 {
        match &self.inner {
            EmbeddingInner::Hashed { dimensions } => *dimensions,
            EmbeddingInner::OpenAI { dimensions, .. } => *dimensions,
        }
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
        match &self.inner {
            EmbeddingInner::Hashed { dimensions } => Ok(hashed_embedding(text, *dimensions)),
            EmbeddingInner::OpenAI {
                client,
                model,
                dimensions,
            } => {
                let request = CreateEmbeddingRequestArgs::default()
                    .model(model.clone())
                    .input([text])
                    .dimensions(*dimensions)
                    .build()?;

                let response = client.embeddings().create(request).await?;

                let embedding = response
                    .data
                    .first()
                    .ok_or_else(|| {
                        AppError::InternalError(
                            "No embedding data received from OpenAI API".to_string(),
                        )
                    })?
                    .embedding
                    .clone();

                Ok(embedding)
            }
        }
    }
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimensions: u32) -> Vec<f32> {
    let dim = dimensions.max(1) as usize;
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    for token in tokens(text) {
        let idx = bucket(&token, dim);
        if let Some(value) = vector.get_mut(idx) {
            *value += 1.0;
        }
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dim: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() % dim as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embeddings_are_deterministic() {
        let provider = EmbeddingProvider::new_hashed(16);
        let first = provider.embed("where is the reset switch").await.unwrap();
        let second = provider.embed("where is the reset switch").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 16);
    }

    #[tokio::test]
    async fn hashed_embeddings_are_unit_length() {
        let provider = EmbeddingProvider::new_hashed(32);
        let vector = provider.embed("normalize me please").await.unwrap();
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn empty_input_yields_zero_vector() {
        let provider = EmbeddingProvider::new_hashed(8);
        let vector = provider.embed("").await.unwrap();
        assert_eq!(vector, vec![0.0; 8]);
    }

    #[test]
    fn dimension_floor_is_one() {
        let provider = EmbeddingProvider::new_hashed(0);
        assert_eq!(provider.dimensions(), 1);
        assert_eq!(provider.backend_label(), "hashed");
    }
}
