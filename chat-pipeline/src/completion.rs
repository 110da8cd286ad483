use std::{pin::Pin, sync::Arc, time::Duration};

use async_openai::{
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
        CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use common::storage::types::message::MessageRole;
use futures::{Stream, StreamExt};
use thiserror::Error;

use crate::TurnMessage;

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

/// Why a completion attempt failed. Pre-stream failures come back as the
/// `Err` of [`CompletionBackend::stream_chat`]; mid-stream failures arrive as
/// an `Err` item after fragments were already delivered.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion provider quota exhausted: {0}")]
    Quota(String),
    #[error("completion provider rejected credentials: {0}")]
    Auth(String),
    #[error("completion provider overloaded: {0}")]
    Overloaded(String),
    #[error("completion request rejected: {0}")]
    InvalidRequest(String),
    #[error("completion provider timed out: {0}")]
    Timeout(String),
    #[error("completion provider unreachable: {0}")]
    Network(String),
}

/// Streams one assistant reply for a system prompt plus transcript.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn stream_chat(
        &self,
        system_prompt: &str,
        history: &[TurnMessage],
    ) -> Result<CompletionStream, CompletionError>;
}

/// Bucket an API-level rejection by its error type and message text. The
/// provider does not expose a stable machine-readable taxonomy, so this works
/// from the documented type strings with message substrings as fallback.
fn classify_provider_failure(kind: Option<&str>, message: &str) -> CompletionError {
    let kind = kind.unwrap_or_default().to_lowercase();
    let text = format!("{kind} {}", message.to_lowercase());

    if kind == "insufficient_quota" || text.contains("quota") || text.contains("billing") {
        CompletionError::Quota(message.to_string())
    } else if kind.contains("authentication")
        || text.contains("invalid_api_key")
        || text.contains("api key")
        || text.contains("incorrect api key")
    {
        CompletionError::Auth(message.to_string())
    } else if text.contains("rate limit")
        || text.contains("rate_limit")
        || text.contains("overloaded")
        || text.contains("server_error")
        || text.contains("server had an error")
        || text.contains("unavailable")
    {
        CompletionError::Overloaded(message.to_string())
    } else {
        CompletionError::InvalidRequest(message.to_string())
    }
}

pub fn classify_openai_error(error: &OpenAIError) -> CompletionError {
    match error {
        OpenAIError::ApiError(api) => {
            classify_provider_failure(api.r#type.as_deref(), &api.message)
        }
        OpenAIError::StreamError(detail) => CompletionError::Network(detail.to_string()),
        other => {
            let detail = other.to_string();
            if detail.to_lowercase().contains("timed out") {
                CompletionError::Timeout(detail)
            } else {
                CompletionError::Network(detail)
            }
        }
    }
}

fn build_request(
    model: &str,
    system_prompt: &str,
    history: &[TurnMessage],
) -> Result<CreateChatCompletionRequest, OpenAIError> {
    let mut messages: Vec<ChatCompletionRequestMessage> = Vec::with_capacity(history.len() + 1);
    messages.push(ChatCompletionRequestSystemMessage::from(system_prompt.to_string()).into());
    for turn in history {
        let message = match turn.role {
            MessageRole::User => {
                ChatCompletionRequestUserMessage::from(turn.content.clone()).into()
            }
            MessageRole::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(turn.content.clone())
                .build()?
                .into(),
        };
        messages.push(message);
    }

    CreateChatCompletionRequestArgs::default()
        .model(model)
        .messages(messages)
        .build()
}

/// Production backend over the shared OpenAI-compatible client.
pub struct OpenAiCompletion {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    timeout: Duration,
}

impl OpenAiCompletion {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String, timeout: Duration) -> Self {
        Self {
            client,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl CompletionBackend for OpenAiCompletion {
    async fn stream_chat(
        &self,
        system_prompt: &str,
        history: &[TurnMessage],
    ) -> Result<CompletionStream, CompletionError> {
        let request = build_request(&self.model, system_prompt, history)
            .map_err(|e| classify_openai_error(&e))?;

        // The timeout covers only establishing the stream; once fragments
        // flow, the client connection governs how long we keep reading.
        let stream = tokio::time::timeout(self.timeout, self.client.chat().create_stream(request))
            .await
            .map_err(|_| CompletionError::Timeout("completion request timed out".to_string()))?
            .map_err(|e| classify_openai_error(&e))?;

        let fragments = stream
            .map(|result| match result {
                Ok(response) => Ok(response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .unwrap_or_default()),
                Err(e) => Err(classify_openai_error(&e)),
            })
            .filter(|item| {
                futures::future::ready(!matches!(item, Ok(content) if content.is_empty()))
            })
            .boxed();

        Ok(fragments)
    }
}

/// Replays a fixed script instead of calling a provider, and records every
/// system prompt it was handed so tests can assert on the model input.
#[cfg(any(test, feature = "test-utils"))]
#[derive(Clone, Default)]
pub struct ScriptedCompletion {
    script: Vec<Result<String, CompletionError>>,
    refusal: Option<CompletionError>,
    prompts: Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl ScriptedCompletion {
    pub fn replying(fragments: &[&str]) -> Self {
        Self {
            script: fragments.iter().map(|f| Ok((*f).to_string())).collect(),
            ..Self::default()
        }
    }

    /// Rejects the request before any stream exists.
    pub fn refusing(error: CompletionError) -> Self {
        Self {
            refusal: Some(error),
            ..Self::default()
        }
    }

    /// Streams the given fragments, then fails in-stream.
    pub fn breaking_after(fragments: &[&str], error: CompletionError) -> Self {
        let mut script: Vec<Result<String, CompletionError>> =
            fragments.iter().map(|f| Ok((*f).to_string())).collect();
        script.push(Err(error));
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[cfg(any(test, feature = "test-utils"))]
#[async_trait]
impl CompletionBackend for ScriptedCompletion {
    async fn stream_chat(
        &self,
        system_prompt: &str,
        _history: &[TurnMessage],
    ) -> Result<CompletionStream, CompletionError> {
        self.prompts
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(system_prompt.to_string());

        if let Some(error) = &self.refusal {
            return Err(error.clone());
        }
        Ok(futures::stream::iter(self.script.clone()).boxed())
    }
}
