//! The chat turn state machine: validate, authorize, rate-limit, resolve the
//! conversation, persist the inbound message, retrieve context, then stream
//! the reply while a spawned outbox handles everything after the answer.

use std::{pin::Pin, sync::Arc};

use async_stream::stream;
use chrono::Utc;
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            chatbot::Chatbot,
            conversation::Conversation,
            message::{ContextChunk, Message, MessageRole},
            user::User,
        },
    },
};
use futures::{Stream, StreamExt};
use retrieval_pipeline::{weighting::attribution_weights, ContextSource, RetrievalError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{instrument, warn};

use crate::{
    completion::{CompletionBackend, CompletionError, CompletionStream},
    outbox::{self, OutboxJob, TeeItem, TurnReport},
    prompt::assemble_system_prompt,
    rate_limit::{QuotaDecision, TurnQuota},
    TurnMessage,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub messages: Vec<TurnMessage>,
    pub chatbot_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub pill_metadata: Option<PillMetadata>,
}

/// Which feedback affordance produced this turn's text, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PillMetadata {
    pub pill_id: String,
    #[serde(default)]
    pub paired_pill_id: Option<String>,
    #[serde(default)]
    pub shown_text: Option<String>,
    #[serde(default)]
    pub sent_text: Option<String>,
    #[serde(default)]
    pub edited: bool,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("chatbot not found")]
    ChatbotNotFound,
    #[error("conversation not found")]
    ConversationNotFound,
    #[error("{0}")]
    Forbidden(String),
    #[error("message quota exceeded")]
    QuotaExceeded(QuotaDecision),
    #[error("knowledge store unavailable: {0}")]
    RetrievalUnavailable(String),
    #[error("query embedding unavailable: {0}")]
    EmbeddingUnavailable(String),
    #[error("conversation store unavailable: {0}")]
    StoreUnavailable(String),
    #[error(transparent)]
    Completion(CompletionError),
    #[error("{0}")]
    Internal(String),
}

/// Store failures abort the turn only on the critical path; connectivity
/// trouble and query trouble read differently to the caller.
fn store_error(error: impl Into<AppError>) -> TurnError {
    let error = error.into();
    if error.is_connectivity() {
        TurnError::StoreUnavailable(error.to_string())
    } else {
        TurnError::Internal(error.to_string())
    }
}

/// Everything a turn needs, constructed once at startup and shared.
#[derive(Clone)]
pub struct TurnDeps {
    pub db: Arc<SurrealDbClient>,
    pub context: Arc<dyn ContextSource>,
    pub completion: Arc<dyn CompletionBackend>,
    pub quota: Arc<dyn TurnQuota>,
    pub retrieval_top_k: usize,
}

#[derive(Debug)]
pub enum StreamItem {
    Fragment(String),
    /// Appended in place of further fragments when generation fails after
    /// output already reached the client. The stream closes right after.
    ErrorMarker(String),
    Done,
}

pub type TurnStream = Pin<Box<dyn Stream<Item = StreamItem> + Send>>;

/// A turn that made it past every pre-stream check. Headers can be written
/// from `conversation_id` and `quota`; `stream` plays the reply; `report`
/// resolves once the post-turn outbox finishes.
pub struct PreparedTurn {
    pub conversation_id: String,
    pub quota: QuotaDecision,
    pub stream: TurnStream,
    pub report: oneshot::Receiver<TurnReport>,
}

fn validate(request: &TurnRequest) -> Result<String, TurnError> {
    if request.chatbot_id.trim().is_empty() {
        return Err(TurnError::InvalidRequest(
            "chatbotId is required".to_string(),
        ));
    }
    let last = request
        .messages
        .last()
        .ok_or_else(|| TurnError::InvalidRequest("messages must not be empty".to_string()))?;
    if last.role != MessageRole::User {
        return Err(TurnError::InvalidRequest(
            "the last message must be user-authored".to_string(),
        ));
    }
    if last.content.trim().is_empty() {
        return Err(TurnError::InvalidRequest(
            "the last message must not be blank".to_string(),
        ));
    }
    Ok(last.content.clone())
}

async fn resolve_conversation(
    deps: &TurnDeps,
    user: Option<&User>,
    request: &TurnRequest,
    chatbot: &Chatbot,
) -> Result<String, TurnError> {
    let Some(conversation_id) = &request.conversation_id else {
        let conversation = Conversation::new(chatbot.id.clone(), user.map(|u| u.id.clone()));
        let id = conversation.id.clone();
        deps.db
            .store_item(conversation)
            .await
            .map_err(store_error)?;
        return Ok(id);
    };

    let conversation: Conversation = deps
        .db
        .get_item(conversation_id)
        .await
        .map_err(store_error)?
        .ok_or(TurnError::ConversationNotFound)?;

    if conversation.chatbot_id != chatbot.id {
        return Err(TurnError::Forbidden(
            "conversation belongs to a different chatbot".to_string(),
        ));
    }

    match (&conversation.user_id, user) {
        (Some(owner), Some(user)) if *owner != user.id => Err(TurnError::Forbidden(
            "conversation belongs to a different user".to_string(),
        )),
        (Some(_), None) => Err(TurnError::Forbidden(
            "conversation requires its owner".to_string(),
        )),
        (None, Some(user)) => {
            // An anonymous conversation is claimed by the first identified
            // user to continue it; ownership never moves again.
            Conversation::claim_owner(&deps.db, &conversation.id, &user.id)
                .await
                .map_err(store_error)?;
            Ok(conversation.id)
        }
        _ => Ok(conversation.id),
    }
}

#[instrument(skip_all, fields(chatbot_id = %request.chatbot_id))]
pub async fn prepare_turn(
    deps: &TurnDeps,
    user: Option<&User>,
    request: TurnRequest,
) -> Result<PreparedTurn, TurnError> {
    let query = validate(&request)?;

    let chatbot = Chatbot::find_active(&deps.db, &request.chatbot_id)
        .await
        .map_err(store_error)?
        .ok_or(TurnError::ChatbotNotFound)?;

    let now = Utc::now();
    let quota = match user {
        // Anonymous turns never consult the quota checker.
        None => QuotaDecision::open(deps.quota.ceiling(), deps.quota.window(), now),
        Some(user) => match deps.quota.check(&user.id).await {
            Ok(decision) if decision.allowed => decision,
            Ok(decision) => return Err(TurnError::QuotaExceeded(decision)),
            Err(error) => {
                // Fail open: a broken rate limiter must not block traffic.
                warn!(error = ?error, "rate limit check failed, allowing the turn");
                QuotaDecision::open(deps.quota.ceiling(), deps.quota.window(), now)
            }
        },
    };

    let conversation_id = resolve_conversation(deps, user, &request, &chatbot).await?;

    // The user's input goes in before any provider is involved, so a later
    // failure cannot lose it.
    let inbound = Message::user(
        conversation_id.clone(),
        user.map(|u| u.id.clone()),
        query.clone(),
    );
    deps.db.store_item(inbound).await.map_err(store_error)?;

    // Connectivity and embedding trouble abort the turn with their own
    // messages; a failed search query falls back to an ungrounded answer.
    let chunks = match deps
        .context
        .retrieve(&chatbot.namespace, &query, deps.retrieval_top_k)
        .await
    {
        Ok(chunks) => chunks,
        Err(RetrievalError::Connectivity(detail)) => {
            return Err(TurnError::RetrievalUnavailable(detail));
        }
        Err(RetrievalError::Embedding(detail)) => {
            return Err(TurnError::EmbeddingUnavailable(detail));
        }
        Err(error @ RetrievalError::Query(_)) => {
            warn!(error = %error, "similarity search failed, answering without grounding context");
            Vec::new()
        }
    };

    let weights = attribution_weights(chunks.len());
    let context: Vec<ContextChunk> = chunks
        .iter()
        .zip(weights)
        .map(|(retrieved, weight)| ContextChunk {
            chunk_id: retrieved.chunk.id.clone(),
            source_id: retrieved.chunk.source_id.clone(),
            source_title: retrieved.chunk.source_title.clone(),
            text: retrieved.chunk.text.clone(),
            page: retrieved.chunk.page,
            section: retrieved.chunk.section.clone(),
            score: retrieved.score,
            weight,
        })
        .collect();

    let prompt = assemble_system_prompt(&chatbot.system_prompt, &chunks);

    let mut fragments = deps
        .completion
        .stream_chat(&prompt.system_prompt, &request.messages)
        .await
        .map_err(TurnError::Completion)?;

    // Peek one item so a failure before any output maps to a clean terminal
    // error instead of a broken stream.
    let leading = match fragments.next().await {
        Some(Ok(fragment)) => Some(fragment),
        Some(Err(error)) => return Err(TurnError::Completion(error)),
        None => None,
    };

    let (tx, rx) = mpsc::channel::<TeeItem>(1000);
    let (report_tx, report_rx) = oneshot::channel();
    let job = OutboxJob {
        db: Arc::clone(&deps.db),
        conversation_id: conversation_id.clone(),
        chatbot_id: chatbot.id.clone(),
        user_id: user.map(|u| u.id.clone()),
        context,
        pill: request.pill_metadata.clone(),
    };
    tokio::spawn(outbox::drain(rx, job, report_tx));

    Ok(PreparedTurn {
        conversation_id,
        quota,
        stream: build_turn_stream(leading, fragments, tx),
        report: report_rx,
    })
}

/// Tee every fragment to the outbox while yielding it to the client. If this
/// stream is dropped before completion the sender closes without a
/// `Completed` marker, the outbox skips persistence, and the upstream
/// provider stream is dropped with it, cancelling generation.
fn build_turn_stream(
    leading: Option<String>,
    mut fragments: CompletionStream,
    tx: mpsc::Sender<TeeItem>,
) -> TurnStream {
    stream! {
        if let Some(fragment) = leading {
            let _ = tx.send(TeeItem::Fragment(fragment.clone())).await;
            yield StreamItem::Fragment(fragment);
        }
        loop {
            match fragments.next().await {
                Some(Ok(fragment)) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    let _ = tx.send(TeeItem::Fragment(fragment.clone())).await;
                    yield StreamItem::Fragment(fragment);
                }
                Some(Err(error)) => {
                    warn!(error = %error, "completion stream failed mid-reply");
                    let _ = tx.send(TeeItem::Completed).await;
                    yield StreamItem::ErrorMarker(error.to_string());
                    break;
                }
                None => {
                    let _ = tx.send(TeeItem::Completed).await;
                    yield StreamItem::Done;
                    break;
                }
            }
        }
    }
    .boxed()
}
