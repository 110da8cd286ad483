//! Post-turn side effects, run after the reply already reached the client.
//!
//! Everything here is best-effort: the user has their answer, so failures
//! are retried a few times, logged, and swallowed rather than surfaced.

use std::sync::Arc;

use chrono::Utc;
use common::storage::{
    db::SurrealDbClient,
    types::{
        chunk_performance::{ChunkPerformance, PerfDelta, PerfKey},
        conversation::Conversation,
        message::{ContextChunk, Message},
        pill_usage::PillUsage,
    },
};
use tokio::sync::{mpsc, oneshot};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{error, info, warn};

use crate::turn::PillMetadata;

/// What the reply stream hands over as it runs. A closed channel without a
/// `Completed` marker means the client went away mid-reply.
#[derive(Debug)]
pub(crate) enum TeeItem {
    Fragment(String),
    Completed,
}

/// Summary of the post-turn work, delivered once the outbox finishes.
#[derive(Debug)]
pub struct TurnReport {
    pub canceled: bool,
    pub assistant_message_id: Option<String>,
}

pub(crate) struct OutboxJob {
    pub db: Arc<SurrealDbClient>,
    pub conversation_id: String,
    pub chatbot_id: String,
    pub user_id: Option<String>,
    pub context: Vec<ContextChunk>,
    pub pill: Option<PillMetadata>,
}

fn backoff() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(100).map(jitter).take(3)
}

pub(crate) async fn drain(
    mut rx: mpsc::Receiver<TeeItem>,
    job: OutboxJob,
    report_tx: oneshot::Sender<TurnReport>,
) {
    let mut content = String::new();
    let mut completed = false;
    while let Some(item) = rx.recv().await {
        match item {
            TeeItem::Fragment(fragment) => content.push_str(&fragment),
            TeeItem::Completed => completed = true,
        }
    }

    if !completed {
        info!(
            conversation_id = %job.conversation_id,
            "client disconnected before the reply finished, skipping post-turn persistence"
        );
        let _ = report_tx.send(TurnReport {
            canceled: true,
            assistant_message_id: None,
        });
        return;
    }

    let assistant_message_id = persist_assistant_message(&job, content).await;
    bump_conversation(&job).await;
    record_chunk_usage(&job).await;
    record_pill_usage(&job).await;

    let _ = report_tx.send(TurnReport {
        canceled: false,
        assistant_message_id,
    });
}

async fn persist_assistant_message(job: &OutboxJob, content: String) -> Option<String> {
    let mut source_ids: Vec<String> = Vec::new();
    for chunk in &job.context {
        if !source_ids.contains(&chunk.source_id) {
            source_ids.push(chunk.source_id.clone());
        }
    }

    let context = if job.context.is_empty() {
        None
    } else {
        Some(job.context.clone())
    };
    let message = Message::assistant(
        job.conversation_id.clone(),
        content,
        context,
        if source_ids.is_empty() {
            None
        } else {
            Some(source_ids)
        },
    );
    let message_id = message.id.clone();

    let stored = Retry::spawn(backoff(), || {
        let message = message.clone();
        async move { job.db.store_item(message).await }
    })
    .await;

    match stored {
        Ok(_) => Some(message_id),
        Err(e) => {
            error!(
                conversation_id = %job.conversation_id,
                error = ?e,
                "failed to store assistant message"
            );
            None
        }
    }
}

async fn bump_conversation(job: &OutboxJob) {
    let bumped = Retry::spawn(backoff(), || {
        Conversation::bump_after_turn(&job.db, &job.conversation_id)
    })
    .await;

    match bumped {
        Ok(Some(_)) => {}
        Ok(None) => warn!(
            conversation_id = %job.conversation_id,
            "conversation vanished before its counters could be updated"
        ),
        Err(e) => error!(
            conversation_id = %job.conversation_id,
            error = ?e,
            "failed to update conversation counters"
        ),
    }
}

async fn record_chunk_usage(job: &OutboxJob) {
    let now = Utc::now();
    for chunk in &job.context {
        let key = PerfKey::new(&chunk.chunk_id, &job.chatbot_id, &chunk.source_id, now);
        // One chunk's failure must not stop the rest.
        if let Err(e) = ChunkPerformance::apply_delta(
            &job.db,
            &key,
            &PerfDelta::usage_only(),
            Some(chunk.text.clone()),
        )
        .await
        {
            warn!(
                chunk_id = %chunk.chunk_id,
                error = ?e,
                "failed to record chunk usage"
            );
        }
    }
}

async fn record_pill_usage(job: &OutboxJob) {
    let Some(pill) = &job.pill else {
        return;
    };

    let chunk_ids: Vec<String> = job
        .context
        .iter()
        .map(|chunk| chunk.chunk_id.clone())
        .collect();
    let usage = PillUsage::new(
        &pill.pill_id,
        pill.paired_pill_id.clone(),
        &job.chatbot_id,
        &job.conversation_id,
        job.user_id.clone(),
        chunk_ids,
        pill.shown_text.clone(),
        pill.sent_text.clone(),
        pill.edited,
    );

    let stored = Retry::spawn(backoff(), || {
        let usage = usage.clone();
        async move { job.db.store_item(usage).await }
    })
    .await;

    if let Err(e) = stored {
        warn!(
            pill_id = %pill.pill_id,
            error = ?e,
            "failed to record pill usage"
        );
    }
}
