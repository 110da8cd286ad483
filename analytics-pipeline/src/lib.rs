//! Rolls raw interaction signals up into monthly per-chunk performance rows.
//!
//! The job reads copy events and affordance usages recorded since the last
//! run, attributes each referenced chunk back to its source and chatbot, and
//! folds the totals into `chunk_performance` counters. Any storage failure
//! aborts the whole run; the watermark only advances after a clean finish,
//! so a rerun picks the same records up again.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{
            aggregation_run::AggregationRun,
            chunk_performance::{ChunkPerformance, PerfDelta, PerfKey},
            conversation::Conversation,
            interaction_event::InteractionEvent,
            message::Message,
            pill_usage::PillUsage,
            source_chunk::SourceChunk,
        },
    },
};
use serde::Serialize;
use tracing::{info, instrument, warn};

/// The feedback affordances whose usages roll up into counters. Ids arrive
/// as free-form strings from clients; anything unrecognized is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affordance {
    Helpful,
    NotHelpful,
    NeedsExamples,
    NeedsSteps,
    NeedsScripts,
    NeedsCaseStudy,
}

impl Affordance {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "helpful" => Some(Self::Helpful),
            "not-helpful" => Some(Self::NotHelpful),
            "needs-examples" => Some(Self::NeedsExamples),
            "needs-steps" => Some(Self::NeedsSteps),
            "needs-scripts" => Some(Self::NeedsScripts),
            "needs-case-study" => Some(Self::NeedsCaseStudy),
            _ => None,
        }
    }

    fn fold_into(self, delta: &mut PerfDelta) {
        match self {
            Self::Helpful => delta.helpful = delta.helpful.saturating_add(1),
            Self::NotHelpful => delta.not_helpful = delta.not_helpful.saturating_add(1),
            Self::NeedsExamples => {
                delta.needs_examples = delta.needs_examples.saturating_add(1);
            }
            Self::NeedsSteps => delta.needs_steps = delta.needs_steps.saturating_add(1),
            Self::NeedsScripts => delta.needs_scripts = delta.needs_scripts.saturating_add(1),
            Self::NeedsCaseStudy => {
                delta.needs_case_study = delta.needs_case_study.saturating_add(1);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregationSettings {
    /// Hard floor on how far back a run may reach, watermark or not.
    pub lookback_hours: u32,
    /// Upper bound on the assistant-message scan used to recover source ids.
    pub scan_limit: u32,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            scan_limit: 1000,
        }
    }
}

/// What one run folded in. A record counts as processed once it contributed
/// to at least one performance row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationReport {
    pub events: usize,
    pub pill_usages: usize,
    pub chunks_created: usize,
    pub chunks_updated: usize,
}

#[derive(Debug, Clone)]
struct Resolved {
    chatbot_id: String,
    source_id: String,
    chunk_text: Option<String>,
}

#[derive(Debug, Clone)]
struct ScanHit {
    source_id: String,
    conversation_id: String,
    text: String,
}

/// Recovers the source and chatbot behind a bare chunk reference. The stored
/// chunk row is authoritative for the source id; when the chunk is gone the
/// attribution falls back to its most recent performance row, then to a
/// bounded scan of assistant messages whose frozen context names the chunk.
/// The chatbot comes from the record itself when present. Lookups are
/// memoized for the run.
struct ChunkResolver<'a> {
    db: &'a SurrealDbClient,
    scan_limit: u32,
    cache: HashMap<(String, Option<String>), Option<Resolved>>,
    scan: Option<HashMap<String, ScanHit>>,
}

impl<'a> ChunkResolver<'a> {
    fn new(db: &'a SurrealDbClient, scan_limit: u32) -> Self {
        Self {
            db,
            scan_limit,
            cache: HashMap::new(),
            scan: None,
        }
    }

    async fn resolve(
        &mut self,
        chunk_id: &str,
        chatbot_hint: Option<&str>,
    ) -> Result<Option<Resolved>, AppError> {
        let cache_key = (chunk_id.to_string(), chatbot_hint.map(ToString::to_string));
        if let Some(hit) = self.cache.get(&cache_key) {
            return Ok(hit.clone());
        }

        let resolved = self.resolve_uncached(chunk_id, chatbot_hint).await?;
        if resolved.is_none() {
            warn!(chunk_id, "skipping signals for unresolvable chunk");
        }
        self.cache.insert(cache_key, resolved.clone());
        Ok(resolved)
    }

    async fn resolve_uncached(
        &mut self,
        chunk_id: &str,
        chatbot_hint: Option<&str>,
    ) -> Result<Option<Resolved>, AppError> {
        let stored: Option<SourceChunk> = self.db.get_item(chunk_id).await?;
        if let Some(chunk) = stored {
            let Some(chatbot_id) = self.chatbot_for(chunk_id, chatbot_hint).await? else {
                return Ok(None);
            };
            return Ok(Some(Resolved {
                chatbot_id,
                source_id: chunk.source_id,
                chunk_text: Some(chunk.text),
            }));
        }

        // Chunk deleted since it was served: attribute from history.
        if let Some(row) = ChunkPerformance::latest_for_chunk(self.db, chunk_id).await? {
            return Ok(Some(Resolved {
                chatbot_id: chatbot_hint.map_or(row.chatbot_id, ToString::to_string),
                source_id: row.source_id,
                chunk_text: None,
            }));
        }

        let Some(hit) = self.scan_hit(chunk_id).await? else {
            return Ok(None);
        };
        let chatbot_id = match chatbot_hint {
            Some(hint) => hint.to_string(),
            None => match self.conversation_chatbot(&hit.conversation_id).await? {
                Some(chatbot_id) => chatbot_id,
                None => return Ok(None),
            },
        };
        Ok(Some(Resolved {
            chatbot_id,
            source_id: hit.source_id,
            chunk_text: Some(hit.text),
        }))
    }

    async fn chatbot_for(
        &mut self,
        chunk_id: &str,
        chatbot_hint: Option<&str>,
    ) -> Result<Option<String>, AppError> {
        if let Some(hint) = chatbot_hint {
            return Ok(Some(hint.to_string()));
        }
        if let Some(row) = ChunkPerformance::latest_for_chunk(self.db, chunk_id).await? {
            return Ok(Some(row.chatbot_id));
        }
        let Some(hit) = self.scan_hit(chunk_id).await? else {
            return Ok(None);
        };
        self.conversation_chatbot(&hit.conversation_id).await
    }

    async fn conversation_chatbot(&self, conversation_id: &str) -> Result<Option<String>, AppError> {
        let conversation: Option<Conversation> = self.db.get_item(conversation_id).await?;
        Ok(conversation.map(|conversation| conversation.chatbot_id))
    }

    async fn scan_hit(&mut self, chunk_id: &str) -> Result<Option<ScanHit>, AppError> {
        if self.scan.is_none() {
            let messages = Message::recent_assistant_contexts(self.db, self.scan_limit).await?;
            let mut by_chunk = HashMap::new();
            for message in &messages {
                let Some(context) = &message.context else {
                    continue;
                };
                for chunk in context {
                    // Newest first, so the first sighting of a chunk wins.
                    by_chunk.entry(chunk.chunk_id.clone()).or_insert_with(|| ScanHit {
                        source_id: chunk.source_id.clone(),
                        conversation_id: message.conversation_id.clone(),
                        text: chunk.text.clone(),
                    });
                }
            }
            self.scan = Some(by_chunk);
        }
        Ok(self
            .scan
            .as_ref()
            .and_then(|scan| scan.get(chunk_id).cloned()))
    }
}

/// Execute one aggregation run over everything recorded in the half-open
/// window from the previous watermark (bounded by the lookback floor) up to
/// the run's start instant.
#[instrument(skip_all)]
pub async fn run_aggregation(
    db: &SurrealDbClient,
    settings: &AggregationSettings,
) -> Result<AggregationReport, AppError> {
    let started = Utc::now();
    let floor = started - Duration::hours(i64::from(settings.lookback_hours));
    let cutoff = AggregationRun::latest(db)
        .await?
        .map_or(floor, |watermark| watermark.max(floor));

    let events = InteractionEvent::since(db, cutoff).await?;
    let usages = PillUsage::since(db, cutoff).await?;

    let mut resolver = ChunkResolver::new(db, settings.scan_limit);
    let mut deltas: HashMap<String, (PerfKey, PerfDelta, Option<String>)> = HashMap::new();
    let mut report = AggregationReport::default();

    for event in &events {
        if event.created_at >= started || !event.is_copy_to_use() {
            continue;
        }
        let mut folded = false;
        for chunk_id in &event.chunk_ids {
            let Some(resolved) = resolver.resolve(chunk_id, event.chatbot_id.as_deref()).await?
            else {
                continue;
            };
            let key = PerfKey::new(chunk_id, &resolved.chatbot_id, &resolved.source_id, started);
            let record_key = key.record_key();
            let entry = deltas
                .entry(record_key)
                .or_insert_with(|| (key, PerfDelta::default(), None));
            if entry.2.is_none() {
                entry.2 = resolved.chunk_text;
            }
            entry.1.copy = entry.1.copy.saturating_add(1);
            folded = true;
        }
        if folded {
            report.events = report.events.saturating_add(1);
        }
    }

    for usage in &usages {
        if usage.created_at >= started {
            continue;
        }
        let Some(affordance) = Affordance::from_id(&usage.pill_id) else {
            warn!(pill_id = %usage.pill_id, "ignoring usage of unknown affordance");
            continue;
        };
        let mut folded = false;
        for chunk_id in &usage.chunk_ids {
            let Some(resolved) = resolver.resolve(chunk_id, Some(&usage.chatbot_id)).await? else {
                continue;
            };
            let key = PerfKey::new(chunk_id, &resolved.chatbot_id, &resolved.source_id, started);
            let record_key = key.record_key();
            let entry = deltas
                .entry(record_key)
                .or_insert_with(|| (key, PerfDelta::default(), None));
            if entry.2.is_none() {
                entry.2 = resolved.chunk_text;
            }
            affordance.fold_into(&mut entry.1);
            folded = true;
        }
        if folded {
            report.pill_usages = report.pill_usages.saturating_add(1);
        }
    }

    for (key, delta, chunk_text) in deltas.into_values() {
        let existed = ChunkPerformance::exists(db, &key).await?;
        ChunkPerformance::apply_delta(db, &key, &delta, chunk_text).await?;
        if existed {
            report.chunks_updated = report.chunks_updated.saturating_add(1);
        } else {
            report.chunks_created = report.chunks_created.saturating_add(1);
        }
    }

    AggregationRun::advance(db, started).await?;

    info!(
        events = report.events,
        pill_usages = report.pill_usages,
        chunks_created = report.chunks_created,
        chunks_updated = report.chunks_updated,
        "aggregation run complete"
    );
    Ok(report)
}
