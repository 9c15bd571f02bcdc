// ── Mnemos: Memory Manager (write path) ────────────────────────────────────
//
// remember():
//   1. normalize + validate
//   2. embed (timeout-bounded); failure → EmbeddingUnavailable, nothing written
//   3. dedup-or-insert under the vector store's write lock
//   4. seal the blob
//   5. extract facts → graph upserts with provenance = new id
//
// Also the degraded write (keyword-only, embedded later by reembed_pending),
// reinforce/pin, and the two recovery paths that rebuild the vector index
// and the graph from the blob store.

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{
    KnowledgeEdge, LoadReport, MemoryBlob, MemoryId, MemoryRecord, TurnId,
};
use crate::engine::context::MemoryContext;
use crate::engine::embedding::embed_checked;
use crate::engine::vector_store::InsertOutcome;

/// Upper bound on one remembered turn, in characters.
const MAX_TEXT_CHARS: usize = 16_000;

/// Trim and collapse internal whitespace.
pub fn normalize_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn validated(raw: &str) -> EngineResult<String> {
    let text = normalize_text(raw);
    if text.is_empty() {
        return Err(EngineError::InvalidInput("memory text is empty".into()));
    }
    if text.chars().count() > MAX_TEXT_CHARS {
        return Err(EngineError::InvalidInput(format!(
            "memory text exceeds {} characters",
            MAX_TEXT_CHARS
        )));
    }
    Ok(text)
}

/// Store a conversational turn. Returns the id of the new record, or of the
/// existing record it duplicates.
pub async fn remember(
    ctx: &MemoryContext,
    text: &str,
    source_turn_id: impl Into<TurnId>,
) -> EngineResult<MemoryId> {
    let text = validated(text)?;
    let embedding = embed_checked(
        ctx.embedder.as_ref(),
        &text,
        ctx.vectors.dimension(),
        ctx.embedding_timeout(),
    )
    .await?;

    let id = ctx.persist.db.next_memory_id()?;
    let now = Utc::now();
    let record = MemoryRecord::new(
        id,
        text.clone(),
        embedding,
        source_turn_id.into(),
        ctx.config.base_importance,
        now,
    );
    // Seal the blob before the vector entry exists: maintenance only ever
    // sees records whose blob is already in place.
    ctx.blobs.put(record.blob())?;

    let outcome = match ctx
        .vectors
        .insert_unless_duplicate(record, ctx.config.duplicate_threshold)
    {
        Ok(outcome) => outcome,
        Err(e) => {
            discard_blob(ctx, id);
            return Err(e);
        }
    };

    match outcome {
        InsertOutcome::Duplicate {
            existing,
            similarity,
        } => {
            discard_blob(ctx, id);
            info!(
                "[mnemos:write] Turn deduplicated into {} (sim {:.3})",
                existing, similarity
            );
            Ok(existing)
        }
        InsertOutcome::Inserted { id, evicted } => {
            drop_evicted(ctx, &evicted);
            let facts = extract_facts(ctx, id, &text, now);
            info!(
                "[mnemos:write] Stored {} ({} chars, {} facts)",
                id,
                text.chars().count(),
                facts
            );
            Ok(id)
        }
    }
}

fn discard_blob(ctx: &MemoryContext, id: MemoryId) {
    if let Err(e) = ctx.blobs.remove(id) {
        warn!("[mnemos:write] Unused blob {} not removed: {}", id, e);
    }
}

/// Degraded write: seal the text and its facts without a vector. The record
/// is pending until `reembed_pending` succeeds; keyword and graph recall see
/// it meanwhile.
pub fn remember_keyword_only(
    ctx: &MemoryContext,
    text: &str,
    source_turn_id: impl Into<TurnId>,
) -> EngineResult<MemoryId> {
    let text = validated(text)?;
    if let Some(existing) = ctx.blobs.all().into_iter().find(|b| b.text == text) {
        return Ok(existing.id);
    }
    let id = ctx.persist.db.next_memory_id()?;
    let now = Utc::now();
    ctx.blobs.put(MemoryBlob {
        id,
        text: text.clone(),
        source_turn_id: source_turn_id.into(),
        created_at: now,
        embedded: false,
    })?;
    let facts = extract_facts(ctx, id, &text, now);
    info!("[mnemos:write] Stored pending {} ({} facts)", id, facts);
    Ok(id)
}

/// Upsert extracted facts with provenance = `id`. Graph failures are logged,
/// not returned: the graph can always be rebuilt from the blobs.
fn extract_facts(ctx: &MemoryContext, id: MemoryId, text: &str, at: DateTime<Utc>) -> usize {
    let mut stored = 0;
    for fact in ctx.extractor.extract(text) {
        let edge = KnowledgeEdge::new(
            &fact.subject,
            &fact.predicate,
            &fact.object,
            fact.confidence,
            id,
            at,
        );
        match ctx.graph.upsert(edge) {
            Ok(_) => stored += 1,
            Err(e) => warn!("[mnemos:write] Fact from {} not stored: {}", id, e),
        }
    }
    stored
}

/// Evicted records lose their blob; graph edges keep the id as provenance.
fn drop_evicted(ctx: &MemoryContext, evicted: &[MemoryId]) {
    for id in evicted {
        if let Err(e) = ctx.blobs.remove(*id) {
            warn!("[mnemos:write] Blob of evicted {} not removed: {}", id, e);
        }
    }
}

/// Outcome of `reembed_pending`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReembedReport {
    pub embedded: usize,
    /// Pending records that turned out to duplicate an existing one.
    pub merged: usize,
    /// Still pending (provider went away mid-run).
    pub remaining: usize,
}

/// Embed every pending blob. Stops at the first provider failure and
/// reports what is left.
pub async fn reembed_pending(ctx: &MemoryContext) -> EngineResult<ReembedReport> {
    let pending = ctx.blobs.pending();
    let mut report = ReembedReport {
        remaining: pending.len(),
        ..Default::default()
    };

    for blob in pending {
        let embedding = match embed_checked(
            ctx.embedder.as_ref(),
            &blob.text,
            ctx.vectors.dimension(),
            ctx.embedding_timeout(),
        )
        .await
        {
            Ok(v) => v,
            Err(e) if e.is_degradable() => {
                warn!("[mnemos:write] Re-embedding paused: {}", e);
                break;
            }
            Err(e) => return Err(e),
        };

        let mut record = MemoryRecord::new(
            blob.id,
            blob.text.clone(),
            embedding,
            blob.source_turn_id.clone(),
            ctx.config.base_importance,
            blob.created_at,
        );
        record.last_accessed_at = Utc::now();

        match ctx
            .vectors
            .insert_unless_duplicate(record, ctx.config.duplicate_threshold)?
        {
            InsertOutcome::Duplicate { existing, .. } => {
                ctx.graph.reassign_provenance(blob.id, existing)?;
                ctx.vectors.add_forward(blob.id, existing)?;
                ctx.blobs.remove(blob.id)?;
                report.merged += 1;
            }
            InsertOutcome::Inserted { id, evicted } => {
                ctx.blobs.mark_embedded(id)?;
                drop_evicted(ctx, &evicted);
                report.embedded += 1;
            }
        }
        report.remaining -= 1;
    }
    info!(
        "[mnemos:write] Re-embed: {} embedded, {} merged, {} remaining",
        report.embedded, report.merged, report.remaining
    );
    Ok(report)
}

/// Adjust importance by `delta`, clamped to [0, 1]. Retired ids resolve
/// through consolidation forwarding.
pub fn reinforce(ctx: &MemoryContext, id: MemoryId, delta: f32) -> EngineResult<MemoryRecord> {
    if !delta.is_finite() {
        return Err(EngineError::InvalidInput("delta must be finite".into()));
    }
    let live = resolve_live(ctx, id)?;
    let rec = ctx.vectors.update(live, |r| {
        r.importance = (r.importance + delta).clamp(0.0, 1.0);
    })?;
    info!(
        "[mnemos:write] Reinforced {} by {:+.3} → {:.3}",
        live, delta, rec.importance
    );
    Ok(rec)
}

/// Pin or unpin a record (pinned records are never evicted).
pub fn pin(ctx: &MemoryContext, id: MemoryId, pinned: bool) -> EngineResult<MemoryRecord> {
    let live = resolve_live(ctx, id)?;
    ctx.vectors.update(live, |r| r.pinned = pinned)
}

fn resolve_live(ctx: &MemoryContext, id: MemoryId) -> EngineResult<MemoryId> {
    match ctx.vectors.resolve(id) {
        Some(live) => Ok(live),
        None if ctx.blobs.contains(id) => Err(EngineError::InvalidInput(format!(
            "{} is pending an embedding",
            id
        ))),
        None => Err(EngineError::UnknownMemory(id)),
    }
}

/// Recreate the vector artifact by re-embedding every blob. Statistics of
/// records still in the index are kept. Nothing is replaced unless every
/// blob embeds.
pub async fn rebuild_vector_index_from_blobs(ctx: &MemoryContext) -> EngineResult<LoadReport> {
    let blobs = ctx.blobs.all();
    let mut records = Vec::with_capacity(blobs.len());
    for blob in &blobs {
        let embedding = embed_checked(
            ctx.embedder.as_ref(),
            &blob.text,
            ctx.vectors.dimension(),
            ctx.embedding_timeout(),
        )
        .await?;
        let record = match ctx.vectors.get(blob.id) {
            Some(mut existing) => {
                existing.embedding = embedding;
                existing
            }
            None => MemoryRecord::new(
                blob.id,
                blob.text.clone(),
                embedding,
                blob.source_turn_id.clone(),
                ctx.config.base_importance,
                blob.created_at,
            ),
        };
        records.push(record);
    }

    let loaded = records.len();
    ctx.vectors.replace_all(records)?;
    for blob in &blobs {
        ctx.blobs.mark_embedded(blob.id)?;
    }
    let evicted = ctx.vectors.enforce_capacity()?;
    drop_evicted(ctx, &evicted);
    info!("[mnemos:write] Vector index rebuilt from {} blobs", loaded);
    Ok(LoadReport {
        loaded,
        ..Default::default()
    })
}

/// Recreate the graph by re-running extraction over every blob in id order.
pub fn rebuild_graph_from_blobs(ctx: &MemoryContext) -> EngineResult<LoadReport> {
    ctx.graph.reset()?;
    let mut report = LoadReport::default();
    for blob in ctx.blobs.all() {
        report.loaded += extract_facts(ctx, blob.id, &blob.text, blob.created_at);
    }
    info!("[mnemos:write] Graph rebuilt: {} facts", report.loaded);
    Ok(report)
}
