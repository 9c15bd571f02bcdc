// ── Mnemos: Retrieval Planner ──────────────────────────────────────────────
//
// recall() fuses two sources into one ranked, budget-limited bundle:
//
//   vector hits ──► top N seeds ──► entities in their provenance ──► BFS
//        │                                                           │
//        └──────────── composite score, rank, greedy budget ◄────────┘
//
// score = w_sim·similarity + w_imp·importance + w_conf·confidence + w_rec·recency
//
// Memories carry confidence 1.0. A fact inherits similarity / hops and the
// importance of the memory that seeded it. Recency is 0.5^(age / half-life).
//
// recall never fails: problems become warnings on the bundle. When the
// embedder is unavailable it falls back to keyword overlap over the stored
// texts plus facts about entities named in the query (degraded = true).

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::atoms::config::FusionWeights;
use crate::atoms::types::{
    ContextBundle, ContextItem, ContextSource, EdgeKey, ItemKind, KnowledgeEdge, MemoryId, MemoryRecord,
    RecallOptions,
};
use crate::engine::context::MemoryContext;
use crate::engine::embedding::{content_tokens, embed_checked};
use crate::engine::manager::normalize_text;

/// `0.5^(age / half_life)`, 1.0 for anything from the future.
pub fn recency_score(at: DateTime<Utc>, now: DateTime<Utc>, half_life_hours: f32) -> f32 {
    let age_hours = (now - at).num_milliseconds() as f64 / 3_600_000.0;
    if age_hours <= 0.0 || half_life_hours <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(age_hours / half_life_hours as f64) as f32
}

fn composite(w: &FusionWeights, similarity: f32, importance: f32, confidence: f32, recency: f32) -> f32 {
    w.similarity * similarity + w.importance * importance + w.confidence * confidence + w.recency * recency
}

/// Score descending, then recency, then memories (by id) before facts (by key).
fn rank_items(a: &ContextItem, b: &ContextItem) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.recency.total_cmp(&a.recency))
        .then_with(|| match (&a.source, &b.source) {
            (ContextSource::Memory { id: x, .. }, ContextSource::Memory { id: y, .. }) => x.cmp(y),
            (ContextSource::Memory { .. }, ContextSource::Fact { .. }) => Ordering::Less,
            (ContextSource::Fact { .. }, ContextSource::Memory { .. }) => Ordering::Greater,
            (ContextSource::Fact { key: x, .. }, ContextSource::Fact { key: y, .. }) => x.cmp(y),
        })
}

/// Greedy fill by rank; items that do not fit are skipped, never truncated.
fn fill_budget(items: Vec<ContextItem>, budget: usize) -> (Vec<ContextItem>, usize) {
    let mut used = 0;
    let mut kept = Vec::new();
    for item in items {
        let cost = item.content.chars().count();
        if used + cost <= budget {
            used += cost;
            kept.push(item);
        }
    }
    (kept, used)
}

/// A seed for graph expansion: a memory and how well it matched.
struct Seed {
    id: MemoryId,
    similarity: f32,
    importance: f32,
}

/// Collects fact candidates, keeping the best-scoring path to each edge.
struct FactCollector<'a> {
    ctx: &'a MemoryContext,
    now: DateTime<Utc>,
    best: HashMap<EdgeKey, ContextItem>,
}

impl<'a> FactCollector<'a> {
    fn new(ctx: &'a MemoryContext, now: DateTime<Utc>) -> Self {
        Self {
            ctx,
            now,
            best: HashMap::new(),
        }
    }

    fn expand(&mut self, entity: &str, seed: &Seed, max_hops: usize) {
        for hit in self.ctx.graph.query_by_entity(entity, max_hops) {
            let similarity = seed.similarity / hit.hops.max(1) as f32;
            let item = self.fact_item(&hit.edge, similarity, seed, hit.hops);
            let key = hit.edge.key();
            let better = self
                .best
                .get(&key)
                .map_or(true, |prev| rank_items(&item, prev) == Ordering::Less);
            if better {
                self.best.insert(key, item);
            }
        }
    }

    fn fact_item(&self, edge: &KnowledgeEdge, similarity: f32, seed: &Seed, hops: usize) -> ContextItem {
        let cfg = &self.ctx.config;
        let recency = recency_score(edge.updated_at, self.now, cfg.decay_half_life_hours);
        ContextItem {
            content: edge.sentence(),
            score: composite(&cfg.weights, similarity, seed.importance, edge.confidence, recency),
            recency,
            source: ContextSource::Fact {
                key: edge.key(),
                confidence: edge.confidence,
                hops,
                via: seed.id,
            },
        }
    }

    fn into_items(self) -> Vec<ContextItem> {
        self.best.into_values().collect()
    }
}

/// Reconstruct context for a query.
pub async fn recall(ctx: &MemoryContext, query: &str, opts: RecallOptions) -> ContextBundle {
    let query = normalize_text(query);
    if query.is_empty() {
        return ContextBundle {
            warnings: vec!["empty query".into()],
            ..Default::default()
        };
    }

    let embedded = embed_checked(
        ctx.embedder.as_ref(),
        &query,
        ctx.vectors.dimension(),
        ctx.embedding_timeout(),
    )
    .await;

    let (candidates, degraded, warnings) = match embedded {
        Ok(vector) => match ctx.vectors.query(&vector, opts.top_k, ctx.config.min_similarity) {
            Ok(hits) => (vector_candidates(ctx, hits, &opts), false, Vec::new()),
            Err(e) => {
                warn!("[mnemos:recall] Vector query failed: {}", e);
                let w = vec![format!("vector query failed: {}; keyword recall used", e)];
                (keyword_candidates(ctx, &query, &opts), true, w)
            }
        },
        Err(e) => {
            warn!("[mnemos:recall] Degraded recall: {}", e);
            let w = vec![format!("embedding unavailable: {}; keyword recall used", e)];
            (keyword_candidates(ctx, &query, &opts), true, w)
        }
    };

    let mut ranked = candidates;
    ranked.sort_by(rank_items);
    let total = ranked.len();
    let (items, used) = fill_budget(ranked, opts.context_budget);

    info!(
        "[mnemos:recall] {} of {} candidates in bundle ({} / {} chars, {} facts{})",
        items.len(),
        total,
        used,
        opts.context_budget,
        items.iter().filter(|i| i.kind() == ItemKind::Fact).count(),
        if degraded { ", degraded" } else { "" }
    );

    ContextBundle {
        items,
        degraded,
        warnings,
        budget_used: used,
        candidates: total,
    }
}

fn vector_candidates(
    ctx: &MemoryContext,
    hits: Vec<(MemoryRecord, f32)>,
    opts: &RecallOptions,
) -> Vec<ContextItem> {
    let now = Utc::now();
    let cfg = &ctx.config;
    let mut items = Vec::with_capacity(hits.len());
    let mut facts = FactCollector::new(ctx, now);

    for (rank, (record, similarity)) in hits.into_iter().enumerate() {
        let recency = recency_score(record.created_at, now, cfg.decay_half_life_hours);
        if rank < cfg.graph_seed_count {
            let seed = Seed {
                id: record.id,
                similarity,
                importance: record.importance,
            };
            for entity in ctx.graph.entities_for_memory(record.id) {
                facts.expand(&entity, &seed, opts.max_hops);
            }
        }
        items.push(ContextItem {
            score: composite(&cfg.weights, similarity, record.importance, 1.0, recency),
            recency,
            source: ContextSource::Memory {
                id: record.id,
                similarity,
                importance: record.importance,
            },
            content: record.text,
        });
    }
    items.extend(facts.into_items());
    items
}

/// Jaccard overlap of content tokens.
fn keyword_overlap(query: &HashSet<String>, text: &str) -> f32 {
    let doc: HashSet<String> = content_tokens(text).into_iter().collect();
    if query.is_empty() || doc.is_empty() {
        return 0.0;
    }
    let inter = query.intersection(&doc).count();
    let union = query.union(&doc).count();
    inter as f32 / union as f32
}

fn keyword_candidates(ctx: &MemoryContext, query: &str, opts: &RecallOptions) -> Vec<ContextItem> {
    let now = Utc::now();
    let cfg = &ctx.config;
    let q: HashSet<String> = content_tokens(query).into_iter().collect();

    let mut scored: Vec<(f32, MemoryId, String, f32, DateTime<Utc>)> = ctx
        .blobs
        .all()
        .into_iter()
        .filter_map(|blob| {
            let overlap = keyword_overlap(&q, &blob.text);
            if overlap <= 0.0 {
                return None;
            }
            let importance = ctx
                .vectors
                .get(blob.id)
                .map(|r| r.importance)
                .unwrap_or(cfg.base_importance);
            Some((overlap, blob.id, blob.text, importance, blob.created_at))
        })
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.truncate(opts.top_k);

    let mut items: Vec<ContextItem> = scored
        .into_iter()
        .map(|(overlap, id, text, importance, created_at)| {
            let recency = recency_score(created_at, now, cfg.decay_half_life_hours);
            ContextItem {
                content: text,
                score: composite(&cfg.weights, overlap, importance, 1.0, recency),
                recency,
                source: ContextSource::Memory {
                    id,
                    similarity: overlap,
                    importance,
                },
            }
        })
        .collect();

    // Entities named in the query seed the graph directly.
    let mut facts = FactCollector::new(ctx, now);
    for entity in ctx.graph.known_entities_in(query) {
        // Attribute the facts to a memory that stated one of them; an entity
        // with no provenance-bearing active edge contributes nothing.
        let Some(via) = ctx
            .graph
            .query_by_entity(&entity, 1)
            .into_iter()
            .find_map(|h| h.edge.provenance.iter().next().copied())
        else {
            continue;
        };
        let seed = Seed {
            id: via,
            similarity: 1.0,
            importance: ctx
                .vectors
                .get(via)
                .map(|r| r.importance)
                .unwrap_or(cfg.base_importance),
        };
        facts.expand(&entity, &seed, opts.max_hops);
    }
    items.extend(facts.into_items());
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(id: u64, content: &str, score: f32, recency: f32) -> ContextItem {
        ContextItem {
            content: content.into(),
            score,
            recency,
            source: ContextSource::Memory {
                id: MemoryId(id),
                similarity: score,
                importance: 0.5,
            },
        }
    }

    fn fact(obj: &str, score: f32, recency: f32) -> ContextItem {
        ContextItem {
            content: format!("user likes {}", obj),
            score,
            recency,
            source: ContextSource::Fact {
                key: EdgeKey::new("user", "likes", obj),
                confidence: 0.8,
                hops: 1,
                via: MemoryId(1),
            },
        }
    }

    #[test]
    fn test_recency_halves_per_half_life() {
        let now = Utc::now();
        let r = recency_score(now - chrono::Duration::hours(10), now, 10.0);
        assert!((r - 0.5).abs() < 1e-4);
        assert_eq!(recency_score(now + chrono::Duration::hours(1), now, 10.0), 1.0);
    }

    #[test]
    fn test_rank_tie_breaks() {
        let mut items = vec![
            fact("tea", 0.5, 0.9),
            memory(7, "b", 0.5, 0.9),
            memory(3, "a", 0.5, 0.9),
            memory(9, "c", 0.5, 1.0),
            memory(1, "top", 0.9, 0.1),
        ];
        items.sort_by(rank_items);
        let order: Vec<&str> = items.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(order, vec!["top", "c", "a", "b", "user likes tea"]);
    }

    #[test]
    fn test_budget_skips_without_truncating() {
        let items = vec![
            memory(1, "aaaaaaaaaa", 0.9, 1.0),
            memory(2, "bbbbbbbbbbbbbbbbbbbb", 0.8, 1.0),
            memory(3, "ccccc", 0.7, 1.0),
        ];
        let (kept, used) = fill_budget(items, 16);
        let contents: Vec<&str> = kept.iter().map(|i| i.content.as_str()).collect();
        assert_eq!(contents, vec!["aaaaaaaaaa", "ccccc"]);
        assert_eq!(used, 15);
    }

    #[test]
    fn test_keyword_overlap() {
        let q: HashSet<String> = content_tokens("favorite color").into_iter().collect();
        assert!(keyword_overlap(&q, "User's favorite color is blue") > 0.0);
        assert_eq!(keyword_overlap(&q, "the train leaves at noon"), 0.0);
    }
}
