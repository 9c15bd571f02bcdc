// ── Mnemos: Snapshot Export ────────────────────────────────────────────────
//
// A point-in-time JSON report of the vault: statistics, graph summary, the
// user profile, the active configuration and a few plain-language insights.
// Memory text is left out unless the caller asks for it; profile highlights
// then carry only ids and importance.

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::atoms::config::EngineConfig;
use crate::atoms::error::EngineResult;
use crate::atoms::types::{EngineStats, MemoryId, UserProfile};
use crate::engine::context::MemoryContext;
use crate::engine::profile::user_profile;

/// Shape of the knowledge graph, without the facts themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub active_edges: usize,
    pub inactive_edges: usize,
    /// Distinct entities touched by an active edge.
    pub entities: usize,
    /// Active edges per predicate.
    pub predicates: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMemory {
    pub id: MemoryId,
    pub text: String,
    pub importance: f32,
    pub pinned: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub exported_at: DateTime<Utc>,
    pub stats: EngineStats,
    pub graph: GraphSummary,
    pub profile: UserProfile,
    pub config: EngineConfig,
    pub insights: Vec<String>,
    /// Present only when text export was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memories: Option<Vec<SnapshotMemory>>,
}

pub fn graph_summary(ctx: &MemoryContext) -> GraphSummary {
    let (active_edges, inactive_edges) = ctx.graph.counts();
    let mut entities = BTreeSet::new();
    let mut predicates: BTreeMap<String, usize> = BTreeMap::new();
    for edge in ctx.graph.all_edges().into_iter().filter(|e| e.is_active()) {
        *predicates.entry(edge.predicate).or_default() += 1;
        entities.insert(edge.subject);
        entities.insert(edge.object);
    }
    GraphSummary {
        active_edges,
        inactive_edges,
        entities: entities.len(),
        predicates,
    }
}

/// Short observations about what the vault holds.
pub fn memory_insights(stats: &EngineStats, graph: &GraphSummary, profile: &UserProfile) -> Vec<String> {
    let mut out = Vec::new();
    if stats.records > 0 {
        out.push(format!(
            "{} memories stored (mean importance {:.2})",
            stats.records, stats.mean_importance
        ));
    }
    if stats.pending > 0 {
        out.push(format!("{} memories waiting for an embedding", stats.pending));
    }
    if graph.active_edges > 0 {
        out.push(format!(
            "knowledge graph links {} entities through {} active facts",
            graph.entities, graph.active_edges
        ));
    }
    if let Some((predicate, n)) = graph.predicates.iter().max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0))) {
        out.push(format!("most common relation: {} ({})", predicate.replace('_', " "), n));
    }
    if !profile.preferences.is_empty() {
        out.push(format!("{} known user preferences", profile.preferences.len()));
    }
    if stats.quarantined > 0 {
        out.push(format!("{} rows quarantined as unreadable", stats.quarantined));
    }
    out
}

pub fn build_snapshot(ctx: &MemoryContext, include_text: bool) -> EngineResult<MemorySnapshot> {
    let stats = ctx.stats()?;
    let graph = graph_summary(ctx);
    let mut profile = user_profile(ctx);
    let insights = memory_insights(&stats, &graph, &profile);

    let memories = if include_text {
        // Blobs, not vector records: pending memories are exported too.
        Some(
            ctx.blobs
                .all()
                .into_iter()
                .map(|blob| {
                    let record = ctx.vectors.get(blob.id);
                    SnapshotMemory {
                        id: blob.id,
                        importance: record
                            .as_ref()
                            .map_or(ctx.config.base_importance, |r| r.importance),
                        pinned: record.as_ref().is_some_and(|r| r.pinned),
                        text: blob.text,
                        created_at: blob.created_at,
                    }
                })
                .collect(),
        )
    } else {
        for h in &mut profile.highlights {
            h.text.clear();
        }
        None
    };

    Ok(MemorySnapshot {
        exported_at: Utc::now(),
        stats,
        graph,
        profile,
        config: ctx.config.clone(),
        insights,
        memories,
    })
}

/// Default export location: `snapshot-<timestamp>.json` next to the database.
pub fn default_snapshot_path(ctx: &MemoryContext, at: DateTime<Utc>) -> PathBuf {
    let db = ctx.config.database_path();
    let dir = db.parent().map(Path::to_path_buf).unwrap_or_default();
    dir.join(format!("snapshot-{}.json", at.format("%Y%m%d-%H%M%S")))
}

/// Write a snapshot as pretty JSON. Returns the path written.
pub fn export_snapshot(ctx: &MemoryContext, path: Option<&Path>, include_text: bool) -> EngineResult<PathBuf> {
    let snapshot = build_snapshot(ctx, include_text)?;
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => default_snapshot_path(ctx, snapshot.exported_at),
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(&path)?);
    serde_json::to_writer_pretty(&mut out, &snapshot)?;
    out.flush()?;
    info!(
        "[mnemos:snapshot] Exported {} records to {}{}",
        snapshot.stats.records,
        path.display(),
        if include_text { " (with text)" } else { "" }
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insights_for_empty_vault() {
        let out = memory_insights(&EngineStats::default(), &GraphSummary::default(), &UserProfile::default());
        assert!(out.is_empty());
    }

    #[test]
    fn test_insights_name_top_relation() {
        let stats = EngineStats {
            records: 4,
            mean_importance: 0.5,
            ..Default::default()
        };
        let graph = GraphSummary {
            active_edges: 3,
            inactive_edges: 0,
            entities: 4,
            predicates: BTreeMap::from([("likes".to_string(), 2), ("lives_in".to_string(), 1)]),
        };
        let out = memory_insights(&stats, &graph, &UserProfile::default());
        assert!(out.iter().any(|s| s.starts_with("4 memories")));
        assert!(out.iter().any(|s| s == "most common relation: likes (2)"));
    }
}
