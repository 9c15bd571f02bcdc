// ── Mnemos: Consolidation, Decay & Eviction ────────────────────────────────
//
// Maintenance is an explicit task: an external scheduler asks
// `MaintenanceTask::is_due` and calls `run`. One run has three phases,
// all under a wall-clock budget checked between units of work:
//
//   1. Consolidation – union-find clusters of records with pairwise cosine
//                      ≥ merge_threshold, each collapsed into its most
//                      important member; retired ids leave forwarding pointers
//   2. Decay         – importance · 0.5^(Δt / half-life), floored
//   3. Eviction      – capacity ceiling, then optional max-age sweep
//
// A failing cluster is logged and skipped; it never aborts the run.

use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{MaintenanceReport, MemoryId, MemoryRecord};
use crate::engine::context::MemoryContext;
use crate::engine::embedding::{cosine_similarity, normalize};

// ═════════════════════════════════════════════════════════════════════════════
// Scheduling
// ═════════════════════════════════════════════════════════════════════════════

/// Tracks when maintenance last ran.
#[derive(Debug, Clone)]
pub struct MaintenanceTask {
    interval: chrono::Duration,
    last_run: Option<DateTime<Utc>>,
}

impl MaintenanceTask {
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval: chrono::Duration::seconds(interval_secs as i64),
            last_run: None,
        }
    }

    pub fn from_context(ctx: &MemoryContext) -> Self {
        Self::new(ctx.config.maintenance.interval_secs)
    }

    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        self.last_run
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now - last >= self.interval,
        }
    }

    /// Run all phases with the configured time budget.
    pub fn run(&mut self, ctx: &MemoryContext) -> MaintenanceReport {
        let budget = Duration::from_millis(ctx.config.maintenance.time_budget_ms);
        let now = Utc::now();
        let report = run_maintenance(ctx, now, Instant::now() + budget);
        self.last_run = Some(now);
        report
    }
}

/// One maintenance pass. `now` is the logical time for decay and age
/// eviction; `deadline` bounds the wall-clock time spent.
pub fn run_maintenance(ctx: &MemoryContext, now: DateTime<Utc>, deadline: Instant) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    consolidate(ctx, deadline, &mut report);
    if report.aborted {
        info!("[mnemos:maintenance] Budget exhausted during consolidation");
        return report;
    }

    if Instant::now() >= deadline {
        report.aborted = true;
        return report;
    }
    match ctx.vectors.decay_all(
        now,
        ctx.config.decay_half_life_hours,
        ctx.config.importance_floor,
    ) {
        Ok(n) => report.records_decayed = n,
        Err(e) => {
            warn!("[mnemos:maintenance] Decay failed: {}", e);
            report.warnings.push(format!("decay failed: {}", e));
        }
    }

    if Instant::now() >= deadline {
        report.aborted = true;
        return report;
    }
    evict(ctx, now, &mut report);

    info!(
        "[mnemos:maintenance] Merged {} clusters ({} retired, {} failed), decayed {}, evicted {}",
        report.clusters_merged,
        report.records_retired,
        report.failed_clusters,
        report.records_decayed,
        report.records_evicted
    );
    report
}

// ═════════════════════════════════════════════════════════════════════════════
// Phase 1: Consolidation
// ═════════════════════════════════════════════════════════════════════════════

fn consolidate(ctx: &MemoryContext, deadline: Instant, report: &mut MaintenanceReport) {
    let records = ctx.vectors.snapshot();
    let Some(clusters) = build_clusters(&records, ctx.config.merge_threshold, deadline) else {
        report.aborted = true;
        return;
    };

    for cluster in clusters {
        if Instant::now() >= deadline {
            report.aborted = true;
            return;
        }
        match merge_cluster(ctx, &cluster) {
            Ok(retired) => {
                report.clusters_merged += 1;
                report.records_retired += retired;
            }
            Err(e) => {
                warn!(
                    "[mnemos:maintenance] Cluster of {} records not merged: {}",
                    cluster.len(),
                    e
                );
                report.failed_clusters += 1;
                report.warnings.push(format!("cluster merge failed: {}", e));
            }
        }
    }
}

/// Connected components (size ≥ 2) of the "similar enough" relation.
/// Returns `None` if the deadline passes mid-scan.
fn build_clusters(records: &[MemoryRecord], threshold: f32, deadline: Instant) -> Option<Vec<Vec<MemoryId>>> {
    let n = records.len();
    let mut parent: Vec<usize> = (0..n).collect();
    let mut rank: Vec<usize> = vec![0; n];

    for i in 0..n {
        if Instant::now() >= deadline {
            return None;
        }
        for j in (i + 1)..n {
            if cosine_similarity(&records[i].embedding, &records[j].embedding) >= threshold {
                union(&mut parent, &mut rank, i, j);
            }
        }
    }

    let mut components: HashMap<usize, Vec<MemoryId>> = HashMap::new();
    for i in 0..n {
        let root = find(&mut parent, i);
        components.entry(root).or_default().push(records[i].id);
    }
    let mut clusters: Vec<Vec<MemoryId>> = components
        .into_values()
        .filter(|ids| ids.len() >= 2)
        .map(|mut ids| {
            ids.sort();
            ids
        })
        .collect();
    clusters.sort();
    Some(clusters)
}

fn find(parent: &mut [usize], i: usize) -> usize {
    if parent[i] != i {
        parent[i] = find(parent, parent[i]);
    }
    parent[i]
}

fn union(parent: &mut [usize], rank: &mut [usize], a: usize, b: usize) {
    let ra = find(parent, a);
    let rb = find(parent, b);
    if ra == rb {
        return;
    }
    match rank[ra].cmp(&rank[rb]) {
        std::cmp::Ordering::Less => parent[ra] = rb,
        std::cmp::Ordering::Greater => parent[rb] = ra,
        std::cmp::Ordering::Equal => {
            parent[rb] = ra;
            rank[ra] += 1;
        }
    }
}

/// Most important member wins; ties go to the lowest id.
fn pick_survivor(members: &[MemoryRecord]) -> Option<&MemoryRecord> {
    members.iter().max_by(|a, b| {
        a.importance
            .total_cmp(&b.importance)
            .then_with(|| b.id.cmp(&a.id))
    })
}

/// Access-weighted mean of the members' embeddings, renormalized.
fn weighted_centroid(members: &[MemoryRecord]) -> EngineResult<Vec<f32>> {
    let dim = members.first().map(|m| m.embedding.len()).unwrap_or(0);
    let mut centroid = vec![0.0f32; dim];
    for m in members {
        let w = (m.access_count as f32) + 1.0;
        for (c, x) in centroid.iter_mut().zip(&m.embedding) {
            *c += w * x;
        }
    }
    normalize(centroid)
}

/// Collapse one cluster into its survivor. Returns how many ids were retired.
fn merge_cluster(ctx: &MemoryContext, ids: &[MemoryId]) -> EngineResult<usize> {
    // Re-read: records may have changed since the snapshot was taken.
    let members: Vec<MemoryRecord> = ids.iter().filter_map(|id| ctx.vectors.get(*id)).collect();
    if members.len() < 2 {
        return Ok(0);
    }
    let base = pick_survivor(&members)
        .ok_or_else(|| EngineError::Other("empty cluster".into()))?;

    let mut survivor = base.clone();
    survivor.embedding = weighted_centroid(&members)?;
    survivor.importance = members.iter().map(|m| m.importance).fold(0.0, f32::max);
    survivor.access_count = members
        .iter()
        .fold(0u32, |acc, m| acc.saturating_add(m.access_count));
    survivor.last_accessed_at = members
        .iter()
        .map(|m| m.last_accessed_at)
        .max()
        .unwrap_or(survivor.last_accessed_at);
    survivor.pinned = members.iter().any(|m| m.pinned);

    let retired: Vec<MemoryId> = members
        .iter()
        .map(|m| m.id)
        .filter(|id| *id != survivor.id)
        .collect();
    let survivor_id = survivor.id;

    ctx.vectors.merge_cluster(survivor, &retired)?;
    for id in &retired {
        ctx.graph.reassign_provenance(*id, survivor_id)?;
        ctx.blobs.remove(*id)?;
    }
    info!(
        "[mnemos:maintenance] Merged {} records into {}",
        retired.len(),
        survivor_id
    );
    Ok(retired.len())
}

// ═════════════════════════════════════════════════════════════════════════════
// Phase 3: Eviction
// ═════════════════════════════════════════════════════════════════════════════

fn evict(ctx: &MemoryContext, now: DateTime<Utc>, report: &mut MaintenanceReport) {
    let mut evicted = match ctx.vectors.enforce_capacity() {
        Ok(ids) => ids,
        Err(e) => {
            report.warnings.push(format!("capacity eviction failed: {}", e));
            Vec::new()
        }
    };
    if let Some(days) = ctx.config.maintenance.max_age_days {
        let cutoff = now - chrono::Duration::days(days as i64);
        match ctx.vectors.evict_untouched_since(cutoff) {
            Ok(ids) => evicted.extend(ids),
            Err(e) => report.warnings.push(format!("age eviction failed: {}", e)),
        }
    }
    for id in &evicted {
        if let Err(e) = ctx.blobs.remove(*id) {
            warn!("[mnemos:maintenance] Blob of evicted {} not removed: {}", id, e);
        }
    }
    report.records_evicted = evicted.len();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(id: u64, v: Vec<f32>, importance: f32, access: u32) -> MemoryRecord {
        let mut r = MemoryRecord::new(MemoryId(id), format!("m{}", id), v, "t".into(), importance, Utc::now());
        r.access_count = access;
        r
    }

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn test_union_find() {
        let mut parent: Vec<usize> = (0..5).collect();
        let mut rank = vec![0; 5];
        union(&mut parent, &mut rank, 0, 1);
        union(&mut parent, &mut rank, 2, 3);
        union(&mut parent, &mut rank, 1, 3);
        assert_eq!(find(&mut parent, 0), find(&mut parent, 2));
        assert_ne!(find(&mut parent, 0), find(&mut parent, 4));
    }

    #[test]
    fn test_build_clusters_two_groups() {
        let records = vec![
            rec(1, vec![1.0, 0.0], 0.5, 0),
            rec(2, vec![0.99, 0.14], 0.5, 0),
            rec(3, vec![0.0, 1.0], 0.5, 0),
            rec(4, vec![0.14, 0.99], 0.5, 0),
            rec(5, vec![-1.0, 0.0], 0.5, 0),
        ];
        let clusters = build_clusters(&records, 0.95, far_future()).unwrap();
        assert_eq!(
            clusters,
            vec![vec![MemoryId(1), MemoryId(2)], vec![MemoryId(3), MemoryId(4)]]
        );
    }

    #[test]
    fn test_build_clusters_respects_deadline() {
        let records = vec![rec(1, vec![1.0, 0.0], 0.5, 0), rec(2, vec![1.0, 0.0], 0.5, 0)];
        let past = Instant::now() - Duration::from_millis(1);
        assert!(build_clusters(&records, 0.9, past).is_none());
    }

    #[test]
    fn test_survivor_is_most_important_then_lowest_id() {
        let members = vec![
            rec(3, vec![1.0, 0.0], 0.7, 0),
            rec(1, vec![1.0, 0.0], 0.7, 0),
            rec(2, vec![1.0, 0.0], 0.4, 0),
        ];
        assert_eq!(pick_survivor(&members).unwrap().id, MemoryId(1));
    }

    #[test]
    fn test_centroid_weighted_by_access() {
        let members = vec![rec(1, vec![1.0, 0.0], 0.5, 3), rec(2, vec![0.0, 1.0], 0.5, 0)];
        let c = weighted_centroid(&members).unwrap();
        assert!(c[0] > c[1]);
        let norm: f32 = c.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_task_due_after_interval() {
        let mut task = MaintenanceTask::new(60);
        let now = Utc::now();
        assert!(task.is_due(now));
        task.last_run = Some(now);
        assert!(!task.is_due(now + chrono::Duration::seconds(30)));
        assert!(task.is_due(now + chrono::Duration::seconds(61)));
    }
}
