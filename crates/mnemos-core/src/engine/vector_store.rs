// ── Mnemos: Vector Store ───────────────────────────────────────────────────
//
// In-memory index of every embedded memory, write-through to the sealed
// `vector_entries` table. Exact cosine scan; the index is small enough
// (bounded by `max_records`) that brute force beats maintaining an ANN graph.
//
// Responsibilities:
//   - Nearest-neighbour query with the access nudge on every hit
//   - Atomic dedup-or-insert for the write path
//   - Capacity eviction (lowest importance first, protected records spared)
//   - Forwarding pointers left behind by consolidation
//   - Index rebuild from the sealed rows (corrupt rows quarantined)

use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::atoms::config::EngineConfig;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{bounded_boost, LoadReport, MemoryId, MemoryRecord, VectorEntry};
use crate::engine::blobs::BlobStore;
use crate::engine::embedding::cosine_similarity;
use crate::engine::storage::{memory_row_key, Artifact, Persistence};

/// Tunables the store needs from the engine config.
#[derive(Debug, Clone, Copy)]
pub struct VectorParams {
    pub dimension: usize,
    pub max_records: usize,
    pub protected_importance: f32,
    pub access_boost: f32,
}

impl From<&EngineConfig> for VectorParams {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            dimension: cfg.embedding.dimension,
            max_records: cfg.max_records,
            protected_importance: cfg.protected_importance,
            access_boost: cfg.access_boost,
        }
    }
}

/// Result of an insert attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted { id: MemoryId, evicted: Vec<MemoryId> },
    /// An existing record was close enough; it was nudged instead.
    Duplicate { existing: MemoryId, similarity: f32 },
}

#[derive(Default)]
struct VectorIndex {
    records: BTreeMap<MemoryId, MemoryRecord>,
    /// retired id → surviving id (may chain).
    forwards: HashMap<MemoryId, MemoryId>,
}

pub struct VectorStore {
    persist: Arc<Persistence>,
    params: VectorParams,
    index: RwLock<VectorIndex>,
    generation: AtomicU64,
}

/// Score descending; ties → more recently accessed, then lower id.
fn rank(a: &(f32, &MemoryRecord), b: &(f32, &MemoryRecord)) -> Ordering {
    b.0.total_cmp(&a.0)
        .then_with(|| b.1.last_accessed_at.cmp(&a.1.last_accessed_at))
        .then_with(|| a.1.id.cmp(&b.1.id))
}

/// Eviction order: lowest importance, then least recently used, then oldest id.
fn eviction_order(a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
    a.importance
        .total_cmp(&b.importance)
        .then_with(|| a.last_accessed_at.cmp(&b.last_accessed_at))
        .then_with(|| a.id.cmp(&b.id))
}

impl VectorStore {
    pub fn new(persist: Arc<Persistence>, params: VectorParams) -> Self {
        Self {
            persist,
            params,
            index: RwLock::new(VectorIndex::default()),
            generation: AtomicU64::new(0),
        }
    }

    /// Construct and populate from the sealed rows.
    pub fn load(
        persist: Arc<Persistence>,
        params: VectorParams,
        blobs: &BlobStore,
    ) -> EngineResult<(Self, LoadReport)> {
        let store = Self::new(persist, params);
        let report = store.rebuild_index(blobs)?;
        Ok((store, report))
    }

    pub fn dimension(&self) -> usize {
        self.params.dimension
    }

    /// Bumped on every mutation.
    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn check_dimension(&self, v: &[f32]) -> EngineResult<()> {
        if v.len() != self.params.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: self.params.dimension,
                actual: v.len(),
            });
        }
        Ok(())
    }

    fn persist_entry(&self, record: &MemoryRecord) -> EngineResult<()> {
        self.persist.save(
            Artifact::Vectors,
            &memory_row_key(record.id),
            &record.vector_entry(),
        )
    }

    fn is_protected(&self, record: &MemoryRecord) -> bool {
        record.pinned || record.importance > self.params.protected_importance
    }

    // ── Write operations ────────────────────────────────────────────────

    /// Insert unconditionally, then enforce capacity.
    pub fn insert(&self, record: MemoryRecord) -> EngineResult<InsertOutcome> {
        self.check_dimension(&record.embedding)?;
        let mut index = self.index.write();
        self.insert_locked(&mut index, record)
    }

    /// Dedup check and insert under one write lock: two concurrent writers of
    /// the same text cannot both insert.
    pub fn insert_unless_duplicate(
        &self,
        record: MemoryRecord,
        threshold: f32,
    ) -> EngineResult<InsertOutcome> {
        self.check_dimension(&record.embedding)?;
        let mut index = self.index.write();

        let best = index
            .records
            .values()
            .map(|r| (cosine_similarity(&record.embedding, &r.embedding), r))
            .max_by(|a, b| rank(b, a))
            .map(|(s, r)| (s, r.id));

        if let Some((similarity, existing_id)) = best {
            if similarity >= threshold {
                if let Some(rec) = index.records.get_mut(&existing_id) {
                    rec.record_access(self.params.access_boost, Utc::now());
                    let snapshot = rec.clone();
                    self.persist_entry(&snapshot)?;
                }
                self.bump();
                return Ok(InsertOutcome::Duplicate {
                    existing: existing_id,
                    similarity,
                });
            }
        }
        self.insert_locked(&mut index, record)
    }

    fn insert_locked(
        &self,
        index: &mut VectorIndex,
        record: MemoryRecord,
    ) -> EngineResult<InsertOutcome> {
        let id = record.id;
        self.persist_entry(&record)?;
        index.records.insert(id, record);
        self.bump();
        // The record just written is never its own eviction victim.
        let evicted = self.enforce_capacity_locked(index, Some(id))?;
        Ok(InsertOutcome::Inserted { id, evicted })
    }

    /// Drop a record. Returns whether it existed.
    pub fn remove(&self, id: MemoryId) -> EngineResult<bool> {
        let mut index = self.index.write();
        self.persist.remove(Artifact::Vectors, &memory_row_key(id))?;
        let existed = index.records.remove(&id).is_some();
        if existed {
            self.bump();
        }
        Ok(existed)
    }

    /// Apply `f` to a live record and persist the result.
    pub fn update<F>(&self, id: MemoryId, f: F) -> EngineResult<MemoryRecord>
    where
        F: FnOnce(&mut MemoryRecord),
    {
        let mut index = self.index.write();
        let rec = index
            .records
            .get_mut(&id)
            .ok_or(EngineError::UnknownMemory(id))?;
        f(rec);
        rec.importance = rec.importance.clamp(0.0, 1.0);
        let snapshot = rec.clone();
        self.persist_entry(&snapshot)?;
        self.bump();
        Ok(snapshot)
    }

    /// Evict lowest-importance unprotected records until under `max_records`.
    pub fn enforce_capacity(&self) -> EngineResult<Vec<MemoryId>> {
        let mut index = self.index.write();
        self.enforce_capacity_locked(&mut index, None)
    }

    fn enforce_capacity_locked(
        &self,
        index: &mut VectorIndex,
        spare: Option<MemoryId>,
    ) -> EngineResult<Vec<MemoryId>> {
        let excess = index.records.len().saturating_sub(self.params.max_records);
        if excess == 0 {
            return Ok(Vec::new());
        }
        let mut candidates: Vec<&MemoryRecord> = index
            .records
            .values()
            .filter(|r| !self.is_protected(r) && Some(r.id) != spare)
            .collect();
        candidates.sort_by(|a, b| eviction_order(a, b));
        let victims: Vec<MemoryId> = candidates.iter().take(excess).map(|r| r.id).collect();

        for id in &victims {
            self.persist.remove(Artifact::Vectors, &memory_row_key(*id))?;
            index.records.remove(id);
        }
        if victims.len() < excess {
            warn!(
                "[mnemos:vector] {} records over capacity are all protected",
                excess - victims.len()
            );
        }
        if !victims.is_empty() {
            info!("[mnemos:vector] Capacity eviction removed {} records", victims.len());
            self.bump();
        }
        Ok(victims)
    }

    /// Evict unprotected records not accessed since `cutoff`.
    pub fn evict_untouched_since(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<MemoryId>> {
        let mut index = self.index.write();
        let victims: Vec<MemoryId> = index
            .records
            .values()
            .filter(|r| !self.is_protected(r) && r.last_accessed_at < cutoff)
            .map(|r| r.id)
            .collect();
        for id in &victims {
            self.persist.remove(Artifact::Vectors, &memory_row_key(*id))?;
            index.records.remove(id);
        }
        if !victims.is_empty() {
            info!("[mnemos:vector] Age eviction removed {} records", victims.len());
            self.bump();
        }
        Ok(victims)
    }

    /// Replace a consolidation cluster with its survivor in one write-locked step.
    pub fn merge_cluster(&self, survivor: MemoryRecord, retired: &[MemoryId]) -> EngineResult<()> {
        self.check_dimension(&survivor.embedding)?;
        let mut index = self.index.write();
        for id in retired {
            if !index.records.contains_key(id) {
                return Err(EngineError::UnknownMemory(*id));
            }
        }
        self.persist_entry(&survivor)?;
        for id in retired {
            self.persist.db.put_forward(*id, survivor.id)?;
            self.persist.remove(Artifact::Vectors, &memory_row_key(*id))?;
            index.records.remove(id);
            index.forwards.insert(*id, survivor.id);
        }
        index.records.insert(survivor.id, survivor);
        self.bump();
        Ok(())
    }

    /// Record that `retired` now lives on as `survivor`.
    pub fn add_forward(&self, retired: MemoryId, survivor: MemoryId) -> EngineResult<()> {
        let mut index = self.index.write();
        self.persist.db.put_forward(retired, survivor)?;
        index.forwards.insert(retired, survivor);
        self.bump();
        Ok(())
    }

    // ── Read operations ─────────────────────────────────────────────────

    /// Top-`top_k` hits with score ≥ `min_score`. Each hit is nudged
    /// (access count + importance); nudge persistence is best-effort.
    pub fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        min_score: f32,
    ) -> EngineResult<Vec<(MemoryRecord, f32)>> {
        self.check_dimension(vector)?;
        let hits: Vec<(MemoryId, f32)> = {
            let index = self.index.read();
            let mut scored: Vec<(f32, &MemoryRecord)> = index
                .records
                .values()
                .map(|r| (cosine_similarity(vector, &r.embedding), r))
                .filter(|(s, _)| *s >= min_score)
                .collect();
            scored.sort_by(rank);
            scored
                .into_iter()
                .take(top_k)
                .map(|(s, r)| (r.id, s))
                .collect()
        };
        if hits.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut index = self.index.write();
        let mut out = Vec::with_capacity(hits.len());
        for (id, score) in hits {
            // Removed between the scan and the nudge.
            let Some(rec) = index.records.get_mut(&id) else {
                continue;
            };
            rec.record_access(self.params.access_boost, now);
            let snapshot = rec.clone();
            if let Err(e) = self.persist_entry(&snapshot) {
                warn!("[mnemos:vector] Access nudge for {} not persisted: {}", id, e);
            }
            out.push((snapshot, score));
        }
        self.bump();
        Ok(out)
    }

    /// Closest record without touching its statistics.
    pub fn nearest(&self, vector: &[f32]) -> EngineResult<Option<(MemoryId, f32)>> {
        self.check_dimension(vector)?;
        let index = self.index.read();
        Ok(index
            .records
            .values()
            .map(|r| (cosine_similarity(vector, &r.embedding), r))
            .max_by(|a, b| rank(b, a))
            .map(|(s, r)| (r.id, s)))
    }

    pub fn get(&self, id: MemoryId) -> Option<MemoryRecord> {
        self.index.read().records.get(&id).cloned()
    }

    pub fn contains(&self, id: MemoryId) -> bool {
        self.index.read().records.contains_key(&id)
    }

    pub fn snapshot(&self) -> Vec<MemoryRecord> {
        self.index.read().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn forward_count(&self) -> usize {
        self.index.read().forwards.len()
    }

    /// Follow forwarding pointers to a live record id.
    pub fn resolve(&self, id: MemoryId) -> Option<MemoryId> {
        let index = self.index.read();
        let mut current = id;
        // Bounded walk: a chain can never be longer than the table.
        for _ in 0..=index.forwards.len() {
            if index.records.contains_key(&current) {
                return Some(current);
            }
            match index.forwards.get(&current) {
                Some(next) => current = *next,
                None => return None,
            }
        }
        None
    }

    // ── Rebuild ─────────────────────────────────────────────────────────

    /// Reload the index from the sealed rows. Rows that fail to decrypt, or
    /// whose blob is gone, are quarantined and reported.
    pub fn rebuild_index(&self, blobs: &BlobStore) -> EngineResult<LoadReport> {
        let (entries, mut report) = self.persist.load_all::<VectorEntry>(Artifact::Vectors)?;
        let forwards = self.persist.db.load_forwards()?;

        let mut records = BTreeMap::new();
        for entry in entries {
            let row_key = memory_row_key(entry.id);
            if entry.embedding.len() != self.params.dimension {
                self.persist
                    .db
                    .quarantine(Artifact::Vectors, &row_key, "dimension mismatch")?;
                report.loaded -= 1;
                report.quarantined += 1;
                report
                    .warnings
                    .push(format!("vector row {} quarantined: dimension mismatch", row_key));
                continue;
            }
            match blobs.get(entry.id) {
                Some(blob) => {
                    records.insert(entry.id, MemoryRecord::from_parts(blob, entry));
                }
                None => {
                    self.persist
                        .db
                        .quarantine(Artifact::Vectors, &row_key, "no matching blob")?;
                    report.loaded -= 1;
                    report.quarantined += 1;
                    report
                        .warnings
                        .push(format!("vector row {} quarantined: no matching blob", row_key));
                }
            }
        }

        let mut index = self.index.write();
        index.records = records;
        index.forwards = forwards.into_iter().collect();
        self.bump();
        info!(
            "[mnemos:vector] Index rebuilt: {} records, {} forwards, {} quarantined",
            index.records.len(),
            index.forwards.len(),
            report.quarantined
        );
        Ok(report)
    }

    /// Replace the whole index (and its table) with `records`.
    pub fn replace_all(&self, records: Vec<MemoryRecord>) -> EngineResult<()> {
        for r in &records {
            self.check_dimension(&r.embedding)?;
        }
        let mut index = self.index.write();
        let rows: Vec<(String, VectorEntry)> = records
            .iter()
            .map(|r| (memory_row_key(r.id), r.vector_entry()))
            .collect();
        self.persist.replace_all(Artifact::Vectors, &rows)?;
        index.records = records.into_iter().map(|r| (r.id, r)).collect();
        self.bump();
        Ok(())
    }

    /// Apply a multiplicative decay to every record, measured from each
    /// record's decay anchor to `now`. Returns how many changed.
    pub fn decay_all(
        &self,
        now: DateTime<Utc>,
        half_life_hours: f32,
        floor: f32,
    ) -> EngineResult<usize> {
        let mut index = self.index.write();
        let mut changed = 0;
        for rec in index.records.values_mut() {
            let elapsed_hours = (now - rec.decay_anchor()).num_milliseconds() as f64 / 3_600_000.0;
            if elapsed_hours <= 0.0 {
                continue;
            }
            let factor = 0.5f64.powf(elapsed_hours / half_life_hours as f64) as f32;
            let decayed = if rec.importance <= floor {
                rec.importance
            } else {
                (rec.importance * factor).max(floor)
            };
            rec.last_decayed_at = Some(now);
            if (decayed - rec.importance).abs() > f32::EPSILON {
                rec.importance = decayed;
                changed += 1;
            }
            let snapshot = rec.clone();
            self.persist_entry(&snapshot)?;
        }
        if changed > 0 {
            self.bump();
        }
        Ok(changed)
    }

    /// Raise importance the same way an access does, without counting an access.
    pub fn boost(&self, id: MemoryId, fraction: f32) -> EngineResult<MemoryRecord> {
        self.update(id, |r| r.importance = bounded_boost(r.importance, fraction))
    }
}
