// ── Mnemos Atoms: Memory System Types ──────────────────────────────────────
//
// Pure data types for the memory engine (no logic beyond small invariant
// helpers, no DB access, no I/O). Stores and pipelines live in engine/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 1: Identifiers
// ═══════════════════════════════════════════════════════════════════════════

/// Stable memory id. Assigned monotonically at creation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem-{}", self.0)
    }
}

impl FromStr for MemoryId {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix("mem-").unwrap_or(s.trim());
        digits
            .parse::<u64>()
            .map(MemoryId)
            .map_err(|_| format!("Not a memory id: {}", s))
    }
}

/// Back-reference to the conversation turn that produced a memory.
/// Opaque to the engine; never dereferenced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(pub String);

impl From<&str> for TurnId {
    fn from(s: &str) -> Self {
        TurnId(s.to_string())
    }
}

impl From<String> for TurnId {
    fn from(s: String) -> Self {
        TurnId(s)
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 2: Memory Records
// ═══════════════════════════════════════════════════════════════════════════

/// One stored conversational fact or utterance, as held in process memory.
///
/// On disk a record is split in two sealed artifacts: the [`MemoryBlob`]
/// (text + provenance, written once) and the [`VectorEntry`] (embedding +
/// statistics, rewritten on every access).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub text: String,
    /// Unit-normalized; dimensionality fixed for the store's lifetime.
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    /// Importance in [0, 1].
    pub importance: f32,
    pub source_turn_id: TurnId,
    /// Pinned records are never evicted.
    #[serde(default)]
    pub pinned: bool,
    /// When the last decay sweep touched this record.
    #[serde(default)]
    pub last_decayed_at: Option<DateTime<Utc>>,
}

impl MemoryRecord {
    pub fn new(
        id: MemoryId,
        text: impl Into<String>,
        embedding: Vec<f32>,
        source_turn_id: TurnId,
        importance: f32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            embedding,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            importance: importance.clamp(0.0, 1.0),
            source_turn_id,
            pinned: false,
            last_decayed_at: None,
        }
    }

    /// Register one retrieval hit: bump the counter and move importance a
    /// fixed fraction of the remaining distance to 1.0.
    pub fn record_access(&mut self, boost_fraction: f32, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
        self.importance = bounded_boost(self.importance, boost_fraction);
    }

    /// The instant decay is measured from: the later of last access and last sweep.
    pub fn decay_anchor(&self) -> DateTime<Utc> {
        match self.last_decayed_at {
            Some(decayed) if decayed > self.last_accessed_at => decayed,
            _ => self.last_accessed_at,
        }
    }

    pub fn from_parts(blob: MemoryBlob, entry: VectorEntry) -> Self {
        Self {
            id: blob.id,
            text: blob.text,
            embedding: entry.embedding,
            created_at: blob.created_at,
            last_accessed_at: entry.last_accessed_at,
            access_count: entry.access_count,
            importance: entry.importance,
            source_turn_id: blob.source_turn_id,
            pinned: entry.pinned,
            last_decayed_at: entry.last_decayed_at,
        }
    }

    pub fn blob(&self) -> MemoryBlob {
        MemoryBlob {
            id: self.id,
            text: self.text.clone(),
            source_turn_id: self.source_turn_id.clone(),
            created_at: self.created_at,
            embedded: true,
        }
    }

    pub fn vector_entry(&self) -> VectorEntry {
        VectorEntry {
            id: self.id,
            embedding: self.embedding.clone(),
            last_accessed_at: self.last_accessed_at,
            access_count: self.access_count,
            importance: self.importance,
            pinned: self.pinned,
            last_decayed_at: self.last_decayed_at,
        }
    }
}

/// `importance + (1 - importance) * fraction`, clamped to [0, 1].
/// Diminishing returns: repeated boosts approach 1.0 but never overshoot.
pub fn bounded_boost(importance: f32, fraction: f32) -> f32 {
    let fraction = fraction.clamp(0.0, 1.0);
    (importance + (1.0 - importance) * fraction).clamp(0.0, 1.0)
}

/// Sealed blob-store payload: a memory's text and where it came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryBlob {
    pub id: MemoryId,
    pub text: String,
    pub source_turn_id: TurnId,
    pub created_at: DateTime<Utc>,
    /// False while the record waits for an embedding (degraded write).
    #[serde(default)]
    pub embedded: bool,
}

/// Sealed vector-index payload: embedding plus mutable statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VectorEntry {
    pub id: MemoryId,
    pub embedding: Vec<f32>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u32,
    pub importance: f32,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub last_decayed_at: Option<DateTime<Utc>>,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 3: Knowledge Graph
// ═══════════════════════════════════════════════════════════════════════════

/// Normalize an entity or relation string: lower-case, collapse whitespace,
/// trim surrounding punctuation.
pub fn normalize_entity(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

/// Identity of one triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub subject: String,
    pub predicate: String,
    pub object: String,
}

impl EdgeKey {
    pub fn new(subject: &str, predicate: &str, object: &str) -> Self {
        Self {
            subject: normalize_entity(subject),
            predicate: normalize_entity(predicate).replace(' ', "_"),
            object: normalize_entity(object),
        }
    }

    /// The `(subject, predicate)` slot that may hold at most one active edge.
    pub fn slot(&self) -> (String, String) {
        (self.subject.clone(), self.predicate.clone())
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.subject, self.predicate, self.object)
    }
}

/// Lifecycle of an edge. Edges are never deleted, only deactivated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EdgeState {
    Active,
    /// Lost a conflict for its `(subject, predicate)` slot to `by` (an object).
    Contradicted { by: String },
    /// Explicitly deactivated.
    Retracted,
}

/// One relational fact with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEdge {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    /// Confidence in [0, 1].
    pub confidence: f32,
    /// Memory records supporting this edge.
    pub provenance: BTreeSet<MemoryId>,
    pub updated_at: DateTime<Utc>,
    pub state: EdgeState,
}

impl KnowledgeEdge {
    pub fn new(
        subject: &str,
        predicate: &str,
        object: &str,
        confidence: f32,
        source: MemoryId,
        now: DateTime<Utc>,
    ) -> Self {
        let key = EdgeKey::new(subject, predicate, object);
        Self {
            subject: key.subject,
            predicate: key.predicate,
            object: key.object,
            confidence: confidence.clamp(0.0, 1.0),
            provenance: BTreeSet::from([source]),
            updated_at: now,
            state: EdgeState::Active,
        }
    }

    pub fn key(&self) -> EdgeKey {
        EdgeKey {
            subject: self.subject.clone(),
            predicate: self.predicate.clone(),
            object: self.object.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == EdgeState::Active
    }

    /// Human-readable rendering used as context content.
    pub fn sentence(&self) -> String {
        format!(
            "{} {} {}",
            self.subject,
            self.predicate.replace('_', " "),
            self.object
        )
    }
}

/// Which conflict-resolution branch an upsert took.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// No edge occupied the slot; the new edge is active.
    Inserted,
    /// Same triple already active; confidence raised, provenance merged.
    Corroborated { confidence: f32 },
    /// New object won the slot; the previous object is now contradicted.
    Superseded { previous_object: String },
    /// New object lost to the active one; stored inactive for audit.
    Demoted { active_object: String },
    /// A previously inactive triple regained the slot.
    Reactivated,
}

/// A triple proposed by fact extraction, before provenance is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct FactCandidate {
    pub subject: String,
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 4: Retrieval Types
// ═══════════════════════════════════════════════════════════════════════════

/// Parameters of one `recall`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecallOptions {
    pub top_k: usize,
    pub max_hops: usize,
    /// Size limit of the bundle, in characters.
    pub context_budget: usize,
}

/// Coarse kind of a context item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Memory,
    Fact,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Memory => write!(f, "memory"),
            ItemKind::Fact => write!(f, "fact"),
        }
    }
}

/// Where a context item came from, with the fields specific to that kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ContextSource {
    Memory {
        id: MemoryId,
        similarity: f32,
        importance: f32,
    },
    Fact {
        key: EdgeKey,
        confidence: f32,
        hops: usize,
        /// The memory whose provenance seeded the traversal.
        via: MemoryId,
    },
}

/// One ranked entry of a context bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub content: String,
    /// Composite score.
    pub score: f32,
    /// Recency component in [0, 1] (also the first tie-breaker).
    pub recency: f32,
    pub source: ContextSource,
}

impl ContextItem {
    pub fn kind(&self) -> ItemKind {
        match self.source {
            ContextSource::Memory { .. } => ItemKind::Memory,
            ContextSource::Fact { .. } => ItemKind::Fact,
        }
    }

    pub fn memory_id(&self) -> Option<MemoryId> {
        match self.source {
            ContextSource::Memory { id, .. } => Some(id),
            ContextSource::Fact { .. } => None,
        }
    }
}

/// The ranked, budget-limited result of `recall`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    /// True when the vector path was unavailable and keyword/graph recall ran.
    pub degraded: bool,
    pub warnings: Vec<String>,
    /// Characters consumed from the budget.
    pub budget_used: usize,
    /// Fused candidates before budget truncation.
    pub candidates: usize,
}

impl ContextBundle {
    pub fn top(&self) -> Option<&ContextItem> {
        self.items.first()
    }

    pub fn top_score(&self) -> f32 {
        self.top().map(|i| i.score).unwrap_or(0.0)
    }

    /// 0-based rank of a memory in the bundle, if present.
    pub fn rank_of(&self, id: MemoryId) -> Option<usize> {
        self.items.iter().position(|i| i.memory_id() == Some(id))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SECTION 5: Derived Aggregates & Reports
// ═══════════════════════════════════════════════════════════════════════════

/// A preference-bearing fact about the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileFact {
    pub predicate: String,
    pub object: String,
    pub confidence: f32,
}

/// A high-importance memory surfaced in the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileHighlight {
    pub id: MemoryId,
    pub text: String,
    pub importance: f32,
}

/// Rolling summary of what the assistant knows about its user.
/// Derived from the stores; never edited directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub preferences: Vec<ProfileFact>,
    pub highlights: Vec<ProfileHighlight>,
    pub built_at: Option<DateTime<Utc>>,
}

/// Summary of one maintenance run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub clusters_merged: usize,
    pub records_retired: usize,
    pub failed_clusters: usize,
    pub records_decayed: usize,
    pub records_evicted: usize,
    /// The time budget ran out before every phase finished.
    pub aborted: bool,
    pub warnings: Vec<String>,
}

/// Summary of loading or rebuilding an artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadReport {
    pub loaded: usize,
    pub quarantined: usize,
    pub warnings: Vec<String>,
}

impl LoadReport {
    pub fn merge(&mut self, other: LoadReport) {
        self.loaded += other.loaded;
        self.quarantined += other.quarantined;
        self.warnings.extend(other.warnings);
    }
}

/// Counts across the stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub records: usize,
    pub pending: usize,
    pub pinned: usize,
    pub active_edges: usize,
    pub inactive_edges: usize,
    pub forwards: usize,
    pub quarantined: usize,
    pub mean_importance: f32,
    pub dimension: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_id_round_trips_through_display() {
        let id = MemoryId(42);
        assert_eq!(id.to_string(), "mem-42");
        assert_eq!("mem-42".parse::<MemoryId>().unwrap(), id);
        assert_eq!("42".parse::<MemoryId>().unwrap(), id);
        assert!("mem-x".parse::<MemoryId>().is_err());
    }

    #[test]
    fn bounded_boost_has_diminishing_returns() {
        let mut imp = 0.5;
        let mut last_gain = f32::MAX;
        for _ in 0..20 {
            let next = bounded_boost(imp, 0.1);
            let gain = next - imp;
            assert!(gain < last_gain);
            assert!(next <= 1.0);
            last_gain = gain;
            imp = next;
        }
    }

    #[test]
    fn normalize_entity_collapses_and_lowercases() {
        assert_eq!(normalize_entity("  Dark   Mode! "), "dark mode");
        assert_eq!(normalize_entity("\"Blue\"."), "blue");
    }

    #[test]
    fn edge_key_normalizes_predicate_spaces() {
        let key = EdgeKey::new("User", "Lives In", "Hanoi");
        assert_eq!(key.predicate, "lives_in");
        assert_eq!(key.to_string(), "(user, lives_in, hanoi)");
    }

    #[test]
    fn decay_anchor_prefers_latest_event() {
        let t0 = Utc::now();
        let mut rec = MemoryRecord::new(MemoryId(1), "x", vec![1.0], TurnId::default(), 0.5, t0);
        assert_eq!(rec.decay_anchor(), t0);
        let later = t0 + chrono::Duration::hours(3);
        rec.last_decayed_at = Some(later);
        assert_eq!(rec.decay_anchor(), later);
    }

    #[test]
    fn record_parts_reassemble() {
        let rec = MemoryRecord::new(MemoryId(7), "hello", vec![0.6, 0.8], "t1".into(), 0.4, Utc::now());
        let rebuilt = MemoryRecord::from_parts(rec.blob(), rec.vector_entry());
        assert_eq!(rebuilt, rec);
    }
}
