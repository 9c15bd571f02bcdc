// ── Mnemos: Knowledge Graph Store ──────────────────────────────────────────
//
// Subject–predicate–object facts with provenance and confidence.
//
// Invariants:
//   - At most one *active* edge per (subject, predicate).
//   - Edges are never deleted: losers of a conflict become Contradicted,
//     explicit removal makes them Retracted.
//   - Traversal only walks active edges.
//
// Rows are sealed; the table's row key is an HMAC blind index of the triple
// so the same triple always lands on the same row without storing it in
// the clear.

use log::{info, warn};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::atoms::constants::{CORROBORATION_BOOST, MAX_HOPS_LIMIT, USER_ENTITY};
use crate::atoms::error::EngineResult;
use crate::atoms::types::{
    normalize_entity, EdgeKey, EdgeState, KnowledgeEdge, LoadReport, MemoryId, UpsertOutcome,
};
use crate::engine::storage::{Artifact, Persistence};

/// One traversal result.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphHit {
    pub edge: KnowledgeEdge,
    /// Distance from the seed entity (1 = the seed is an endpoint).
    pub hops: usize,
}

#[derive(Default)]
struct GraphIndex {
    edges: HashMap<EdgeKey, KnowledgeEdge>,
    /// (subject, predicate) → the one active edge in that slot.
    active: HashMap<(String, String), EdgeKey>,
    /// entity → every edge naming it as subject or object.
    adjacency: HashMap<String, BTreeSet<EdgeKey>>,
    /// provenance → edges it supports.
    by_memory: HashMap<MemoryId, BTreeSet<EdgeKey>>,
}

impl GraphIndex {
    fn index_edge(&mut self, edge: KnowledgeEdge) {
        let key = edge.key();
        self.adjacency
            .entry(edge.subject.clone())
            .or_default()
            .insert(key.clone());
        self.adjacency
            .entry(edge.object.clone())
            .or_default()
            .insert(key.clone());
        for id in &edge.provenance {
            self.by_memory.entry(*id).or_default().insert(key.clone());
        }
        if edge.is_active() {
            self.active.insert(key.slot(), key.clone());
        } else if self.active.get(&key.slot()) == Some(&key) {
            self.active.remove(&key.slot());
        }
        self.edges.insert(key, edge);
    }
}

/// Does `challenger` take the slot from `holder`? Higher confidence wins;
/// on a tie the newer edge wins.
fn wins(challenger: &KnowledgeEdge, holder: &KnowledgeEdge) -> bool {
    match challenger.confidence.total_cmp(&holder.confidence) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => challenger.updated_at >= holder.updated_at,
    }
}

pub struct GraphStore {
    persist: Arc<Persistence>,
    index: RwLock<GraphIndex>,
    generation: AtomicU64,
}

impl GraphStore {
    /// Load every sealed edge; undecryptable rows are quarantined.
    pub fn load(persist: Arc<Persistence>) -> EngineResult<(Self, LoadReport)> {
        let (edges, report) = persist.load_all::<KnowledgeEdge>(Artifact::Graph)?;
        let mut index = GraphIndex::default();
        for edge in edges {
            index.index_edge(edge);
        }
        info!(
            "[mnemos:graph] Loaded {} edges ({} active, {} quarantined)",
            index.edges.len(),
            index.active.len(),
            report.quarantined
        );
        Ok((
            Self {
                persist,
                index: RwLock::new(index),
                generation: AtomicU64::new(0),
            },
            report,
        ))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(AtomicOrdering::SeqCst)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn row_key(&self, edge: &KnowledgeEdge) -> EngineResult<String> {
        self.persist
            .vault
            .blind_index(&[&edge.subject, &edge.predicate, &edge.object])
    }

    fn persist_edge(&self, edge: &KnowledgeEdge) -> EngineResult<()> {
        self.persist.save(Artifact::Graph, &self.row_key(edge)?, edge)
    }

    /// Put the row of `written` back to `prior` (or remove it if it was new).
    fn restore_row(&self, written: &KnowledgeEdge, prior: Option<&KnowledgeEdge>) {
        let undo = match prior {
            Some(p) => self.persist_edge(p),
            None => self
                .row_key(written)
                .and_then(|k| self.persist.remove(Artifact::Graph, &k).map(|_| ())),
        };
        if let Err(e) = undo {
            warn!("[mnemos:graph] Rollback of a failed upsert not persisted: {}", e);
        }
    }

    /// Insert or merge an edge, resolving conflicts in its slot.
    pub fn upsert(&self, incoming: KnowledgeEdge) -> EngineResult<UpsertOutcome> {
        let key = incoming.key();
        let slot = key.slot();
        let mut g = self.index.write();

        let holder = g
            .active
            .get(&slot)
            .filter(|k| **k != key)
            .and_then(|k| g.edges.get(k))
            .cloned();

        // Merge with a stored copy of the same triple, if any.
        let prior = g.edges.get(&key).cloned();
        let (mut edge, was_active) = match prior.clone() {
            Some(mut stored) => {
                let was_active = stored.is_active();
                stored.provenance.extend(incoming.provenance.iter().copied());
                if stored.updated_at < incoming.updated_at {
                    stored.updated_at = incoming.updated_at;
                }
                if was_active {
                    stored.confidence =
                        (stored.confidence.max(incoming.confidence) + CORROBORATION_BOOST).min(1.0);
                } else {
                    stored.confidence = stored.confidence.max(incoming.confidence);
                }
                (stored, Some(was_active))
            }
            None => (incoming, None),
        };

        let mut demoted: Option<KnowledgeEdge> = None;
        let outcome = if was_active == Some(true) {
            UpsertOutcome::Corroborated {
                confidence: edge.confidence,
            }
        } else {
            match holder {
                Some(mut old) if wins(&edge, &old) => {
                    let previous_object = old.object.clone();
                    old.state = EdgeState::Contradicted {
                        by: edge.object.clone(),
                    };
                    demoted = Some(old);
                    edge.state = EdgeState::Active;
                    if was_active.is_some() {
                        UpsertOutcome::Reactivated
                    } else {
                        UpsertOutcome::Superseded { previous_object }
                    }
                }
                Some(old) => {
                    edge.state = EdgeState::Contradicted {
                        by: old.object.clone(),
                    };
                    UpsertOutcome::Demoted {
                        active_object: old.object,
                    }
                }
                None => {
                    edge.state = EdgeState::Active;
                    if was_active.is_some() {
                        UpsertOutcome::Reactivated
                    } else {
                        UpsertOutcome::Inserted
                    }
                }
            }
        };

        // Winner first: a failure here leaves the slot's active edge intact.
        self.persist_edge(&edge)?;
        if let Some(old) = demoted {
            if let Err(e) = self.persist_edge(&old) {
                self.restore_row(&edge, prior.as_ref());
                return Err(e);
            }
            g.index_edge(old);
        }
        g.index_edge(edge);
        self.bump();
        if let UpsertOutcome::Superseded { .. } | UpsertOutcome::Demoted { .. } = outcome {
            info!("[mnemos:graph] Conflict in slot ({}, {}) resolved", slot.0, slot.1);
        }
        Ok(outcome)
    }

    /// Retract an edge. Returns false if it was not stored.
    pub fn deactivate(&self, key: &EdgeKey) -> EngineResult<bool> {
        let mut g = self.index.write();
        let Some(mut edge) = g.edges.get(key).cloned() else {
            return Ok(false);
        };
        edge.state = EdgeState::Retracted;
        self.persist_edge(&edge)?;
        g.index_edge(edge);
        self.bump();
        Ok(true)
    }

    /// Breadth-first walk over active edges from `entity`, at most
    /// `max_hops` deep. Results: hops ascending, confidence descending.
    pub fn query_by_entity(&self, entity: &str, max_hops: usize) -> Vec<GraphHit> {
        let max_hops = max_hops.min(MAX_HOPS_LIMIT);
        let seed = normalize_entity(entity);
        let g = self.index.read();

        let mut visited: HashSet<String> = HashSet::from([seed.clone()]);
        let mut seen_edges: HashSet<EdgeKey> = HashSet::new();
        let mut frontier = vec![seed];
        let mut hits = Vec::new();

        for hop in 1..=max_hops {
            let mut next = Vec::new();
            for entity in &frontier {
                let Some(keys) = g.adjacency.get(entity) else {
                    continue;
                };
                for key in keys {
                    let Some(edge) = g.edges.get(key) else {
                        continue;
                    };
                    if !edge.is_active() || !seen_edges.insert(key.clone()) {
                        continue;
                    }
                    hits.push(GraphHit {
                        edge: edge.clone(),
                        hops: hop,
                    });
                    let other = if edge.subject == *entity {
                        &edge.object
                    } else {
                        &edge.subject
                    };
                    if visited.insert(other.clone()) {
                        next.push(other.clone());
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }

        hits.sort_by(|a, b| {
            a.hops
                .cmp(&b.hops)
                .then_with(|| b.edge.confidence.total_cmp(&a.edge.confidence))
                .then_with(|| a.edge.key().cmp(&b.edge.key()))
        });
        hits
    }

    pub fn get(&self, key: &EdgeKey) -> Option<KnowledgeEdge> {
        self.index.read().edges.get(key).cloned()
    }

    /// Active edge for a (subject, predicate) slot.
    pub fn active_in_slot(&self, subject: &str, predicate: &str) -> Option<KnowledgeEdge> {
        let slot = (
            normalize_entity(subject),
            normalize_entity(predicate).replace(' ', "_"),
        );
        let g = self.index.read();
        g.active.get(&slot).and_then(|k| g.edges.get(k)).cloned()
    }

    /// Active edges whose subject is `subject`, ordered by key.
    pub fn active_about(&self, subject: &str) -> Vec<KnowledgeEdge> {
        let subject = normalize_entity(subject);
        let g = self.index.read();
        let mut out: Vec<KnowledgeEdge> = g
            .adjacency
            .get(&subject)
            .into_iter()
            .flatten()
            .filter_map(|k| g.edges.get(k))
            .filter(|e| e.is_active() && e.subject == subject)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.key());
        out
    }

    /// Entities named by any edge this memory supports.
    pub fn entities_for_memory(&self, id: MemoryId) -> BTreeSet<String> {
        let g = self.index.read();
        let mut out = BTreeSet::new();
        for key in g.by_memory.get(&id).into_iter().flatten() {
            out.insert(key.subject.clone());
            out.insert(key.object.clone());
        }
        out
    }

    /// Every edge this memory supports, inactive ones included.
    pub fn edges_for_memory(&self, id: MemoryId) -> Vec<KnowledgeEdge> {
        let g = self.index.read();
        g.by_memory
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|k| g.edges.get(k))
            .cloned()
            .collect()
    }

    /// Point provenance at `survivor` wherever it names `retired`.
    pub fn reassign_provenance(&self, retired: MemoryId, survivor: MemoryId) -> EngineResult<usize> {
        let mut g = self.index.write();
        let Some(keys) = g.by_memory.remove(&retired) else {
            return Ok(0);
        };
        let mut changed = 0;
        for key in keys {
            let Some(mut edge) = g.edges.get(&key).cloned() else {
                continue;
            };
            edge.provenance.remove(&retired);
            edge.provenance.insert(survivor);
            self.persist_edge(&edge)?;
            g.index_edge(edge);
            changed += 1;
        }
        if changed > 0 {
            self.bump();
        }
        Ok(changed)
    }

    /// Known entities mentioned in free text (first-person words map to the user).
    pub fn known_entities_in(&self, text: &str) -> Vec<String> {
        let normalized = format!(
            " {} ",
            text.to_lowercase()
                .split(|c: char| !c.is_alphanumeric())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        );
        let g = self.index.read();
        let mut found: BTreeSet<String> = g
            .adjacency
            .keys()
            .filter(|entity| {
                let needle = format!(
                    " {} ",
                    entity
                        .split(|c: char| !c.is_alphanumeric())
                        .filter(|t| !t.is_empty())
                        .collect::<Vec<_>>()
                        .join(" ")
                );
                needle.trim().len() > 1 && normalized.contains(&needle)
            })
            .cloned()
            .collect();
        if g.adjacency.contains_key(USER_ENTITY)
            && [" i ", " my ", " me ", " mine "]
                .iter()
                .any(|w| normalized.contains(w))
        {
            found.insert(USER_ENTITY.to_string());
        }
        found.into_iter().collect()
    }

    pub fn all_edges(&self) -> Vec<KnowledgeEdge> {
        let g = self.index.read();
        let mut out: Vec<KnowledgeEdge> = g.edges.values().cloned().collect();
        out.sort_by_key(|e| e.key());
        out
    }

    /// (active, inactive) counts.
    pub fn counts(&self) -> (usize, usize) {
        let g = self.index.read();
        let active = g.active.len();
        (active, g.edges.len() - active)
    }

    /// Drop every edge, in memory and on disk. Only used before a rebuild.
    pub fn reset(&self) -> EngineResult<()> {
        let mut g = self.index.write();
        self.persist
            .replace_all::<KnowledgeEdge>(Artifact::Graph, &[])?;
        *g = GraphIndex::default();
        self.bump();
        warn!("[mnemos:graph] Graph reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::encryption::MasterSecret;
    use crate::engine::storage::Database;
    use chrono::{Duration, Utc};

    fn persistence() -> Arc<Persistence> {
        Arc::new(
            Persistence::unlock(
                Database::open_in_memory().unwrap(),
                &MasterSecret::passphrase("pw").unwrap(),
            )
            .unwrap(),
        )
    }

    fn store() -> GraphStore {
        GraphStore::load(persistence()).unwrap().0
    }

    fn edge(s: &str, p: &str, o: &str, conf: f32, mem: u64) -> KnowledgeEdge {
        KnowledgeEdge::new(s, p, o, conf, MemoryId(mem), Utc::now())
    }

    #[test]
    fn test_corroboration_raises_confidence_and_merges_provenance() {
        let g = store();
        assert_eq!(g.upsert(edge("user", "likes", "tea", 0.6, 1)).unwrap(), UpsertOutcome::Inserted);
        let outcome = g.upsert(edge("User", "likes", "Tea", 0.5, 2)).unwrap();
        assert!(matches!(outcome, UpsertOutcome::Corroborated { confidence } if (confidence - 0.65).abs() < 1e-6));
        let stored = g.active_in_slot("user", "likes").unwrap();
        assert_eq!(stored.provenance, BTreeSet::from([MemoryId(1), MemoryId(2)]));
    }

    #[test]
    fn test_higher_confidence_supersedes() {
        let g = store();
        g.upsert(edge("user", "favorite_color", "red", 0.6, 1)).unwrap();
        let outcome = g.upsert(edge("user", "favorite_color", "blue", 0.8, 2)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Superseded { previous_object: "red".into() });

        assert_eq!(g.active_in_slot("user", "favorite_color").unwrap().object, "blue");
        let red = g.get(&EdgeKey::new("user", "favorite_color", "red")).unwrap();
        assert_eq!(red.state, EdgeState::Contradicted { by: "blue".into() });
    }

    #[test]
    fn test_superseded_edge_only_reachable_through_provenance() {
        let g = store();
        g.upsert(edge("a", "likes", "x", 0.5, 7)).unwrap();
        g.upsert(edge("a", "likes", "y", 0.9, 8)).unwrap();

        let hits = g.query_by_entity("a", 2);
        assert!(hits.iter().all(|h| h.edge.object != "x"));
        assert!(hits.iter().any(|h| h.edge.object == "y"));

        let via_provenance = g.edges_for_memory(MemoryId(7));
        assert_eq!(via_provenance.len(), 1);
        assert_eq!(via_provenance[0].object, "x");
        assert!(matches!(via_provenance[0].state, EdgeState::Contradicted { .. }));
    }

    /// Make every write of `edge`'s row fail at the SQLite level.
    fn block_row(persist: &Persistence, edge: &KnowledgeEdge) {
        let key = persist
            .vault
            .blind_index(&[&edge.subject, &edge.predicate, &edge.object])
            .unwrap();
        persist
            .db
            .conn
            .lock()
            .execute_batch(&format!(
                "CREATE TRIGGER block_insert BEFORE INSERT ON graph_edges
                 WHEN NEW.row_key = '{k}' BEGIN SELECT RAISE(ABORT, 'blocked'); END;
                 CREATE TRIGGER block_update BEFORE UPDATE ON graph_edges
                 WHEN NEW.row_key = '{k}' BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
                k = key
            ))
            .unwrap();
    }

    #[test]
    fn test_failed_winner_write_keeps_active_edge() {
        let persist = persistence();
        let (g, _) = GraphStore::load(persist.clone()).unwrap();
        g.upsert(edge("user", "lives_in", "paris", 0.6, 1)).unwrap();
        let winner = edge("user", "lives_in", "lyon", 0.9, 2);
        block_row(&persist, &winner);

        assert!(g.upsert(winner).is_err());
        assert_eq!(g.active_in_slot("user", "lives_in").unwrap().object, "paris");
        let (reloaded, _) = GraphStore::load(persist).unwrap();
        assert_eq!(reloaded.active_in_slot("user", "lives_in").unwrap().object, "paris");
    }

    #[test]
    fn test_failed_demotion_rolls_back_winner() {
        let persist = persistence();
        let (g, _) = GraphStore::load(persist.clone()).unwrap();
        let old = edge("user", "lives_in", "paris", 0.6, 1);
        g.upsert(old.clone()).unwrap();
        block_row(&persist, &old);

        assert!(g.upsert(edge("user", "lives_in", "lyon", 0.9, 2)).is_err());
        let (reloaded, _) = GraphStore::load(persist).unwrap();
        assert_eq!(reloaded.active_in_slot("user", "lives_in").unwrap().object, "paris");
        assert!(reloaded.get(&EdgeKey::new("user", "lives_in", "lyon")).is_none());
    }

    #[test]
    fn test_lower_confidence_is_demoted_but_kept() {
        let g = store();
        g.upsert(edge("user", "favorite_color", "blue", 0.8, 1)).unwrap();
        let outcome = g.upsert(edge("user", "favorite_color", "green", 0.5, 2)).unwrap();
        assert_eq!(outcome, UpsertOutcome::Demoted { active_object: "blue".into() });

        assert_eq!(g.active_in_slot("user", "favorite_color").unwrap().object, "blue");
        let green = g.edges_for_memory(MemoryId(2));
        assert_eq!(green.len(), 1);
        assert!(!green[0].is_active());
    }

    #[test]
    fn test_confidence_tie_newer_wins() {
        let g = store();
        let now = Utc::now();
        let mut first = edge("user", "lives_in", "paris", 0.8, 1);
        first.updated_at = now;
        g.upsert(first).unwrap();

        let mut stale = edge("user", "lives_in", "rome", 0.8, 2);
        stale.updated_at = now - Duration::hours(1);
        assert!(matches!(g.upsert(stale).unwrap(), UpsertOutcome::Demoted { .. }));

        let mut fresh = edge("user", "lives_in", "lyon", 0.8, 3);
        fresh.updated_at = now + Duration::hours(1);
        assert!(matches!(g.upsert(fresh).unwrap(), UpsertOutcome::Superseded { .. }));
        assert_eq!(g.active_in_slot("user", "lives_in").unwrap().object, "lyon");
    }

    #[test]
    fn test_single_active_edge_per_slot() {
        let g = store();
        for (i, obj) in ["a", "b", "c", "d"].iter().enumerate() {
            g.upsert(edge("user", "pet", obj, 0.5 + i as f32 * 0.1, i as u64)).unwrap();
        }
        let active = g
            .all_edges()
            .into_iter()
            .filter(|e| e.is_active() && e.predicate == "pet")
            .count();
        assert_eq!(active, 1);
    }

    #[test]
    fn test_bfs_respects_hops_and_terminates_on_cycles() {
        let g = store();
        g.upsert(edge("user", "sister", "alice", 0.8, 1)).unwrap();
        g.upsert(edge("alice", "likes", "jazz", 0.6, 2)).unwrap();
        g.upsert(edge("jazz", "played_by", "user", 0.6, 3)).unwrap();
        g.upsert(edge("jazz", "genre_of", "bebop", 0.6, 4)).unwrap();

        let one = g.query_by_entity("user", 1);
        assert!(one.iter().all(|h| h.hops == 1));
        assert_eq!(one.len(), 2);

        let two = g.query_by_entity("User", 2);
        assert_eq!(two.len(), 4);
        assert!(two.windows(2).all(|w| w[0].hops <= w[1].hops));

        // Deep walk on a cyclic graph still terminates with each edge once.
        assert_eq!(g.query_by_entity("user", MAX_HOPS_LIMIT).len(), 4);
    }

    #[test]
    fn test_bfs_skips_inactive_edges() {
        let g = store();
        g.upsert(edge("user", "likes", "tea", 0.8, 1)).unwrap();
        g.deactivate(&EdgeKey::new("user", "likes", "tea")).unwrap();
        assert!(g.query_by_entity("user", 2).is_empty());
        assert_eq!(g.counts(), (0, 1));
    }

    #[test]
    fn test_retracted_edge_can_return() {
        let g = store();
        g.upsert(edge("user", "likes", "tea", 0.8, 1)).unwrap();
        g.deactivate(&EdgeKey::new("user", "likes", "tea")).unwrap();
        assert_eq!(g.upsert(edge("user", "likes", "tea", 0.8, 2)).unwrap(), UpsertOutcome::Reactivated);
    }

    #[test]
    fn test_reassign_provenance() {
        let g = store();
        g.upsert(edge("user", "likes", "tea", 0.8, 7)).unwrap();
        assert_eq!(g.reassign_provenance(MemoryId(7), MemoryId(3)).unwrap(), 1);
        assert!(g.edges_for_memory(MemoryId(7)).is_empty());
        assert_eq!(g.entities_for_memory(MemoryId(3)), BTreeSet::from(["tea".to_string(), "user".to_string()]));
    }

    #[test]
    fn test_known_entities_in_text() {
        let g = store();
        g.upsert(edge("user", "favorite_color", "blue", 0.8, 1)).unwrap();
        g.upsert(edge("alice", "likes", "green tea", 0.6, 2)).unwrap();
        assert_eq!(
            g.known_entities_in("Does Alice drink green tea?"),
            vec!["alice".to_string(), "green tea".to_string()]
        );
        assert_eq!(g.known_entities_in("what do I like"), vec!["user".to_string()]);
    }

    #[test]
    fn test_edges_survive_reload() {
        let p = persistence();
        let (g, _) = GraphStore::load(p.clone()).unwrap();
        g.upsert(edge("user", "favorite_color", "red", 0.6, 1)).unwrap();
        g.upsert(edge("user", "favorite_color", "blue", 0.8, 2)).unwrap();

        let (reloaded, report) = GraphStore::load(p).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(reloaded.active_in_slot("user", "favorite_color").unwrap().object, "blue");
    }
}
