// ── Mnemos: Blob Store ─────────────────────────────────────────────────────
//
// Sealed text + provenance of every live memory. This is the artifact the
// vector index and the graph are rebuilt from, and the only place a record
// lives while it waits for an embedding (`embedded == false`).

use log::info;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::atoms::error::EngineResult;
use crate::atoms::types::{LoadReport, MemoryBlob, MemoryId};
use crate::engine::storage::{memory_row_key, Artifact, Persistence};

pub struct BlobStore {
    persist: Arc<Persistence>,
    blobs: RwLock<BTreeMap<MemoryId, MemoryBlob>>,
}

impl BlobStore {
    /// Load every sealed blob; undecryptable rows are quarantined.
    pub fn load(persist: Arc<Persistence>) -> EngineResult<(Self, LoadReport)> {
        let (blobs, report) = persist.load_all::<MemoryBlob>(Artifact::Blobs)?;
        let map: BTreeMap<MemoryId, MemoryBlob> = blobs.into_iter().map(|b| (b.id, b)).collect();
        if let Some(max) = map.keys().next_back() {
            persist.db.bump_memory_id_floor(*max)?;
        }
        info!(
            "[mnemos:blobs] Loaded {} blobs ({} quarantined)",
            map.len(),
            report.quarantined
        );
        Ok((
            Self {
                persist,
                blobs: RwLock::new(map),
            },
            report,
        ))
    }

    pub fn put(&self, blob: MemoryBlob) -> EngineResult<()> {
        let mut blobs = self.blobs.write();
        self.persist
            .save(Artifact::Blobs, &memory_row_key(blob.id), &blob)?;
        blobs.insert(blob.id, blob);
        Ok(())
    }

    pub fn get(&self, id: MemoryId) -> Option<MemoryBlob> {
        self.blobs.read().get(&id).cloned()
    }

    pub fn text(&self, id: MemoryId) -> Option<String> {
        self.blobs.read().get(&id).map(|b| b.text.clone())
    }

    pub fn contains(&self, id: MemoryId) -> bool {
        self.blobs.read().contains_key(&id)
    }

    pub fn remove(&self, id: MemoryId) -> EngineResult<bool> {
        let mut blobs = self.blobs.write();
        self.persist.remove(Artifact::Blobs, &memory_row_key(id))?;
        Ok(blobs.remove(&id).is_some())
    }

    /// Flag a pending blob as embedded once its vector entry exists.
    pub fn mark_embedded(&self, id: MemoryId) -> EngineResult<()> {
        let mut blobs = self.blobs.write();
        if let Some(blob) = blobs.get_mut(&id) {
            if !blob.embedded {
                blob.embedded = true;
                self.persist
                    .save(Artifact::Blobs, &memory_row_key(id), &*blob)?;
            }
        }
        Ok(())
    }

    pub fn all(&self) -> Vec<MemoryBlob> {
        self.blobs.read().values().cloned().collect()
    }

    /// Blobs still waiting for an embedding.
    pub fn pending(&self) -> Vec<MemoryBlob> {
        self.blobs
            .read()
            .values()
            .filter(|b| !b.embedded)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::encryption::MasterSecret;
    use crate::engine::storage::Database;
    use chrono::Utc;

    fn persistence() -> Arc<Persistence> {
        Arc::new(
            Persistence::unlock(
                Database::open_in_memory().unwrap(),
                &MasterSecret::passphrase("pw").unwrap(),
            )
            .unwrap(),
        )
    }

    fn blob(id: u64, embedded: bool) -> MemoryBlob {
        MemoryBlob {
            id: MemoryId(id),
            text: format!("note {}", id),
            source_turn_id: "t".into(),
            created_at: Utc::now(),
            embedded,
        }
    }

    #[test]
    fn test_blobs_survive_reload() {
        let p = persistence();
        let (store, _) = BlobStore::load(p.clone()).unwrap();
        store.put(blob(1, true)).unwrap();
        store.put(blob(2, false)).unwrap();

        let (reloaded, report) = BlobStore::load(p).unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(reloaded.text(MemoryId(1)).as_deref(), Some("note 1"));
        assert_eq!(reloaded.pending().len(), 1);
    }

    #[test]
    fn test_mark_embedded_clears_pending() {
        let (store, _) = BlobStore::load(persistence()).unwrap();
        store.put(blob(5, false)).unwrap();
        store.mark_embedded(MemoryId(5)).unwrap();
        assert!(store.pending().is_empty());
    }

    #[test]
    fn test_load_keeps_id_counter_ahead() {
        let p = persistence();
        let (store, _) = BlobStore::load(p.clone()).unwrap();
        store.put(blob(40, true)).unwrap();
        let _ = BlobStore::load(p.clone()).unwrap();
        assert!(p.db.next_memory_id().unwrap() > MemoryId(40));
    }
}
