// Mnemos: Persistence
// One SQLite database (rusqlite, bundled) per vault.
//
// Module layout:
//   mod.rs:  Database (raw sealed rows, counters, forwards, quarantine)
//             and Persistence (Database + Vault: typed sealed reads/writes)
//   schema:  idempotent migrations
//
// Nothing in this module sees plaintext except Persistence, which seals
// before writing and opens after reading.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{LoadReport, MemoryId};
use crate::engine::encryption::{generate_salt, MasterSecret, Vault};
use log::{info, warn};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;

mod schema;

const META_SALT: &str = "kdf_salt";
const META_KEY_CHECK: &str = "key_check";
const META_DIMENSION: &str = "embedding_dimension";
const COUNTER_MEMORY_ID: &str = "memory_id";

/// The three independently rebuildable artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    Blobs,
    Vectors,
    Graph,
}

impl Artifact {
    fn table(self) -> &'static str {
        match self {
            Artifact::Blobs => "memory_blobs",
            Artifact::Vectors => "vector_entries",
            Artifact::Graph => "graph_edges",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Artifact::Blobs => "blobs",
            Artifact::Vectors => "vectors",
            Artifact::Graph => "graph",
        }
    }
}

/// Row key for memory-addressed artifacts.
pub fn memory_row_key(id: MemoryId) -> String {
    id.0.to_string()
}

#[derive(Debug, Clone)]
pub struct SealedRow {
    pub row_key: String,
    pub sealed: Vec<u8>,
}

// ═════════════════════════════════════════════════════════════════════════════
// Database
// ═════════════════════════════════════════════════════════════════════════════

/// Thread-safe database wrapper.
pub struct Database {
    /// `pub` so integration tests can poke at raw rows.
    pub conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the vault database at `path`.
    pub fn open(path: &Path) -> EngineResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("[mnemos:storage] Opening vault at {:?}", path);
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> EngineResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> EngineResult<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        // Coarser growth quanta and zeroed free pages: deleted ciphertext
        // must not linger in unallocated pages.
        conn.execute_batch("PRAGMA page_size = 8192;").ok();
        conn.execute_batch("PRAGMA secure_delete = ON;").ok();
        conn.execute_batch("PRAGMA auto_vacuum = INCREMENTAL;").ok();

        schema::run_migrations(&conn)?;
        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    // ── Sealed artifact rows ────────────────────────────────────────────

    pub fn put(&self, artifact: Artifact, row_key: &str, sealed: &[u8]) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO {} (row_key, sealed, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(row_key) DO UPDATE SET sealed = excluded.sealed,
                 updated_at = excluded.updated_at",
                artifact.table()
            ),
            params![row_key, sealed],
        )?;
        Ok(())
    }

    pub fn get(&self, artifact: Artifact, row_key: &str) -> EngineResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!("SELECT sealed FROM {} WHERE row_key = ?1", artifact.table()),
                params![row_key],
                |r| r.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn delete(&self, artifact: Artifact, row_key: &str) -> EngineResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            &format!("DELETE FROM {} WHERE row_key = ?1", artifact.table()),
            params![row_key],
        )?;
        Ok(n > 0)
    }

    pub fn load_all(&self, artifact: Artifact) -> EngineResult<Vec<SealedRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT row_key, sealed FROM {} ORDER BY row_key",
            artifact.table()
        ))?;
        let rows = stmt
            .query_map([], |r| {
                Ok(SealedRow {
                    row_key: r.get(0)?,
                    sealed: r.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Replace an artifact's whole table in one transaction.
    pub fn replace_all(&self, artifact: Artifact, rows: &[SealedRow]) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(&format!("DELETE FROM {}", artifact.table()), [])?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {} (row_key, sealed) VALUES (?1, ?2)",
                artifact.table()
            ))?;
            for row in rows {
                stmt.execute(params![row.row_key, row.sealed])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count(&self, artifact: Artifact) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", artifact.table()),
            [],
            |r| r.get(0),
        )?;
        Ok(n as usize)
    }

    /// Move a row out of its artifact table into quarantine.
    pub fn quarantine(&self, artifact: Artifact, row_key: &str, reason: &str) -> EngineResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            &format!(
                "INSERT INTO quarantine (artifact, row_key, reason, sealed)
                 SELECT ?1, row_key, ?2, sealed FROM {} WHERE row_key = ?3",
                artifact.table()
            ),
            params![artifact.name(), reason, row_key],
        )?;
        tx.execute(
            &format!("DELETE FROM {} WHERE row_key = ?1", artifact.table()),
            params![row_key],
        )?;
        tx.commit()?;
        warn!(
            "[mnemos:storage] Quarantined {} row {}: {}",
            artifact.name(),
            row_key,
            reason
        );
        Ok(())
    }

    pub fn quarantine_count(&self) -> EngineResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM quarantine", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    // ── Metadata & counters ─────────────────────────────────────────────

    pub fn meta_get(&self, key: &str) -> EngineResult<Option<Vec<u8>>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM vault_meta WHERE key = ?1",
                params![key],
                |r| r.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn meta_set(&self, key: &str, value: &[u8]) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vault_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Allocate the next memory id. Ids are never reused, even after eviction.
    pub fn next_memory_id(&self) -> EngineResult<MemoryId> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO counters (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1",
            params![COUNTER_MEMORY_ID],
        )?;
        let value: i64 = tx.query_row(
            "SELECT value FROM counters WHERE name = ?1",
            params![COUNTER_MEMORY_ID],
            |r| r.get(0),
        )?;
        tx.commit()?;
        Ok(MemoryId(value as u64))
    }

    /// Keep the counter ahead of every id seen on disk (used after rebuilds).
    pub fn bump_memory_id_floor(&self, at_least: MemoryId) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO counters (name, value) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET value = MAX(value, excluded.value)",
            params![COUNTER_MEMORY_ID, at_least.0 as i64],
        )?;
        Ok(())
    }

    // ── Forwarding pointers ─────────────────────────────────────────────

    pub fn put_forward(&self, retired: MemoryId, survivor: MemoryId) -> EngineResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO memory_forwards (retired_id, survivor_id) VALUES (?1, ?2)
             ON CONFLICT(retired_id) DO UPDATE SET survivor_id = excluded.survivor_id",
            params![retired.0 as i64, survivor.0 as i64],
        )?;
        Ok(())
    }

    pub fn load_forwards(&self) -> EngineResult<Vec<(MemoryId, MemoryId)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT retired_id, survivor_id FROM memory_forwards")?;
        let rows = stmt
            .query_map([], |r| {
                let retired: i64 = r.get(0)?;
                let survivor: i64 = r.get(1)?;
                Ok((MemoryId(retired as u64), MemoryId(survivor as u64)))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

// ═════════════════════════════════════════════════════════════════════════════
// Persistence: sealed, typed access
// ═════════════════════════════════════════════════════════════════════════════

/// Database plus the vault that seals everything written to it.
pub struct Persistence {
    pub db: Database,
    pub vault: Vault,
}

impl Persistence {
    /// Derive the vault for `db`. On first open this creates the salt and
    /// key check value; afterwards it verifies the secret against them.
    pub fn unlock(db: Database, secret: &MasterSecret) -> EngineResult<Self> {
        let salt = match db.meta_get(META_SALT)? {
            Some(salt) => salt,
            None => {
                let salt = generate_salt()?.to_vec();
                db.meta_set(META_SALT, &salt)?;
                info!("[mnemos:storage] Initialized new vault salt");
                salt
            }
        };
        let vault = Vault::derive(secret, &salt)?;
        match db.meta_get(META_KEY_CHECK)? {
            Some(check) => vault.verify_key_check(&check)?,
            None => db.meta_set(META_KEY_CHECK, &vault.key_check()?)?,
        }
        Ok(Self { db, vault })
    }

    /// Pin the embedding dimension on first use; reject a different one later.
    pub fn ensure_dimension(&self, dimension: usize) -> EngineResult<()> {
        match self.db.meta_get(META_DIMENSION)? {
            Some(bytes) => {
                let stored: usize = serde_json::from_slice(&bytes)?;
                if stored != dimension {
                    return Err(EngineError::DimensionMismatch {
                        expected: stored,
                        actual: dimension,
                    });
                }
                Ok(())
            }
            None => self
                .db
                .meta_set(META_DIMENSION, &serde_json::to_vec(&dimension)?),
        }
    }

    pub fn save<T: Serialize>(&self, artifact: Artifact, row_key: &str, value: &T) -> EngineResult<()> {
        let sealed = self.vault.seal_json(value)?;
        self.db.put(artifact, row_key, &sealed)
    }

    pub fn fetch<T: DeserializeOwned>(&self, artifact: Artifact, row_key: &str) -> EngineResult<Option<T>> {
        match self.db.get(artifact, row_key)? {
            Some(sealed) => Ok(Some(self.vault.open_json(&sealed)?)),
            None => Ok(None),
        }
    }

    /// Open every row of an artifact. Rows that fail to open are quarantined
    /// and reported, never returned.
    pub fn load_all<T: DeserializeOwned>(&self, artifact: Artifact) -> EngineResult<(Vec<T>, LoadReport)> {
        let mut report = LoadReport::default();
        let mut values = Vec::new();
        for row in self.db.load_all(artifact)? {
            match self.vault.open_json::<T>(&row.sealed) {
                Ok(v) => {
                    values.push(v);
                    report.loaded += 1;
                }
                Err(e) => {
                    self.db.quarantine(artifact, &row.row_key, &e.to_string())?;
                    report.quarantined += 1;
                    report
                        .warnings
                        .push(format!("{} row {} quarantined: {}", artifact.name(), row.row_key, e));
                }
            }
        }
        Ok((values, report))
    }

    /// Seal `values` and replace the artifact's table with them.
    pub fn replace_all<T: Serialize>(&self, artifact: Artifact, values: &[(String, T)]) -> EngineResult<()> {
        let rows = values
            .iter()
            .map(|(key, v)| {
                Ok(SealedRow {
                    row_key: key.clone(),
                    sealed: self.vault.seal_json(v)?,
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;
        self.db.replace_all(artifact, &rows)
    }

    pub fn remove(&self, artifact: Artifact, row_key: &str) -> EngineResult<bool> {
        self.db.delete(artifact, row_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistence(secret: &str) -> Persistence {
        Persistence::unlock(
            Database::open_in_memory().unwrap(),
            &MasterSecret::passphrase(secret).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_ids_are_monotonic() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.next_memory_id().unwrap(), MemoryId(1));
        assert_eq!(db.next_memory_id().unwrap(), MemoryId(2));
        db.bump_memory_id_floor(MemoryId(10)).unwrap();
        assert_eq!(db.next_memory_id().unwrap(), MemoryId(11));
        db.bump_memory_id_floor(MemoryId(3)).unwrap();
        assert_eq!(db.next_memory_id().unwrap(), MemoryId(12));
    }

    #[test]
    fn test_sealed_rows_are_not_plaintext() {
        let p = persistence("pw");
        p.save(Artifact::Blobs, "1", &"my cat is called Miso").unwrap();
        let raw = p.db.get(Artifact::Blobs, "1").unwrap().unwrap();
        assert!(!raw.windows(4).any(|w| w == b"Miso"));
        let back: String = p.fetch(Artifact::Blobs, "1").unwrap().unwrap();
        assert_eq!(back, "my cat is called Miso");
    }

    #[test]
    fn test_corrupt_row_quarantined_on_load() {
        let p = persistence("pw");
        p.save(Artifact::Vectors, "1", &vec![1.0f32]).unwrap();
        p.save(Artifact::Vectors, "2", &vec![2.0f32]).unwrap();
        p.db.put(Artifact::Vectors, "3", b"garbage").unwrap();

        let (values, report) = p.load_all::<Vec<f32>>(Artifact::Vectors).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(report.quarantined, 1);
        assert_eq!(p.db.quarantine_count().unwrap(), 1);
        assert_eq!(p.db.count(Artifact::Vectors).unwrap(), 2);
    }

    #[test]
    fn test_dimension_pinned() {
        let p = persistence("pw");
        p.ensure_dimension(64).unwrap();
        p.ensure_dimension(64).unwrap();
        assert!(matches!(
            p.ensure_dimension(32),
            Err(EngineError::DimensionMismatch { expected: 64, actual: 32 })
        ));
    }

    #[test]
    fn test_forwards_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        db.put_forward(MemoryId(3), MemoryId(1)).unwrap();
        db.put_forward(MemoryId(3), MemoryId(2)).unwrap();
        assert_eq!(db.load_forwards().unwrap(), vec![(MemoryId(3), MemoryId(2))]);
    }
}
