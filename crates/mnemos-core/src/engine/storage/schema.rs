// Database schema for the memory vault.
// Called once by Database::open() after the pragmas are applied.
// Adding a table or column: append an idempotent CREATE TABLE IF NOT EXISTS
// or ALTER TABLE … ADD COLUMN at the end of run_migrations(); never edit
// existing DDL, so older vaults upgrade in place.

use crate::atoms::error::EngineResult;
use log::info;
use rusqlite::Connection;

pub(crate) fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // ── Metadata ─────────────────────────────────────────────────────
    // vault_meta holds the KDF salt, key check value, and fixed dimension.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS vault_meta (
            key TEXT PRIMARY KEY,
            value BLOB NOT NULL
        );

        CREATE TABLE IF NOT EXISTS counters (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );
        ",
    )?;

    // ── Artifacts ────────────────────────────────────────────────────
    // Three independent tables; every `sealed` column is an envelope blob.
    // Row keys are memory ids (blobs, vectors) or HMAC blind indexes (graph).
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_blobs (
            row_key TEXT PRIMARY KEY,
            sealed BLOB NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS vector_entries (
            row_key TEXT PRIMARY KEY,
            sealed BLOB NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS graph_edges (
            row_key TEXT PRIMARY KEY,
            sealed BLOB NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    // ── Consolidation forwarding + quarantine ────────────────────────
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS memory_forwards (
            retired_id INTEGER PRIMARY KEY,
            survivor_id INTEGER NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS quarantine (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact TEXT NOT NULL,
            row_key TEXT NOT NULL,
            reason TEXT NOT NULL,
            sealed BLOB,
            quarantined_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_quarantine_artifact
            ON quarantine(artifact);
        ",
    )?;

    info!("[mnemos:storage] Schema ready");
    Ok(())
}
