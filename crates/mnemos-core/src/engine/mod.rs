// Mnemos engine: the stores, the write and read paths, and maintenance.
// Every operation takes an explicit `&MemoryContext`.

pub mod blobs;
pub mod config;
pub mod consolidation;
pub mod context;
pub mod embedding;
pub mod encryption;
pub mod extraction;
pub mod graph;
pub mod manager;
pub mod profile;
pub mod retrieval;
pub mod snapshot;
pub mod storage;
pub mod vector_store;
