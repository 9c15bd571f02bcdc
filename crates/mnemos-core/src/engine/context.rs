// ── Mnemos: Memory Context ─────────────────────────────────────────────────
//
// Explicit handle bundling every store, the vault, and the collaborators.
// Every engine operation takes `&MemoryContext`; there is no global state.
//
// Open order matters: blobs load first because the vector index takes each
// record's text from its blob.

use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::atoms::config::EngineConfig;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{EngineStats, LoadReport};
use crate::engine::blobs::BlobStore;
use crate::engine::embedding::EmbeddingProvider;
use crate::engine::encryption::MasterSecret;
use crate::engine::extraction::{FactExtractor, PatternExtractor};
use crate::engine::graph::GraphStore;
use crate::engine::profile::ProfileCache;
use crate::engine::storage::{Artifact, Database, Persistence};
use crate::engine::vector_store::{VectorParams, VectorStore};

pub struct MemoryContext {
    pub config: EngineConfig,
    pub persist: Arc<Persistence>,
    pub blobs: BlobStore,
    pub vectors: VectorStore,
    pub graph: GraphStore,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub extractor: Arc<dyn FactExtractor>,
    /// What loading the artifacts found (quarantined rows etc).
    pub load_report: LoadReport,
    pub(crate) profile_cache: ProfileCache,
}

impl MemoryContext {
    /// Open the vault at the configured database path.
    pub fn open(
        config: EngineConfig,
        secret: &MasterSecret,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> EngineResult<Self> {
        let path = config.database_path();
        Self::open_at(&path, config, secret, embedder)
    }

    pub fn open_at(
        path: &Path,
        config: EngineConfig,
        secret: &MasterSecret,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> EngineResult<Self> {
        config.validate()?;
        Self::assemble(Database::open(path)?, config, secret, embedder)
    }

    /// Throwaway vault backed by an in-memory database.
    pub fn in_memory(
        config: EngineConfig,
        secret: &MasterSecret,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> EngineResult<Self> {
        config.validate()?;
        Self::assemble(Database::open_in_memory()?, config, secret, embedder)
    }

    fn assemble(
        db: Database,
        config: EngineConfig,
        secret: &MasterSecret,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> EngineResult<Self> {
        if embedder.dimension() != config.embedding.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: config.embedding.dimension,
                actual: embedder.dimension(),
            });
        }
        let persist = Arc::new(Persistence::unlock(db, secret)?);
        persist.ensure_dimension(config.embedding.dimension)?;

        let (blobs, mut report) = BlobStore::load(persist.clone())?;
        let (vectors, vector_report) =
            VectorStore::load(persist.clone(), VectorParams::from(&config), &blobs)?;
        report.merge(vector_report);
        let (graph, graph_report) = GraphStore::load(persist.clone())?;
        report.merge(graph_report);

        for w in &report.warnings {
            warn!("[mnemos:context] {}", w);
        }
        info!(
            "[mnemos:context] Ready: {} records ({} pending), embedder {}",
            vectors.len(),
            blobs.pending().len(),
            embedder.model_name()
        );

        Ok(Self {
            config,
            persist,
            blobs,
            vectors,
            graph,
            embedder,
            extractor: Arc::new(PatternExtractor::new()),
            load_report: report,
            profile_cache: ProfileCache::default(),
        })
    }

    /// Swap the fact extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn FactExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_millis(self.config.embedding.timeout_ms)
    }

    pub fn stats(&self) -> EngineResult<EngineStats> {
        let records = self.vectors.snapshot();
        let (active_edges, inactive_edges) = self.graph.counts();
        let mean_importance = if records.is_empty() {
            0.0
        } else {
            records.iter().map(|r| r.importance).sum::<f32>() / records.len() as f32
        };
        Ok(EngineStats {
            records: records.len(),
            pending: self.blobs.pending().len(),
            pinned: records.iter().filter(|r| r.pinned).count(),
            active_edges,
            inactive_edges,
            forwards: self.vectors.forward_count(),
            quarantined: self.persist.db.quarantine_count()?,
            mean_importance,
            dimension: self.vectors.dimension(),
        })
    }

    /// Row counts per artifact table, for diagnostics.
    pub fn artifact_rows(&self) -> EngineResult<[(&'static str, usize); 3]> {
        let db = &self.persist.db;
        Ok([
            (Artifact::Blobs.name(), db.count(Artifact::Blobs)?),
            (Artifact::Vectors.name(), db.count(Artifact::Vectors)?),
            (Artifact::Graph.name(), db.count(Artifact::Graph)?),
        ])
    }
}
