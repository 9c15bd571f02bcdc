// ── Mnemos Atoms: Engine Configuration ─────────────────────────────────────
//
// Every field has a default so a partial TOML file (or none at all) yields a
// working engine. Loading and env overrides live in engine/config.rs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::RecallOptions;

/// Which embedding backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Ollama / OpenAI-compatible HTTP endpoint.
    Ollama,
    /// Deterministic local feature hashing (offline, tests, CI).
    Hashing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub base_url: String,
    pub model: String,
    /// Fixed dimensionality of every stored embedding.
    pub dimension: usize,
    /// Per-call timeout for the provider.
    pub timeout_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Ollama,
            base_url: "http://localhost:11434".into(),
            model: "nomic-embed-text".into(),
            dimension: 768,
            timeout_ms: 10_000,
        }
    }
}

/// Weights of the composite retrieval score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionWeights {
    pub similarity: f32,
    pub importance: f32,
    pub confidence: f32,
    pub recency: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            similarity: 0.55,
            importance: 0.20,
            confidence: 0.15,
            recency: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// How often an external scheduler should run maintenance (seconds).
    pub interval_secs: u64,
    /// Wall-clock budget of one run.
    pub time_budget_ms: u64,
    /// Unprotected records untouched for longer than this are evicted.
    pub max_age_days: Option<u32>,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            time_budget_ms: 5_000,
            max_age_days: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ── Storage ───────────────────────────────────────────────────────
    /// Directory holding the database. `None` → platform data dir.
    pub data_dir: Option<PathBuf>,
    /// Soft ceiling on live memory records.
    pub max_records: usize,

    // ── Write path ────────────────────────────────────────────────────
    /// Cosine similarity at which a new turn counts as a duplicate.
    pub duplicate_threshold: f32,
    pub base_importance: f32,
    /// Fraction of the remaining distance to 1.0 added per access.
    pub access_boost: f32,

    // ── Consolidation & decay ─────────────────────────────────────────
    /// Pairwise similarity that puts two records in the same cluster.
    pub merge_threshold: f32,
    pub decay_half_life_hours: f32,
    pub importance_floor: f32,
    /// Records above this importance survive capacity pressure.
    pub protected_importance: f32,

    // ── Read path ─────────────────────────────────────────────────────
    pub top_k: usize,
    pub max_hops: usize,
    /// Bundle size limit in characters.
    pub context_budget: usize,
    pub min_similarity: f32,
    /// How many top vector hits seed graph traversal.
    pub graph_seed_count: usize,
    pub weights: FusionWeights,

    pub embedding: EmbeddingConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            max_records: 10_000,
            duplicate_threshold: 0.95,
            base_importance: 0.5,
            access_boost: 0.1,
            merge_threshold: 0.90,
            decay_half_life_hours: 24.0 * 14.0,
            importance_floor: 0.05,
            protected_importance: 0.9,
            top_k: 8,
            max_hops: DEFAULT_MAX_HOPS,
            context_budget: 2_000,
            min_similarity: 0.2,
            graph_seed_count: 3,
            weights: FusionWeights::default(),
            embedding: EmbeddingConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Recall options taken from the configured defaults.
    pub fn recall_options(&self) -> RecallOptions {
        RecallOptions {
            top_k: self.top_k,
            max_hops: self.max_hops,
            context_budget: self.context_budget,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        let dir = self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(DATA_DIR_NAME)
        });
        dir.join(DATABASE_FILE)
    }

    /// Reject values that would make the engine misbehave silently.
    pub fn validate(&self) -> EngineResult<()> {
        let unit = |name: &str, v: f32| -> EngineResult<()> {
            if !(0.0..=1.0).contains(&v) || v.is_nan() {
                return Err(EngineError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, v
                )));
            }
            Ok(())
        };
        unit("duplicate_threshold", self.duplicate_threshold)?;
        unit("merge_threshold", self.merge_threshold)?;
        unit("base_importance", self.base_importance)?;
        unit("access_boost", self.access_boost)?;
        unit("importance_floor", self.importance_floor)?;
        unit("protected_importance", self.protected_importance)?;
        unit("min_similarity", self.min_similarity)?;

        if self.max_records == 0 {
            return Err(EngineError::Config("max_records must be > 0".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(EngineError::Config(
                "embedding.dimension must be > 0".into(),
            ));
        }
        if !(self.decay_half_life_hours > 0.0) {
            return Err(EngineError::Config(
                "decay_half_life_hours must be positive".into(),
            ));
        }
        if self.max_hops > MAX_HOPS_LIMIT {
            return Err(EngineError::Config(format!(
                "max_hops must be at most {}",
                MAX_HOPS_LIMIT
            )));
        }
        let w = self.weights;
        if [w.similarity, w.importance, w.confidence, w.recency]
            .iter()
            .any(|x| *x < 0.0 || x.is_nan())
        {
            return Err(EngineError::Config(
                "fusion weights must be non-negative".into(),
            ));
        }
        if self.embedding.timeout_ms == 0 {
            return Err(EngineError::Config(
                "embedding.timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let cfg = EngineConfig {
            duplicate_threshold: 1.5,
            ..Default::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate_threshold"));
    }

    #[test]
    fn zero_half_life_rejected() {
        let cfg = EngineConfig {
            decay_half_life_hours: 0.0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn database_path_uses_data_dir() {
        let cfg = EngineConfig {
            data_dir: Some(PathBuf::from("/tmp/mnemos-test")),
            ..Default::default()
        };
        assert_eq!(
            cfg.database_path(),
            PathBuf::from("/tmp/mnemos-test").join(DATABASE_FILE)
        );
    }
}
