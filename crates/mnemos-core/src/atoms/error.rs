// ── Mnemos Atoms: Error Types ──────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by failure domain, not by call site.
//   • `#[from]` wires std/external error conversions automatically.
//   • No variant carries memory text or key material in its message.
//   • Graph conflicts and capacity pressure are NOT errors; they are reported
//     through `UpsertOutcome` and eviction counts respectively.

use thiserror::Error;

use crate::atoms::types::MemoryId;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// An embedding did not have the store's fixed dimensionality.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The embedding provider failed or timed out.
    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    /// Ciphertext was tampered with, corrupt, or sealed under another key.
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// No live (or forwarded) record carries this id.
    #[error("Unknown memory: {0}")]
    UnknownMemory(MemoryId),

    /// Caller-supplied input was rejected before anything was written.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// OS keychain / credential store failure.
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// SQLite / rusqlite database failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Catch-all for failures without a dedicated variant.
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// True for failures the read path degrades around instead of surfacing.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            EngineError::EmbeddingUnavailable(_) | EngineError::Decryption(_)
        )
    }
}

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_mismatch_message_names_both_sizes() {
        let err = EngineError::DimensionMismatch {
            expected: 384,
            actual: 768,
        };
        assert_eq!(err.to_string(), "Dimension mismatch: expected 384, got 768");
    }

    #[test]
    fn degradable_classification() {
        assert!(EngineError::EmbeddingUnavailable("timeout".into()).is_degradable());
        assert!(EngineError::Decryption("bad tag".into()).is_degradable());
        assert!(!EngineError::InvalidInput("empty".into()).is_degradable());
    }
}
