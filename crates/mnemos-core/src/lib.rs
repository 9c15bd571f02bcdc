// Mnemos: encrypted long-term memory for a conversational assistant.
//
// atoms/  – pure types, config, constants, the error enum
// engine/ – stores, persistence, encryption, and the operations on them

pub mod atoms;
pub mod engine;

pub use atoms::config::{EmbeddingProviderKind, EngineConfig};
pub use atoms::error::{EngineError, EngineResult};
pub use atoms::types::{
    ContextBundle, ContextItem, ContextSource, EngineStats, ItemKind, MaintenanceReport, MemoryId,
    RecallOptions, TurnId, UserProfile,
};
pub use engine::consolidation::{run_maintenance, MaintenanceTask};
pub use engine::context::MemoryContext;
pub use engine::encryption::MasterSecret;
pub use engine::manager::{pin, reinforce, remember};
pub use engine::profile::user_profile;
pub use engine::retrieval::recall;
