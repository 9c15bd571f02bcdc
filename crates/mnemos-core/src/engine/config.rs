// Mnemos: configuration loading.
//
// Layering: defaults < TOML file < MNEMOS_* environment variables.

use log::info;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::atoms::config::{EmbeddingProviderKind, EngineConfig};
use crate::atoms::error::{EngineError, EngineResult};

/// Load config from `path` (if given), apply environment overrides, validate.
pub fn load_config(path: Option<&Path>) -> EngineResult<EngineConfig> {
    let mut config = match path {
        Some(p) => {
            let raw = std::fs::read_to_string(p)?;
            let cfg = parse_config(&raw)?;
            info!("[mnemos:config] Loaded {}", p.display());
            cfg
        }
        None => EngineConfig::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config(raw: &str) -> EngineResult<EngineConfig> {
    toml::from_str(raw).map_err(|e| EngineError::Config(format!("invalid config file: {}", e)))
}

fn parse<T: FromStr>(key: &str, value: &str) -> EngineResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("{} has an invalid value: {:?}", key, value)))
}

/// Apply `MNEMOS_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F) -> EngineResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    macro_rules! override_field {
        ($key:literal, $field:expr) => {
            if let Some(v) = lookup($key) {
                $field = parse($key, &v)?;
            }
        };
    }

    if let Some(dir) = lookup("MNEMOS_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    override_field!("MNEMOS_MAX_RECORDS", config.max_records);
    override_field!("MNEMOS_DUPLICATE_THRESHOLD", config.duplicate_threshold);
    override_field!("MNEMOS_MERGE_THRESHOLD", config.merge_threshold);
    override_field!("MNEMOS_DECAY_HALF_LIFE_HOURS", config.decay_half_life_hours);
    override_field!("MNEMOS_TOP_K", config.top_k);
    override_field!("MNEMOS_MAX_HOPS", config.max_hops);
    override_field!("MNEMOS_CONTEXT_BUDGET", config.context_budget);
    override_field!("MNEMOS_EMBEDDING_DIMENSION", config.embedding.dimension);
    override_field!("MNEMOS_EMBEDDING_TIMEOUT_MS", config.embedding.timeout_ms);
    override_field!("MNEMOS_MAINTENANCE_BUDGET_MS", config.maintenance.time_budget_ms);

    if let Some(url) = lookup("MNEMOS_EMBEDDING_URL") {
        config.embedding.base_url = url;
    }
    if let Some(model) = lookup("MNEMOS_EMBEDDING_MODEL") {
        config.embedding.model = model;
    }
    if let Some(kind) = lookup("MNEMOS_EMBEDDING_PROVIDER") {
        config.embedding.provider = match kind.trim().to_lowercase().as_str() {
            "ollama" => EmbeddingProviderKind::Ollama,
            "hashing" => EmbeddingProviderKind::Hashing,
            other => {
                return Err(EngineError::Config(format!(
                    "MNEMOS_EMBEDDING_PROVIDER must be ollama or hashing, got {:?}",
                    other
                )))
            }
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = parse_config(
            r#"
            max_records = 50
            [embedding]
            provider = "hashing"
            dimension = 64
            "#,
        )
        .unwrap();
        assert_eq!(cfg.max_records, 50);
        assert_eq!(cfg.embedding.provider, EmbeddingProviderKind::Hashing);
        assert_eq!(cfg.embedding.dimension, 64);
        assert_eq!(cfg.top_k, EngineConfig::default().top_k);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut cfg = parse_config("top_k = 3").unwrap();
        apply_env_overrides(
            &mut cfg,
            env(&[("MNEMOS_TOP_K", "12"), ("MNEMOS_EMBEDDING_PROVIDER", "Hashing")]),
        )
        .unwrap();
        assert_eq!(cfg.top_k, 12);
        assert_eq!(cfg.embedding.provider, EmbeddingProviderKind::Hashing);
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut cfg = EngineConfig::default();
        let err = apply_env_overrides(&mut cfg, env(&[("MNEMOS_MAX_HOPS", "many")])).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_unknown_toml_type_rejected() {
        assert!(parse_config("max_records = \"lots\"").is_err());
    }
}
