// End-to-end behavior of the memory engine through its public operations.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use mnemos_core::atoms::config::{EmbeddingProviderKind, EngineConfig};
use mnemos_core::atoms::error::{EngineError, EngineResult};
use mnemos_core::atoms::types::{ContextSource, EdgeKey, ItemKind, MemoryId, RecallOptions};
use mnemos_core::engine::consolidation::run_maintenance;
use mnemos_core::engine::context::MemoryContext;
use mnemos_core::engine::embedding::{EmbeddingProvider, HashingEmbedder};
use mnemos_core::engine::encryption::MasterSecret;
use mnemos_core::engine::manager::{pin, reembed_pending, reinforce, remember, remember_keyword_only};
use mnemos_core::engine::profile::user_profile;
use mnemos_core::engine::retrieval::recall;
use mnemos_core::engine::snapshot::export_snapshot;
use mnemos_core::engine::storage::Artifact;

const DIM: usize = 128;

fn config() -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.embedding.provider = EmbeddingProviderKind::Hashing;
    cfg.embedding.dimension = DIM;
    cfg.embedding.timeout_ms = 200;
    cfg
}

fn secret() -> MasterSecret {
    MasterSecret::passphrase("correct horse battery staple").unwrap()
}

fn open(cfg: EngineConfig) -> MemoryContext {
    MemoryContext::in_memory(cfg, &secret(), Arc::new(HashingEmbedder::new(DIM))).unwrap()
}

fn temp_db(name: &str) -> PathBuf {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    std::env::temp_dir()
        .join(format!("mnemos-test-{}-{}-{}", name, std::process::id(), nanos))
        .join("mnemos.db")
}

fn opts(ctx: &MemoryContext) -> RecallOptions {
    ctx.config.recall_options()
}

struct FailingEmbedder;

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    fn model_name(&self) -> &str {
        "failing"
    }
    fn dimension(&self) -> usize {
        DIM
    }
    async fn embed(&self, _text: &str) -> EngineResult<Vec<f32>> {
        Err(EngineError::Other("connection refused".into()))
    }
}

struct SlowEmbedder;

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_name(&self) -> &str {
        "slow"
    }
    fn dimension(&self) -> usize {
        DIM
    }
    async fn embed(&self, _text: &str) -> EngineResult<Vec<f32>> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(vec![1.0; DIM])
    }
}

// ── Write path ─────────────────────────────────────────────────────────

#[tokio::test]
async fn favorite_color_round_trip() {
    let ctx = open(config());
    remember(&ctx, "User's favorite color is blue", "turn-1").await.unwrap();

    let bundle = recall(&ctx, "what color do I like?", opts(&ctx)).await;
    assert!(!bundle.degraded);
    assert!(bundle.top().unwrap().content.contains("blue"));
    assert!(bundle
        .items
        .iter()
        .any(|i| i.kind() == ItemKind::Fact && i.content.contains("blue")));

    let unrelated = recall(&ctx, "train schedule to the airport", opts(&ctx)).await;
    assert!(bundle.top_score() > unrelated.top_score());
}

#[tokio::test]
async fn remembering_twice_is_idempotent() {
    let ctx = open(config());
    let a = remember(&ctx, "I live in Lyon", "t1").await.unwrap();
    let edges_before = ctx.graph.counts();
    let b = remember(&ctx, "  I live   in Lyon ", "t2").await.unwrap();
    assert_eq!(a, b);
    assert_eq!(ctx.vectors.len(), 1);
    assert_eq!(ctx.blobs.len(), 1);
    assert_eq!(ctx.graph.counts(), edges_before);
}

#[tokio::test]
async fn stored_memory_always_has_its_blob() {
    let ctx = open(config());
    let id = remember(&ctx, "the spare key is under the mat", "t1").await.unwrap();
    assert!(ctx.blobs.contains(id));
    assert!(ctx.blobs.get(id).unwrap().embedded);

    remember(&ctx, "the spare key is under the mat", "t2").await.unwrap();
    assert_eq!(ctx.blobs.len(), 1);
    assert_eq!(ctx.persist.db.count(Artifact::Blobs).unwrap(), 1);
}

#[tokio::test]
async fn empty_text_rejected() {
    let ctx = open(config());
    let err = remember(&ctx, "   ", "t").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn unavailable_embedder_commits_nothing() {
    let ctx = MemoryContext::in_memory(config(), &secret(), Arc::new(FailingEmbedder)).unwrap();
    let err = remember(&ctx, "I work at Acme", "t").await.unwrap_err();
    assert!(matches!(err, EngineError::EmbeddingUnavailable(_)));
    assert!(ctx.vectors.is_empty());
    assert!(ctx.blobs.is_empty());
    assert_eq!(ctx.graph.counts(), (0, 0));
}

#[tokio::test]
async fn slow_embedder_times_out() {
    let ctx = MemoryContext::in_memory(config(), &secret(), Arc::new(SlowEmbedder)).unwrap();
    let started = Instant::now();
    let err = remember(&ctx, "I work at Acme", "t").await.unwrap_err();
    assert!(matches!(err, EngineError::EmbeddingUnavailable(_)));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(ctx.vectors.is_empty());
}

#[tokio::test]
async fn embedder_dimension_must_match_config() {
    let result = MemoryContext::in_memory(config(), &secret(), Arc::new(HashingEmbedder::new(64)));
    assert!(matches!(
        result,
        Err(EngineError::DimensionMismatch { expected: DIM, actual: 64 })
    ));
}

// ── Knowledge graph ────────────────────────────────────────────────────

#[tokio::test]
async fn newer_fact_supersedes_conflicting_one() {
    let ctx = open(config());
    remember(&ctx, "My favorite color is blue", "t1").await.unwrap();
    remember(&ctx, "My favorite color is green", "t2").await.unwrap();

    let active = ctx.graph.active_in_slot("user", "favorite_color").unwrap();
    assert_eq!(active.object, "green");
    let old = ctx.graph.get(&EdgeKey::new("user", "favorite_color", "blue")).unwrap();
    assert!(!old.is_active());
}

#[tokio::test]
async fn cyclic_relations_terminate() {
    let ctx = open(config());
    remember(&ctx, "Alice is my sister", "t1").await.unwrap();
    remember(&ctx, "Alice likes jazz", "t2").await.unwrap();
    let hits = ctx.graph.query_by_entity("user", 6);
    assert!(hits.iter().any(|h| h.edge.object == "jazz"));
    assert!(hits.len() <= ctx.graph.counts().0);
}

#[tokio::test]
async fn profile_lists_preferences() {
    let ctx = open(config());
    remember(&ctx, "I love hiking in the mountains", "t1").await.unwrap();
    remember(&ctx, "My favorite food is ramen", "t2").await.unwrap();
    let profile = user_profile(&ctx);
    assert!(profile.preferences.iter().any(|p| p.predicate == "loves"));
    assert!(profile
        .preferences
        .iter()
        .any(|p| p.predicate == "favorite_food" && p.object == "ramen"));
    assert_eq!(user_profile(&ctx).built_at, profile.built_at);
}

// ── Read path ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reinforce_changes_ranking() {
    let ctx = open(config());
    let a = remember(&ctx, "the train leaves at noon", "t1").await.unwrap();
    let b = remember(&ctx, "the train station is downtown", "t2").await.unwrap();

    let before = recall(&ctx, "train", opts(&ctx)).await;
    assert!(before.rank_of(a).is_some());
    assert!(before.rank_of(b).is_some());

    reinforce(&ctx, b, 0.5).unwrap();
    let after = recall(&ctx, "train", opts(&ctx)).await;
    assert_eq!(after.rank_of(b), Some(0));
    assert_eq!(after.rank_of(a), Some(1));
}

#[tokio::test]
async fn reinforce_unknown_id_fails() {
    let ctx = open(config());
    let err = reinforce(&ctx, MemoryId(999), 0.1).unwrap_err();
    assert!(matches!(err, EngineError::UnknownMemory(_)));
}

#[tokio::test]
async fn budget_skips_items_that_do_not_fit() {
    let ctx = open(config());
    remember(&ctx, "kayak trip on the lake with a very long description of the paddling route", "t1")
        .await
        .unwrap();
    remember(&ctx, "kayak rental", "t2").await.unwrap();
    let bundle = recall(
        &ctx,
        "kayak",
        RecallOptions {
            top_k: 5,
            max_hops: 2,
            context_budget: 20,
        },
    )
    .await;
    assert!(bundle.budget_used <= 20);
    assert!(bundle.items.iter().all(|i| i.content.chars().count() <= 20));
    assert!(bundle.items.iter().any(|i| i.content == "kayak rental"));
    assert!(bundle.candidates > bundle.items.len());
}

#[tokio::test]
async fn degraded_recall_uses_keywords_and_graph() {
    let ctx = MemoryContext::in_memory(config(), &secret(), Arc::new(FailingEmbedder)).unwrap();
    remember_keyword_only(&ctx, "My favorite color is blue", "t1").unwrap();

    let bundle = recall(&ctx, "favorite color", opts(&ctx)).await;
    assert!(bundle.degraded);
    assert!(!bundle.warnings.is_empty());
    assert!(bundle.items.iter().any(|i| i.content.contains("blue")));
}

#[tokio::test]
async fn degraded_facts_name_the_memory_that_stated_them() {
    let ctx = MemoryContext::in_memory(config(), &secret(), Arc::new(FailingEmbedder)).unwrap();
    let id = remember_keyword_only(&ctx, "Alice likes jazz", "t1").unwrap();

    let bundle = recall(&ctx, "what about alice", opts(&ctx)).await;
    assert!(bundle.degraded);
    let vias: Vec<MemoryId> = bundle
        .items
        .iter()
        .filter_map(|i| match i.source {
            ContextSource::Fact { via, .. } => Some(via),
            ContextSource::Memory { .. } => None,
        })
        .collect();
    assert!(!vias.is_empty());
    assert!(vias.iter().all(|v| *v == id));
}

// ── Maintenance ────────────────────────────────────────────────────────

#[tokio::test]
async fn consolidation_forwards_retired_ids() {
    let cfg = EngineConfig {
        merge_threshold: 0.6,
        ..config()
    };
    let ctx = open(cfg);
    let a = remember(&ctx, "coffee beans from kenya", "t1").await.unwrap();
    let b = remember(&ctx, "coffee beans from ethiopia", "t2").await.unwrap();
    assert_eq!(ctx.vectors.len(), 2);

    let report = run_maintenance(&ctx, Utc::now(), Instant::now() + Duration::from_secs(30));
    assert_eq!(report.clusters_merged, 1);
    assert_eq!(report.records_retired, 1);
    assert!(!report.aborted);

    assert_eq!(ctx.vectors.len(), 1);
    assert!(!ctx.blobs.contains(b));
    let survivor = reinforce(&ctx, b, 0.1).unwrap();
    assert_eq!(survivor.id, a);
}

#[tokio::test]
async fn decay_never_drops_below_floor() {
    let ctx = open(config());
    let id = remember(&ctx, "parking spot is level three", "t").await.unwrap();
    let later = Utc::now() + chrono::Duration::days(365);
    run_maintenance(&ctx, later, Instant::now() + Duration::from_secs(30));
    let rec = ctx.vectors.get(id).unwrap();
    assert!(rec.importance >= ctx.config.importance_floor - 1e-6);
    assert!(rec.importance < ctx.config.base_importance);
}

#[tokio::test]
async fn capacity_eviction_spares_pinned_records() {
    let cfg = EngineConfig {
        max_records: 2,
        ..config()
    };
    let ctx = open(cfg);
    let keep = remember(&ctx, "passport number ends in 42", "t1").await.unwrap();
    pin(&ctx, keep, true).unwrap();
    remember(&ctx, "lunch was a sandwich", "t2").await.unwrap();
    remember(&ctx, "the weather is rainy", "t3").await.unwrap();
    assert_eq!(ctx.vectors.len(), 2);
    assert!(ctx.vectors.contains(keep));
}

#[tokio::test]
async fn remember_never_evicts_new_record() {
    let cfg = EngineConfig {
        max_records: 2,
        ..config()
    };
    let ctx = open(cfg);
    let a = remember(&ctx, "dentist appointment on friday", "t1").await.unwrap();
    let b = remember(&ctx, "the router password is on the fridge", "t2").await.unwrap();
    reinforce(&ctx, a, 0.3).unwrap();
    reinforce(&ctx, b, 0.3).unwrap();

    let id = remember(&ctx, "My favorite color is blue", "t3").await.unwrap();
    assert_eq!(ctx.vectors.len(), 2);
    assert!(ctx.vectors.contains(id));
    assert!(ctx.blobs.contains(id));
    assert!(ctx.graph.active_in_slot("user", "favorite_color").is_some());
    assert!(reinforce(&ctx, id, 0.0).is_ok());
}

#[tokio::test]
async fn reembed_never_evicts_new_record() {
    let cfg = EngineConfig {
        max_records: 1,
        ..config()
    };
    let mut ctx = open(cfg);
    let old = remember(&ctx, "dentist appointment on friday", "t1").await.unwrap();
    reinforce(&ctx, old, 0.3).unwrap();

    ctx.embedder = Arc::new(FailingEmbedder);
    let pending = remember_keyword_only(&ctx, "the router password is on the fridge", "t2").unwrap();
    ctx.embedder = Arc::new(HashingEmbedder::new(DIM));

    let report = reembed_pending(&ctx).await.unwrap();
    assert_eq!(report.embedded, 1);
    assert!(ctx.vectors.contains(pending));
    assert!(ctx.blobs.get(pending).unwrap().embedded);
    assert!(!ctx.vectors.contains(old));
}

#[tokio::test]
async fn exhausted_budget_aborts_run() {
    let ctx = open(config());
    remember(&ctx, "one thing", "t").await.unwrap();
    let report = run_maintenance(&ctx, Utc::now(), Instant::now() - Duration::from_millis(1));
    assert!(report.aborted);
}

// ── Persistence & encryption ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = temp_db("reopen");
    let id = {
        let ctx = MemoryContext::open_at(&path, config(), &secret(), Arc::new(HashingEmbedder::new(DIM))).unwrap();
        remember(&ctx, "I work at Acme Corp", "t1").await.unwrap()
    };
    let ctx = MemoryContext::open_at(&path, config(), &secret(), Arc::new(HashingEmbedder::new(DIM))).unwrap();
    assert!(ctx.vectors.contains(id));
    assert_eq!(ctx.blobs.text(id).as_deref(), Some("I work at Acme Corp"));
    assert!(ctx.graph.active_in_slot("user", "works_at").is_some());

    let next = remember(&ctx, "I live in Oslo", "t2").await.unwrap();
    assert!(next > id);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let path = temp_db("secret");
    {
        let ctx = MemoryContext::open_at(&path, config(), &secret(), Arc::new(HashingEmbedder::new(DIM))).unwrap();
        remember(&ctx, "my locker code is 1234", "t").await.unwrap();
    }
    let wrong = MasterSecret::passphrase("hunter2").unwrap();
    let result = MemoryContext::open_at(&path, config(), &wrong, Arc::new(HashingEmbedder::new(DIM)));
    assert!(matches!(result, Err(EngineError::Decryption(_))));
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[tokio::test]
async fn snapshot_leaves_text_out_unless_asked() {
    let dir = temp_db("snapshot");
    let dir = dir.parent().unwrap().to_path_buf();
    let ctx = open(config());
    remember(&ctx, "My favorite color is blue", "t1").await.unwrap();

    let plain = export_snapshot(&ctx, Some(&dir.join("plain.json")), false).unwrap();
    let raw = std::fs::read_to_string(&plain).unwrap();
    assert!(!raw.contains("My favorite color is blue"));
    let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["stats"]["records"], 1);
    assert_eq!(json["graph"]["active_edges"], 1);
    assert_eq!(json["graph"]["predicates"]["favorite_color"], 1);
    assert!(json.get("memories").is_none());
    assert!(!json["insights"].as_array().unwrap().is_empty());

    let full = export_snapshot(&ctx, Some(&dir.join("full.json")), true).unwrap();
    let json: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&full).unwrap()).unwrap();
    assert_eq!(json["memories"][0]["text"], "My favorite color is blue");

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn stored_rows_are_not_plaintext() {
    let ctx = open(config());
    let id = remember(&ctx, "secret garden behind the library", "t").await.unwrap();
    let sealed = ctx.persist.db.get(Artifact::Blobs, &id.0.to_string()).unwrap().unwrap();
    let needle = b"garden";
    assert!(!sealed.windows(needle.len()).any(|w| w == needle));
}

#[tokio::test]
async fn tampered_row_is_quarantined_on_load() {
    let path = temp_db("tamper");
    let id = {
        let ctx = MemoryContext::open_at(&path, config(), &secret(), Arc::new(HashingEmbedder::new(DIM))).unwrap();
        let id = remember(&ctx, "gate code is 5678", "t").await.unwrap();
        remember(&ctx, "the plants need water on sunday", "t2").await.unwrap();
        let key = id.0.to_string();
        let mut sealed = ctx.persist.db.get(Artifact::Blobs, &key).unwrap().unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        ctx.persist.db.put(Artifact::Blobs, &key, &sealed).unwrap();
        id
    };
    let ctx = MemoryContext::open_at(&path, config(), &secret(), Arc::new(HashingEmbedder::new(DIM))).unwrap();
    assert!(ctx.load_report.quarantined >= 1);
    assert!(!ctx.blobs.contains(id));
    assert!(!ctx.vectors.contains(id));
    assert_eq!(ctx.vectors.len(), 1);
    assert!(ctx.stats().unwrap().quarantined >= 1);
    let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
