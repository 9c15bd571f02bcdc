// ── Mnemos: User Profile ───────────────────────────────────────────────────
//
// Derived summary of the user: preference-bearing facts plus the most
// important memories. Rebuilt lazily; the cached copy is valid while neither
// the vector store nor the graph has changed generation.

use chrono::Utc;
use log::debug;
use parking_lot::Mutex;

use crate::atoms::constants::{PROFILE_HIGHLIGHTS, USER_ENTITY};
use crate::atoms::types::{ProfileFact, ProfileHighlight, UserProfile};
use crate::engine::context::MemoryContext;

const PREFERENCE_PREDICATES: &[&str] = &["likes", "loves", "enjoys", "prefers", "dislikes", "hates"];

#[derive(Default)]
pub struct ProfileCache {
    /// (vector generation, graph generation, profile)
    slot: Mutex<Option<(u64, u64, UserProfile)>>,
}

fn is_preference(predicate: &str) -> bool {
    PREFERENCE_PREDICATES.contains(&predicate) || predicate.starts_with("favorite_")
}

/// Current profile, rebuilt only if a store changed since the last call.
pub fn user_profile(ctx: &MemoryContext) -> UserProfile {
    let generations = (ctx.vectors.generation(), ctx.graph.generation());
    let mut slot = ctx.profile_cache.slot.lock();
    if let Some((v, g, profile)) = slot.as_ref() {
        if (*v, *g) == generations {
            return profile.clone();
        }
    }
    let profile = build_profile(ctx);
    debug!(
        "[mnemos:profile] Rebuilt: {} preferences, {} highlights",
        profile.preferences.len(),
        profile.highlights.len()
    );
    *slot = Some((generations.0, generations.1, profile.clone()));
    profile
}

fn build_profile(ctx: &MemoryContext) -> UserProfile {
    let mut preferences: Vec<ProfileFact> = ctx
        .graph
        .active_about(USER_ENTITY)
        .into_iter()
        .filter(|e| is_preference(&e.predicate))
        .map(|e| ProfileFact {
            predicate: e.predicate,
            object: e.object,
            confidence: e.confidence,
        })
        .collect();
    preferences.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.predicate.cmp(&b.predicate))
            .then_with(|| a.object.cmp(&b.object))
    });

    let mut records = ctx.vectors.snapshot();
    records.retain(|r| r.importance >= ctx.config.base_importance);
    records.sort_by(|a, b| b.importance.total_cmp(&a.importance).then_with(|| a.id.cmp(&b.id)));
    let highlights = records
        .into_iter()
        .take(PROFILE_HIGHLIGHTS)
        .map(|r| ProfileHighlight {
            id: r.id,
            text: r.text,
            importance: r.importance,
        })
        .collect();

    UserProfile {
        preferences,
        highlights,
        built_at: Some(Utc::now()),
    }
}
