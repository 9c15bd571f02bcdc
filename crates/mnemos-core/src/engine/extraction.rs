// ── Mnemos: Fact Extraction ────────────────────────────────────────────────
//
// Turns a remembered utterance into subject–predicate–object candidates for
// the knowledge graph. Pluggable through `FactExtractor`; the default
// `PatternExtractor` is a small set of compiled regexes covering first-person
// statements ("my favorite color is blue", "I live in Lyon") and simple
// third-person ones ("Alice likes jazz", "Alice is my sister").
//
// First-person facts get subject "user" and confidence 0.8; facts about
// other people get 0.6.

use regex::{Captures, Regex};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::atoms::constants::USER_ENTITY;
use crate::atoms::types::{normalize_entity, FactCandidate};

pub trait FactExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Vec<FactCandidate>;
}

const FIRST_PERSON_CONFIDENCE: f32 = 0.8;
const THIRD_PERSON_CONFIDENCE: f32 = 0.6;
const MAX_OBJECT_WORDS: usize = 6;

/// Object phrase: everything up to the next clause boundary.
const OBJECT: &str = r"([^.,;:!?\n]+)";

static FAVORITE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:(my)|(\w+)'s)\s+favou?rite\s+(\w+(?:\s\w+)?)\s+(?:is|are|was)\s+{}",
        OBJECT
    ))
    .unwrap()
});

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:my name is|call me|i am called|i'm called)\s+(\w[\w\-]*)").unwrap()
});

static PREFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bI\s+(?:really\s+|truly\s+|also\s+)?(like|love|enjoy|prefer|hate|dislike)\s+{}",
        OBJECT
    ))
    .unwrap()
});

static LIVES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"(?i)\bI\s+live\s+in\s+{}", OBJECT)).unwrap());

static WORKS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\bI\s+work\s+(?:at|for)\s+{}", OBJECT)).unwrap()
});

static MY_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?i)\bmy\s+(\w+(?:\s\w+)?)\s+(?:is|are)\s+{}", OBJECT)).unwrap()
});

// Case-sensitive: a capitalized word stands in for a name.
static THIRD_PERSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"\b([A-Z][a-z]+)\s+(likes|loves|enjoys|prefers|hates|dislikes|lives in|works at)\s+{}",
        OBJECT
    ))
    .unwrap()
});

static RELATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][a-z]+)\s+is\s+[Mm]y\s+(\w+)").unwrap());

fn third_person(verb: &str) -> String {
    match verb.to_lowercase().as_str() {
        "like" => "likes".into(),
        "love" => "loves".into(),
        "enjoy" => "enjoys".into(),
        "prefer" => "prefers".into(),
        "hate" => "hates".into(),
        "dislike" => "dislikes".into(),
        other => other.replace(' ', "_"),
    }
}

/// Trim filler from an object phrase; `None` when nothing usable is left.
fn clean_object(raw: &str) -> Option<String> {
    let mut obj = normalize_entity(raw);
    for prefix in ["called ", "named ", "to "] {
        if let Some(rest) = obj.strip_prefix(prefix) {
            obj = rest.to_string();
        }
    }
    for suffix in [" a lot", " very much", " too", " as well", " so much"] {
        if let Some(rest) = obj.strip_suffix(suffix) {
            obj = rest.to_string();
        }
    }
    let obj = obj.trim().to_string();
    let words = obj.split_whitespace().count();
    if words == 0 || words > MAX_OBJECT_WORDS {
        return None;
    }
    Some(obj)
}

fn owner(caps: &Captures, first_person: usize, possessor: usize) -> (String, f32) {
    if caps.get(first_person).is_some() {
        return (USER_ENTITY.to_string(), FIRST_PERSON_CONFIDENCE);
    }
    let name = caps
        .get(possessor)
        .map(|m| normalize_entity(m.as_str()))
        .unwrap_or_default();
    if name == USER_ENTITY {
        (name, FIRST_PERSON_CONFIDENCE)
    } else {
        (name, THIRD_PERSON_CONFIDENCE)
    }
}

/// Regex-driven extractor for common conversational statements.
#[derive(Debug, Default, Clone)]
pub struct PatternExtractor;

impl PatternExtractor {
    pub fn new() -> Self {
        Self
    }
}

impl FactExtractor for PatternExtractor {
    fn extract(&self, text: &str) -> Vec<FactCandidate> {
        let mut out: Vec<FactCandidate> = Vec::new();
        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        let mut push = |subject: String, predicate: String, object: Option<String>, confidence: f32| {
            let Some(object) = object else { return };
            if subject.is_empty() || predicate.is_empty() {
                return;
            }
            if seen.insert((subject.clone(), predicate.clone(), object.clone())) {
                out.push(FactCandidate {
                    subject,
                    predicate,
                    object,
                    confidence,
                });
            }
        };

        for caps in FAVORITE_RE.captures_iter(text) {
            let (subject, conf) = owner(&caps, 1, 2);
            let thing = normalize_entity(&caps[3]).replace(' ', "_");
            push(subject, format!("favorite_{}", thing), clean_object(&caps[4]), conf);
        }
        for caps in NAME_RE.captures_iter(text) {
            push(
                USER_ENTITY.into(),
                "name".into(),
                clean_object(&caps[1]),
                FIRST_PERSON_CONFIDENCE,
            );
        }
        for caps in PREFERENCE_RE.captures_iter(text) {
            push(
                USER_ENTITY.into(),
                third_person(&caps[1]),
                clean_object(&caps[2]),
                FIRST_PERSON_CONFIDENCE,
            );
        }
        for caps in LIVES_RE.captures_iter(text) {
            push(
                USER_ENTITY.into(),
                "lives_in".into(),
                clean_object(&caps[1]),
                FIRST_PERSON_CONFIDENCE,
            );
        }
        for caps in WORKS_RE.captures_iter(text) {
            push(
                USER_ENTITY.into(),
                "works_at".into(),
                clean_object(&caps[1]),
                FIRST_PERSON_CONFIDENCE,
            );
        }
        for caps in MY_ATTR_RE.captures_iter(text) {
            let attr = normalize_entity(&caps[1]);
            // Covered by the dedicated patterns above.
            if attr.starts_with("favo") || attr == "name" {
                continue;
            }
            push(
                USER_ENTITY.into(),
                attr.replace(' ', "_"),
                clean_object(&caps[2]),
                FIRST_PERSON_CONFIDENCE,
            );
        }
        for caps in THIRD_PERSON_RE.captures_iter(text) {
            let subject = normalize_entity(&caps[1]);
            if subject == "i" {
                continue;
            }
            push(
                subject,
                third_person(&caps[2]),
                clean_object(&caps[3]),
                THIRD_PERSON_CONFIDENCE,
            );
        }
        for caps in RELATION_RE.captures_iter(text) {
            push(
                USER_ENTITY.into(),
                normalize_entity(&caps[2]),
                clean_object(&caps[1]),
                FIRST_PERSON_CONFIDENCE,
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triples(text: &str) -> Vec<(String, String, String)> {
        PatternExtractor::new()
            .extract(text)
            .into_iter()
            .map(|f| (f.subject, f.predicate, f.object))
            .collect()
    }

    fn t(s: &str, p: &str, o: &str) -> (String, String, String) {
        (s.into(), p.into(), o.into())
    }

    #[test]
    fn test_possessive_user_favorite() {
        assert_eq!(
            triples("User's favorite color is blue"),
            vec![t("user", "favorite_color", "blue")]
        );
        assert_eq!(
            triples("My favourite food is pad thai."),
            vec![t("user", "favorite_food", "pad thai")]
        );
    }

    #[test]
    fn test_third_person_favorite_lower_confidence() {
        let facts = PatternExtractor::new().extract("Alice's favorite band is Radiohead");
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].subject, "alice");
        assert!(facts[0].confidence < FIRST_PERSON_CONFIDENCE);
    }

    #[test]
    fn test_preferences_and_places() {
        let got = triples("I really love hiking, and I live in Lyon. I work at Acme Corp");
        assert!(got.contains(&t("user", "loves", "hiking")));
        assert!(got.contains(&t("user", "lives_in", "lyon")));
        assert!(got.contains(&t("user", "works_at", "acme corp")));
    }

    #[test]
    fn test_name_and_attributes() {
        let got = triples("My name is Sam. My cat is called Miso");
        assert!(got.contains(&t("user", "name", "sam")));
        assert!(got.contains(&t("user", "cat", "miso")));
        assert!(!got.iter().any(|(_, p, _)| p == "favorite"));
    }

    #[test]
    fn test_relations_chain() {
        let got = triples("Alice is my sister. Alice likes jazz too");
        assert!(got.contains(&t("user", "sister", "alice")));
        assert!(got.contains(&t("alice", "likes", "jazz")));
    }

    #[test]
    fn test_no_facts_in_small_talk() {
        assert!(triples("ok, sounds good!").is_empty());
    }

    #[test]
    fn test_overlong_object_skipped() {
        assert!(triples("I like it when the weather is warm and the sky stays clear all day").is_empty());
    }
}
