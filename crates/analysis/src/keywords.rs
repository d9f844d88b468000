//! Keyword lifecycle: normalization, frequency accounting, similarity
//! merging, and cleanup. Keywords are global singletons per normalized
//! term and are never hard-deleted — maintenance soft-marks them instead.

use std::collections::BTreeSet;

use tracing::info;

use lore_object::{
    id_hash, IdHash, Keyword, ObjectData, ObjectError, RecipeRegistry, Subject, recipes, text,
};
use lore_store::{now_ms, StoreError, VersionedStore};

use crate::error::AnalysisError;

/// Lowercase a raw term and strip everything non-alphanumeric. An empty
/// result is a validation error, not a silent skip.
pub fn normalize_term(raw: &str) -> Result<String, ObjectError> {
    let normalized: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .filter(|ch| ch.is_alphanumeric())
        .collect();
    if normalized.is_empty() {
        return Err(ObjectError::validation(
            "term",
            "keyword term is empty after normalization",
        ));
    }
    Ok(normalized)
}

/// Id of the global keyword chain for a normalized term.
pub fn keyword_id(registry: &RecipeRegistry, term: &str) -> Result<IdHash, ObjectError> {
    id_hash(
        registry,
        &ObjectData::new(recipes::KEYWORD).with("term", text(term)),
    )
}

pub fn get_or_create(
    store: &VersionedStore,
    term: &str,
    seen_at: i64,
) -> Result<Keyword, StoreError> {
    let id = keyword_id(store.objects().registry(), term)?;
    match store.try_get_current_typed::<Keyword>(&id)? {
        Some(keyword) => Ok(keyword),
        None => Ok(Keyword::new(term, seen_at)),
    }
}

/// Record occurrences of a term in newly analyzed messages. Frequency is
/// monotonically non-decreasing by construction: this is the only writer
/// and it only adds.
pub fn record_occurrences(
    store: &VersionedStore,
    term: &str,
    occurrences: i64,
    seen_at: i64,
    subjects: &[IdHash],
) -> Result<Keyword, StoreError> {
    let mut keyword = get_or_create(store, term, seen_at)?;
    keyword.frequency += occurrences.max(0);
    keyword.last_seen = keyword.last_seen.max(seen_at);
    keyword.deleted = false;
    keyword.subjects.extend(subjects.iter().copied());
    store.put_typed(&keyword)?;
    Ok(keyword)
}

/// All non-deleted keywords referencing at least one of the given subjects.
pub fn keywords_for_subjects(
    store: &VersionedStore,
    subject_ids: &BTreeSet<IdHash>,
) -> Result<Vec<Keyword>, StoreError> {
    let mut keywords: Vec<Keyword> = store
        .iter_current_typed::<Keyword>()?
        .into_iter()
        .map(|(_, keyword)| keyword)
        .filter(|keyword| !keyword.deleted)
        .filter(|keyword| keyword.subjects.iter().any(|id| subject_ids.contains(id)))
        .collect();
    keywords.sort_by(|a, b| a.term.cmp(&b.term));
    Ok(keywords)
}

// ── Similarity merging ────────────────────────────────────────────────────

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Normalized similarity in `[0, 1]`; 1.0 means equal strings.
pub fn similarity(a: &str, b: &str) -> f64 {
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / longest as f64
}

/// Threshold above which two terms are considered duplicates.
const MERGE_SIMILARITY: f64 = 0.9;

/// Fold near-duplicate keywords: the higher-frequency term survives with
/// summed frequency and the union of subject references; losers are
/// soft-marked deleted. Subject keyword lists are rewritten in one pass.
/// Returns `(survivor, folded)` term pairs.
pub fn merge_similar(store: &VersionedStore) -> Result<Vec<(String, String)>, AnalysisError> {
    let mut keywords: Vec<Keyword> = store
        .iter_current_typed::<Keyword>()?
        .into_iter()
        .map(|(_, keyword)| keyword)
        .filter(|keyword| !keyword.deleted)
        .collect();
    keywords.sort_by(|a, b| a.term.cmp(&b.term));

    let mut folded: Vec<(String, String)> = Vec::new();
    let mut absorbed: BTreeSet<String> = BTreeSet::new();

    for i in 0..keywords.len() {
        if absorbed.contains(&keywords[i].term) {
            continue;
        }
        for j in (i + 1)..keywords.len() {
            if absorbed.contains(&keywords[j].term) {
                continue;
            }
            if similarity(&keywords[i].term, &keywords[j].term) < MERGE_SIMILARITY {
                continue;
            }
            // Survivor: higher frequency, ties to the lexically first.
            let (winner, loser) = if keywords[j].frequency > keywords[i].frequency {
                (j, i)
            } else {
                (i, j)
            };
            let loser_term = keywords[loser].term.clone();
            let loser_frequency = keywords[loser].frequency;
            let loser_subjects = keywords[loser].subjects.clone();

            keywords[winner].frequency += loser_frequency;
            keywords[winner].subjects.extend(loser_subjects);
            store.put_typed(&keywords[winner])?;

            keywords[loser].deleted = true;
            store.put_typed(&keywords[loser])?;

            rewrite_subject_terms(store, &loser_term, &keywords[winner].term)?;
            absorbed.insert(loser_term.clone());
            folded.push((keywords[winner].term.clone(), loser_term));
            if winner == j {
                // The survivor replaced the outer keyword; stop pairing
                // against the absorbed one.
                break;
            }
        }
    }

    if !folded.is_empty() {
        info!(merged = folded.len(), "keyword similarity merge folded duplicates");
    }
    Ok(folded)
}

/// Swap a folded term for its survivor in every subject's keyword list.
/// Subject identity is the frozen combination digest, so the list can be
/// rewritten without forking the chain.
fn rewrite_subject_terms(
    store: &VersionedStore,
    from: &str,
    to: &str,
) -> Result<(), StoreError> {
    for (_, mut subject) in store.iter_current_typed::<Subject>()? {
        if subject.keywords.remove(from) {
            subject.keywords.insert(to.to_string());
            store.put_typed(&subject)?;
        }
    }
    Ok(())
}

// ── Cleanup ───────────────────────────────────────────────────────────────

const DAY_MS: i64 = 24 * 3600 * 1000;

/// Soft-remove rarely used stale keywords: frequency below 2, first seen
/// more than 7 days ago, and last seen more than 30 days ago.
pub fn cleanup(store: &VersionedStore) -> Result<Vec<String>, AnalysisError> {
    let now = now_ms();
    let mut removed = Vec::new();
    for (id, mut keyword) in store.iter_current_typed::<Keyword>()? {
        if keyword.deleted || keyword.frequency >= 2 {
            continue;
        }
        let first_seen = store
            .chain(&id)?
            .first()
            .map(|record| record.timestamp_ms)
            .unwrap_or(now);
        if now - first_seen <= 7 * DAY_MS {
            continue;
        }
        if now - keyword.last_seen <= 30 * DAY_MS {
            continue;
        }
        keyword.deleted = true;
        store.put_typed(&keyword)?;
        removed.push(keyword.term);
    }
    if !removed.is_empty() {
        info!(removed = removed.len(), "keyword cleanup soft-removed stale terms");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::TempDir;

    use lore_object::{IdHash, RecipeRegistry};
    use lore_store::{ObjectStore, StoreDb, VersionedStore};

    use super::{
        get_or_create, levenshtein, merge_similar, normalize_term, record_occurrences, similarity,
    };

    fn store() -> Result<(TempDir, VersionedStore)> {
        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        Ok((dir, VersionedStore::new(ObjectStore::new(db, registry))))
    }

    #[test]
    fn normalization_lowercases_and_strips() -> Result<()> {
        assert_eq!(normalize_term("  Pizza! ")?, "pizza");
        assert_eq!(normalize_term("Mother-in-law")?, "motherinlaw");
        assert!(normalize_term("  !?  ").is_err());
        assert!(normalize_term("").is_err());
        Ok(())
    }

    #[test]
    fn frequency_is_monotonic_across_records() -> Result<()> {
        let (_dir, store) = store()?;
        record_occurrences(&store, "pizza", 1, 100, &[])?;
        record_occurrences(&store, "pizza", 2, 200, &[])?;
        let keyword = get_or_create(&store, "pizza", 0)?;
        assert_eq!(keyword.frequency, 3);
        assert_eq!(keyword.last_seen, 200);
        Ok(())
    }

    #[test]
    fn last_seen_never_moves_backwards() -> Result<()> {
        let (_dir, store) = store()?;
        record_occurrences(&store, "pizza", 1, 500, &[])?;
        record_occurrences(&store, "pizza", 1, 100, &[])?;
        assert_eq!(get_or_create(&store, "pizza", 0)?.last_seen, 500);
        Ok(())
    }

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("pizza", "pizza"), 0);
        assert!(similarity("pizzas", "pizza") >= 0.8);
        assert!(similarity("pizza", "zebra") < 0.5);
    }

    #[test]
    fn similar_terms_fold_into_the_frequent_one() -> Result<()> {
        let (_dir, store) = store()?;
        let subject_id = IdHash::from_bytes([3; 32]);
        record_occurrences(&store, "recipes", 5, 100, &[subject_id])?;
        record_occurrences(&store, "recipess", 1, 100, &[])?;
        record_occurrences(&store, "zebra", 1, 100, &[])?;

        let folded = merge_similar(&store)?;
        assert_eq!(folded, vec![("recipes".into(), "recipess".into())]);

        let survivor = get_or_create(&store, "recipes", 0)?;
        assert_eq!(survivor.frequency, 6);
        assert!(survivor.subjects.contains(&subject_id));

        let loser = get_or_create(&store, "recipess", 0)?;
        assert!(loser.deleted);

        let untouched = get_or_create(&store, "zebra", 0)?;
        assert!(!untouched.deleted);
        Ok(())
    }
}
