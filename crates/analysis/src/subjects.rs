//! Subject lifecycle: creation per distinct keyword combination, activity
//! updates, archival, and explicit merges.

use std::collections::BTreeSet;

use tracing::info;

use lore_object::{id_hash, IdHash, ObjectData, RecipeRegistry, Subject, recipes, text};
use lore_store::{now_ms, StoreError, VersionedStore};

use crate::error::AnalysisError;
use crate::keywords;

const DAY_MS: i64 = 24 * 3600 * 1000;

/// Inactivity span after which a subject is archived, and the archival
/// span after which it may be purged.
pub const ARCHIVE_AFTER_MS: i64 = 30 * DAY_MS;
pub const PURGE_AFTER_MS: i64 = 30 * DAY_MS;

/// Jaccard similarity: `|A∩B| / |A∪B|`; 0 for disjoint sets (and for an
/// empty side), 1 for identical non-empty sets.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Pair threshold above which the pipeline suggests a merge.
pub const MERGE_SUGGESTION_JACCARD: f64 = 0.8;

/// Id of the subject chain for a keyword combination in one topic. The
/// combination digest is frozen at creation; later keyword rewrites do not
/// move the identity.
pub fn subject_id(
    registry: &RecipeRegistry,
    topic_id: &str,
    keywords: &BTreeSet<String>,
) -> Result<IdHash, AnalysisError> {
    let digest = Subject::keyword_set_digest(keywords);
    Ok(id_hash(
        registry,
        &ObjectData::new(recipes::SUBJECT)
            .with("topicId", text(topic_id))
            .with("keywordSetHash", text(digest)),
    )?)
}

/// Current subjects of a topic, archived ones included.
pub fn subjects_of_topic(
    store: &VersionedStore,
    topic_id: &str,
) -> Result<Vec<(IdHash, Subject)>, StoreError> {
    let mut subjects: Vec<(IdHash, Subject)> = store
        .iter_current_typed::<Subject>()?
        .into_iter()
        .filter(|(_, subject)| subject.topic_id == topic_id)
        .collect();
    subjects.sort_by(|(_, a), (_, b)| a.name.cmp(&b.name));
    Ok(subjects)
}

/// Active (non-archived) subjects of a topic.
pub fn active_subjects(
    store: &VersionedStore,
    topic_id: &str,
) -> Result<Vec<(IdHash, Subject)>, StoreError> {
    Ok(subjects_of_topic(store, topic_id)?
        .into_iter()
        .filter(|(_, subject)| !subject.archived)
        .collect())
}

/// Outcome of observing a keyword combination in new messages.
pub struct SubjectUpdate {
    pub id: IdHash,
    pub subject: Subject,
    pub created: bool,
}

/// Create the subject for a combination, or refresh an existing one.
/// `additional_messages` uses add semantics for incremental analysis and
/// absolute semantics when `absolute` is set (deterministic re-derivation).
pub fn observe_combination(
    store: &VersionedStore,
    topic_id: &str,
    name: &str,
    combination: &BTreeSet<String>,
    message_count: i64,
    observed_at: i64,
    absolute: bool,
) -> Result<SubjectUpdate, AnalysisError> {
    let id = subject_id(store.objects().registry(), topic_id, combination)?;
    match store.try_get_current_typed::<Subject>(&id)? {
        Some(mut subject) => {
            if absolute {
                subject.message_count = subject.message_count.max(message_count);
            } else {
                subject.message_count += message_count;
            }
            subject.timestamp = subject.timestamp.max(observed_at);
            // Activity un-archives; archival is reversible.
            subject.archived = false;
            subject.archived_at = None;
            store.put_typed(&subject)?;
            Ok(SubjectUpdate {
                id,
                subject,
                created: false,
            })
        }
        None => {
            let mut subject = Subject::new(topic_id, combination.clone(), observed_at);
            if !name.is_empty() {
                subject.name = name.to_string();
            }
            subject.message_count = message_count;
            store.put_typed(&subject)?;
            Ok(SubjectUpdate {
                id,
                subject,
                created: true,
            })
        }
    }
}

/// Explicit subject merge. Both subjects must belong to `topic_id`; the
/// merged subject carries the summed message count and the union (or the
/// caller's override) of keywords, and the originals are archived.
pub fn merge_subjects(
    store: &VersionedStore,
    topic_id: &str,
    left: &IdHash,
    right: &IdHash,
    override_keywords: Option<BTreeSet<String>>,
) -> Result<(IdHash, Subject), AnalysisError> {
    let left_subject: Subject = store.get_current_typed(left)?;
    let right_subject: Subject = store.get_current_typed(right)?;
    for subject in [&left_subject, &right_subject] {
        if subject.topic_id != topic_id {
            return Err(AnalysisError::CrossTopicMerge {
                left: left_subject.topic_id.clone(),
                right: subject.topic_id.clone(),
            });
        }
    }

    let merged_keywords = override_keywords.unwrap_or_else(|| {
        left_subject
            .keywords
            .union(&right_subject.keywords)
            .cloned()
            .collect()
    });
    let now = now_ms();
    let mut merged = Subject::new(topic_id, merged_keywords.clone(), now);
    merged.message_count = left_subject.message_count + right_subject.message_count;
    merged.timestamp = left_subject.timestamp.max(right_subject.timestamp);
    let merged_put = store.put_typed(&merged)?;

    for (id, mut original) in [(left, left_subject), (right, right_subject)] {
        if *id == merged_put.id {
            continue;
        }
        original.archived = true;
        original.archived_at = Some(now);
        store.put_typed(&original)?;
    }

    // Point the merged combination's keywords at the new subject.
    for term in &merged_keywords {
        keywords::record_occurrences(store, term, 0, now, &[merged_put.id])?;
    }

    info!(topic_id, merged = %merged_put.id, "subjects merged");
    Ok((merged_put.id, merged))
}

/// Archive subjects inactive for [`ARCHIVE_AFTER_MS`], and purge chains
/// archived for another [`PURGE_AFTER_MS`]. Returns (archived, purged).
pub fn archive_pass(
    store: &VersionedStore,
) -> Result<(Vec<IdHash>, Vec<IdHash>), AnalysisError> {
    let now = now_ms();
    let mut archived = Vec::new();
    let mut purged = Vec::new();
    for (id, mut subject) in store.iter_current_typed::<Subject>()? {
        if !subject.archived && now - subject.timestamp > ARCHIVE_AFTER_MS {
            subject.archived = true;
            subject.archived_at = Some(now);
            store.put_typed(&subject)?;
            archived.push(id);
        } else if subject.archived
            && subject
                .archived_at
                .is_some_and(|at| now - at > PURGE_AFTER_MS)
        {
            store.drop_chain(&id)?;
            purged.push(id);
        }
    }
    if !archived.is_empty() || !purged.is_empty() {
        info!(
            archived = archived.len(),
            purged = purged.len(),
            "subject archive pass complete"
        );
    }
    Ok((archived, purged))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::TempDir;

    use lore_object::{RecipeRegistry, Subject};
    use lore_store::{ObjectStore, StoreDb, VersionedStore};

    use super::{jaccard, merge_subjects, observe_combination, subjects_of_topic};
    use crate::error::AnalysisError;

    fn store() -> Result<(TempDir, VersionedStore)> {
        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        Ok((dir, VersionedStore::new(ObjectStore::new(db, registry))))
    }

    fn set(terms: &[&str]) -> BTreeSet<String> {
        terms.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn jaccard_properties_hold() {
        let a = set(&["pizza", "dough", "yeast"]);
        let b = set(&["pizza", "recipe", "dough"]);
        let empty = BTreeSet::new();

        assert!((jaccard(&a, &b) - 0.5).abs() < 1e-9);
        assert!((jaccard(&a, &a) - 1.0).abs() < 1e-9);
        assert_eq!(jaccard(&a, &empty), 0.0);
        assert_eq!(jaccard(&empty, &empty), 0.0);
        assert_eq!(jaccard(&a, &b), jaccard(&b, &a));
        let j = jaccard(&a, &b);
        assert!((0.0..=1.0).contains(&j));
    }

    #[test]
    fn same_combination_updates_one_subject() -> Result<()> {
        let (_dir, store) = store()?;
        let first = observe_combination(&store, "t1", "", &set(&["children", "education"]), 2, 10, false)?;
        assert!(first.created);
        let second = observe_combination(&store, "t1", "", &set(&["education", "children"]), 1, 20, false)?;
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.subject.message_count, 3);
        assert_eq!(second.subject.timestamp, 20);
        Ok(())
    }

    #[test]
    fn distinct_combinations_become_distinct_subjects() -> Result<()> {
        let (_dir, store) = store()?;
        observe_combination(&store, "t2", "", &set(&["children", "education"]), 3, 10, false)?;
        observe_combination(&store, "t2", "", &set(&["foreigners", "education"]), 2, 10, false)?;
        assert_eq!(subjects_of_topic(&store, "t2")?.len(), 2);
        assert_eq!(subjects_of_topic(&store, "other")?.len(), 0);
        Ok(())
    }

    #[test]
    fn absolute_observation_is_idempotent() -> Result<()> {
        let (_dir, store) = store()?;
        observe_combination(&store, "t1", "", &set(&["pizza"]), 3, 10, false)?;
        let redo = observe_combination(&store, "t1", "", &set(&["pizza"]), 3, 10, true)?;
        assert_eq!(redo.subject.message_count, 3);
        Ok(())
    }

    #[test]
    fn merge_requires_same_topic() -> Result<()> {
        let (_dir, store) = store()?;
        let a = observe_combination(&store, "t1", "", &set(&["pizza"]), 1, 10, false)?;
        let b = observe_combination(&store, "t2", "", &set(&["dough"]), 1, 10, false)?;
        let result = merge_subjects(&store, "t1", &a.id, &b.id, None);
        assert!(matches!(result, Err(AnalysisError::CrossTopicMerge { .. })));
        Ok(())
    }

    #[test]
    fn merge_sums_counts_and_archives_originals() -> Result<()> {
        let (_dir, store) = store()?;
        let a = observe_combination(&store, "t1", "", &set(&["pizza", "dough"]), 3, 10, false)?;
        let b = observe_combination(&store, "t1", "", &set(&["pizza", "oven"]), 2, 20, false)?;

        let (merged_id, merged) = merge_subjects(&store, "t1", &a.id, &b.id, None)?;
        assert_eq!(merged.message_count, 5);
        assert_eq!(merged.keywords, set(&["dough", "oven", "pizza"]));
        assert_ne!(merged_id, a.id);

        let left: Subject = store.get_current_typed(&a.id)?;
        let right: Subject = store.get_current_typed(&b.id)?;
        assert!(left.archived && right.archived);
        Ok(())
    }
}
