//! Versioned topic summaries.
//!
//! Summaries form a chain like any other versioned object, with an
//! explicit integer version and weight-ordered subject references. Pruning
//! keeps the recent window and never touches the head.

use tracing::info;

use lore_object::{
    id_hash, ContentHash, IdHash, ObjectData, ObjectError, RecipeRegistry, Storable, Subject,
    Summary, SummarySubject, SUMMARY_MAX_CHARS, recipes, text,
};
use lore_store::{now_ms, PutVersioned, StoreError, VersionedStore};

use crate::error::AnalysisError;

const DAY_MS: i64 = 24 * 3600 * 1000;

/// Default retention rules.
pub const MAX_VERSIONS: usize = 10;
pub const RETENTION_MS: i64 = 30 * DAY_MS;

pub fn summary_id(registry: &RecipeRegistry, topic_id: &str) -> Result<IdHash, ObjectError> {
    id_hash(
        registry,
        &ObjectData::new(recipes::SUMMARY).with("topicId", text(topic_id)),
    )
}

pub fn current_summary(
    store: &VersionedStore,
    topic_id: &str,
) -> Result<Option<Summary>, StoreError> {
    let id = summary_id(store.objects().registry(), topic_id)?;
    store.try_get_current_typed(&id)
}

pub fn summary_history(
    store: &VersionedStore,
    topic_id: &str,
) -> Result<Vec<Summary>, StoreError> {
    let id = summary_id(store.objects().registry(), topic_id)?;
    store
        .history(&id)?
        .iter()
        .map(Summary::from_data)
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::from)
}

/// Append a new summary version. The version number continues the chain;
/// content is bounded at [`SUMMARY_MAX_CHARS`].
pub fn write_version(
    store: &VersionedStore,
    topic_id: &str,
    content: &str,
    subjects: Vec<SummarySubject>,
) -> Result<(Summary, PutVersioned), AnalysisError> {
    if content.chars().count() > SUMMARY_MAX_CHARS {
        return Err(AnalysisError::Object(ObjectError::validation(
            "content",
            format!("summary exceeds {SUMMARY_MAX_CHARS} characters"),
        )));
    }
    let version = current_summary(store, topic_id)?
        .map(|summary| summary.version + 1)
        .unwrap_or(1);
    let summary = Summary {
        topic_id: topic_id.to_string(),
        version,
        content: content.to_string(),
        subjects,
        previous_version: None,
    };
    let put = store.put_typed(&summary)?;
    Ok((summary, put))
}

/// Deterministic summary text composed from subject state, used when the
/// analyzer supplies no free-form delta.
pub fn compose_content(subjects: &[(IdHash, Subject)]) -> String {
    if subjects.is_empty() {
        return String::new();
    }
    let mut ranked: Vec<&Subject> = subjects.iter().map(|(_, subject)| subject).collect();
    ranked.sort_by(|a, b| {
        b.message_count
            .cmp(&a.message_count)
            .then_with(|| a.name.cmp(&b.name))
    });
    let body = ranked
        .iter()
        .map(|subject| format!("{} ({} messages)", subject.name, subject.message_count))
        .collect::<Vec<_>>()
        .join("; ");
    let mut content = format!("Discussed: {body}");
    if content.chars().count() > SUMMARY_MAX_CHARS {
        content = content.chars().take(SUMMARY_MAX_CHARS).collect();
    }
    content
}

/// Weight-ordered subject references with weights normalized to sum 1.0.
pub fn weighted_subjects(subjects: &[(IdHash, Subject)]) -> Vec<SummarySubject> {
    let total: i64 = subjects
        .iter()
        .map(|(_, subject)| subject.message_count.max(0))
        .sum();
    if total == 0 {
        let share = 1.0 / subjects.len().max(1) as f64;
        return subjects
            .iter()
            .map(|(id, _)| SummarySubject {
                subject: *id,
                weight: share,
            })
            .collect();
    }
    let mut weighted: Vec<(&IdHash, &Subject, f64)> = subjects
        .iter()
        .map(|(id, subject)| {
            (
                id,
                subject,
                subject.message_count.max(0) as f64 / total as f64,
            )
        })
        .collect();
    weighted.sort_by(|(_, a, wa), (_, b, wb)| {
        wb.partial_cmp(wa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.name.cmp(&b.name))
    });
    weighted
        .into_iter()
        .map(|(id, _, weight)| SummarySubject {
            subject: *id,
            weight,
        })
        .collect()
}

/// Prune old summary versions. The newest [`MAX_VERSIONS`] always stay;
/// older revisions go once they age past the retention window, or
/// unconditionally when the chain has grown beyond twice the cap. The head
/// is structurally protected by the store. Removals are logged — there is
/// no silent loss.
pub fn prune(
    store: &VersionedStore,
    topic_id: &str,
    max_versions: usize,
    retention_ms: i64,
) -> Result<Vec<ContentHash>, AnalysisError> {
    let id = summary_id(store.objects().registry(), topic_id)?;
    let chain = store.chain(&id)?;
    if chain.len() <= max_versions {
        return Ok(Vec::new());
    }
    let overgrown = chain.len() > 2 * max_versions;
    let cutoff = now_ms() - retention_ms;
    let doomed: Vec<ContentHash> = chain[..chain.len() - max_versions]
        .iter()
        .filter(|record| overgrown || record.timestamp_ms < cutoff)
        .map(|record| record.content)
        .collect();
    if doomed.is_empty() {
        return Ok(Vec::new());
    }
    let removed = store.remove_versions(&id, &doomed)?;
    info!(
        topic_id,
        removed = removed.len(),
        remaining = chain.len() - removed.len(),
        "summary versions pruned"
    );
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::TempDir;

    use lore_object::{IdHash, RecipeRegistry, Subject};
    use lore_store::{ObjectStore, StoreDb, VersionedStore};

    use super::{
        compose_content, current_summary, prune, summary_history, weighted_subjects,
        write_version, MAX_VERSIONS, RETENTION_MS,
    };

    fn store() -> Result<(TempDir, VersionedStore)> {
        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        Ok((dir, VersionedStore::new(ObjectStore::new(db, registry))))
    }

    fn subject(name: &str, count: i64) -> (IdHash, Subject) {
        let keywords: BTreeSet<String> = name.split(' ').map(str::to_owned).collect();
        let mut subject = Subject::new("t1", keywords, 0);
        subject.name = name.to_string();
        subject.message_count = count;
        (IdHash::from_bytes([count as u8; 32]), subject)
    }

    #[test]
    fn versions_chain_with_increasing_numbers() -> Result<()> {
        let (_dir, store) = store()?;
        let (_, v1) = write_version(&store, "t1", "v1", Vec::new())?;
        let (_, v2) = write_version(&store, "t1", "v2", Vec::new())?;
        write_version(&store, "t1", "v3", Vec::new())?;

        let history = summary_history(&store, "t1")?;
        assert_eq!(history.len(), 3);
        let current = current_summary(&store, "t1")?.unwrap();
        assert_eq!(current.version, 3);
        assert_eq!(current.previous_version, Some(v2.version));
        assert_eq!(history[1].previous_version, Some(v1.version));
        Ok(())
    }

    #[test]
    fn oversized_content_is_rejected() -> Result<()> {
        let (_dir, store) = store()?;
        let huge = "x".repeat(3001);
        assert!(write_version(&store, "t1", &huge, Vec::new()).is_err());
        Ok(())
    }

    #[test]
    fn weights_sum_to_one_and_rank_by_share() {
        let subjects = vec![subject("children education", 3), subject("education foreigners", 2)];
        let weighted = weighted_subjects(&subjects);
        let total: f64 = weighted.iter().map(|w| w.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((weighted[0].weight - 0.6).abs() < 1e-9);
        assert!((weighted[1].weight - 0.4).abs() < 1e-9);
    }

    #[test]
    fn composed_content_is_deterministic() {
        let subjects = vec![subject("children education", 3), subject("education foreigners", 2)];
        let first = compose_content(&subjects);
        let second = compose_content(&subjects);
        assert_eq!(first, second);
        assert!(first.starts_with("Discussed: "));
        assert!(first.contains("children education (3 messages)"));
    }

    #[test]
    fn overgrown_chain_prunes_to_the_cap() -> Result<()> {
        let (_dir, store) = store()?;
        for n in 0..(2 * MAX_VERSIONS + 5) {
            write_version(&store, "t1", &format!("v{n}"), Vec::new())?;
        }
        prune(&store, "t1", MAX_VERSIONS, RETENTION_MS)?;

        let history = summary_history(&store, "t1")?;
        assert_eq!(history.len(), MAX_VERSIONS);
        let current = current_summary(&store, "t1")?.unwrap();
        assert_eq!(
            history.last().map(|summary| summary.version),
            Some(current.version)
        );
        Ok(())
    }

    #[test]
    fn young_chains_within_twice_the_cap_are_kept() -> Result<()> {
        let (_dir, store) = store()?;
        for n in 0..(MAX_VERSIONS + 3) {
            write_version(&store, "t1", &format!("v{n}"), Vec::new())?;
        }
        let removed = prune(&store, "t1", MAX_VERSIONS, RETENTION_MS)?;
        assert!(removed.is_empty());
        assert_eq!(summary_history(&store, "t1")?.len(), MAX_VERSIONS + 3);
        Ok(())
    }
}
