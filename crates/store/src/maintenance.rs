//! Store-level housekeeping: orphan sweeps and statistics.

use std::collections::{BTreeMap, HashSet};

use tracing::info;

use lore_object::{ContentHash, ObjectData, Value};

use crate::error::StoreError;
use crate::objects::now_ms;
use crate::versioned::VersionedStore;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KindStats {
    pub count: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub per_kind: BTreeMap<String, KindStats>,
    pub total_objects: u64,
    pub total_bytes: u64,
    pub average_versions: f64,
    pub quarantined: usize,
}

/// Collect every content hash pinned by some other piece of state: a
/// `referenceTo` field in a stored object, or membership in a version
/// chain. Id references do not pin content — they resolve through chains.
fn collect_pinned(store: &VersionedStore) -> Result<HashSet<ContentHash>, StoreError> {
    let mut pinned: HashSet<ContentHash> = store.chained_hashes()?.into_iter().collect();
    for hash in store.objects().all_hashes()? {
        let data = store.objects().get(&hash)?;
        collect_refs(&data, &mut pinned);
    }
    Ok(pinned)
}

fn collect_refs(data: &ObjectData, out: &mut HashSet<ContentHash>) {
    for (_, value) in data.fields() {
        collect_value_refs(value, out);
    }
}

fn collect_value_refs(value: &Value, out: &mut HashSet<ContentHash>) {
    match value {
        Value::Reference(hash) => {
            out.insert(*hash);
        }
        Value::Array(elements) | Value::Set(elements) => {
            for element in elements {
                collect_value_refs(element, out);
            }
        }
        Value::Object(nested) => collect_refs(nested, out),
        _ => {}
    }
}

/// Delete unreferenced blobs of the given kinds once they are older than
/// `max_age_ms`. Returns the swept hashes.
pub fn orphan_sweep(
    store: &VersionedStore,
    ephemeral_kinds: &[&str],
    max_age_ms: i64,
) -> Result<Vec<ContentHash>, StoreError> {
    let pinned = collect_pinned(store)?;
    let cutoff = now_ms() - max_age_ms;
    let mut swept = Vec::new();
    for hash in store.objects().all_hashes()? {
        if pinned.contains(&hash) {
            continue;
        }
        let Some(meta) = store.objects().meta_of(&hash)? else {
            continue;
        };
        if meta.created_ms > cutoff {
            continue;
        }
        if !ephemeral_kinds.contains(&meta.kind.as_str()) {
            continue;
        }
        store.objects().delete(&hash)?;
        swept.push(hash);
    }
    if !swept.is_empty() {
        info!(swept = swept.len(), "orphan sweep removed unreferenced blobs");
    }
    Ok(swept)
}

/// Aggregate counters over the whole store.
pub fn store_stats(store: &VersionedStore) -> Result<StoreStats, StoreError> {
    let mut stats = StoreStats::default();
    for hash in store.objects().all_hashes()? {
        let Some(meta) = store.objects().meta_of(&hash)? else {
            continue;
        };
        let entry = stats.per_kind.entry(meta.kind).or_default();
        entry.count += 1;
        entry.bytes += meta.size;
        stats.total_objects += 1;
        stats.total_bytes += meta.size;
    }
    stats.average_versions = store.average_versions()?;
    stats.quarantined = store.objects().quarantined()?.len();
    Ok(stats)
}
