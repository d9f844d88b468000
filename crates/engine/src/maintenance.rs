//! Periodic housekeeping across all subsystems.

use std::collections::BTreeSet;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lore_analysis::{keywords, subjects, summary};
use lore_object::{Summary, recipes};
use lore_proposal::CacheStats;
use lore_store::{orphan_sweep, store_stats, StoreStats, VersionedStore};

use crate::error::EngineError;

/// Object kinds eligible for the orphan sweep: content that only matters
/// while something references it.
const EPHEMERAL_KINDS: &[&str] = &[recipes::ENTRY, recipes::MESSAGE, recipes::ATTACHMENT];

const DAY_MS: i64 = 24 * 3600 * 1000;

#[derive(Debug, Clone, Default)]
pub struct MaintenanceReport {
    pub summaries_pruned: usize,
    pub keywords_folded: usize,
    pub keywords_cleaned: usize,
    pub subjects_archived: usize,
    pub subjects_purged: usize,
    pub orphans_swept: usize,
    pub store: StoreStats,
    pub proposal_cache: CacheStats,
}

/// One full maintenance pass.
pub fn run_once(
    store: &VersionedStore,
    orphan_age_days: i64,
    proposal_cache: CacheStats,
) -> Result<MaintenanceReport, EngineError> {
    let mut report = MaintenanceReport::default();

    // Summary pruning, per topic that has a summary chain.
    let topics: BTreeSet<String> = store
        .iter_current_typed::<Summary>()?
        .into_iter()
        .map(|(_, summary)| summary.topic_id)
        .collect();
    for topic_id in topics {
        report.summaries_pruned += summary::prune(
            store,
            &topic_id,
            summary::MAX_VERSIONS,
            summary::RETENTION_MS,
        )?
        .len();
    }

    report.keywords_folded = keywords::merge_similar(store)?.len();
    report.keywords_cleaned = keywords::cleanup(store)?.len();

    let (archived, purged) = subjects::archive_pass(store)?;
    report.subjects_archived = archived.len();
    report.subjects_purged = purged.len();

    report.orphans_swept =
        orphan_sweep(store, EPHEMERAL_KINDS, orphan_age_days * DAY_MS)?.len();

    report.store = store_stats(store)?;
    report.proposal_cache = proposal_cache;

    info!(
        summaries_pruned = report.summaries_pruned,
        keywords_folded = report.keywords_folded,
        keywords_cleaned = report.keywords_cleaned,
        subjects_archived = report.subjects_archived,
        orphans_swept = report.orphans_swept,
        objects = report.store.total_objects,
        "maintenance pass complete"
    );
    Ok(report)
}

/// Run maintenance on an interval until cancelled. Each pass is a batch
/// of synchronous store work, so it runs on the blocking pool.
pub async fn run_periodic(
    store: VersionedStore,
    interval: Duration,
    orphan_age_days: i64,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The immediate first tick is skipped; maintenance starts one full
    // interval after boot.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let store = store.clone();
                let pass = tokio::task::spawn_blocking(move || {
                    run_once(&store, orphan_age_days, CacheStats::default())
                })
                .await;
                match pass {
                    Ok(Ok(_)) => {}
                    Ok(Err(error)) => warn!(%error, "periodic maintenance failed"),
                    Err(error) => warn!(%error, "periodic maintenance task failed"),
                }
            }
        }
    }
}
