//! The topic analysis pipeline.
//!
//! Triggered every N messages per topic or explicitly. One run per topic
//! at a time; background triggers coalesce (latest wins) and the pending
//! queue sheds oldest entries beyond its cap — load shedding, not retry.
//! A run that fails or times out commits nothing and leaves the analysis
//! cursor where it was.
//!
//! Store and channel access inside a run is synchronous redb work, so it
//! executes on the blocking pool via `spawn_blocking`: disk I/O (and the
//! store's bounded retry backoff) suspends the analysis task instead of
//! stalling an async worker thread.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lore_llm::{
    tokenize, AnalysisRequest, AnalysisResult, Analyzer, MessageText, SubjectBrief,
};
use lore_object::{
    id_hash, AnalysisCursor, ContentHash, IdHash, Keyword, Message, ObjectData, Subject,
    Summary, recipes, text,
};
use lore_store::{ChannelLog, VersionedStore};

use crate::error::AnalysisError;
use crate::keywords::{self, keyword_id, normalize_term};
use crate::subjects::{
    self, active_subjects, jaccard, observe_combination, MERGE_SUGGESTION_JACCARD,
};
use crate::summary::{
    compose_content, current_summary, prune, summary_history, weighted_subjects, write_version,
    MAX_VERSIONS, RETENTION_MS,
};

#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// New messages per topic before a background analysis trigger fires.
    pub trigger_every: usize,
    /// Upper bound on one analyzer call.
    pub llm_timeout: Duration,
    /// Pending-topic queue bound; beyond it the oldest trigger is dropped.
    pub queue_cap: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            trigger_every: 5,
            llm_timeout: Duration::from_secs(30),
            queue_cap: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeSuggestion {
    pub left: IdHash,
    pub right: IdHash,
    pub jaccard: f64,
}

/// What one pipeline run did.
#[derive(Debug, Clone, Default)]
pub struct AnalysisSummary {
    pub topic_id: String,
    pub analyzed_messages: usize,
    pub new_subjects: usize,
    pub updated_subjects: usize,
    pub touched_keywords: usize,
    pub merge_suggestions: Vec<MergeSuggestion>,
    pub summary_updated: bool,
    pub summary_version: Option<i64>,
    pub elapsed_ms: u64,
}

#[derive(Default)]
struct TriggerState {
    counts: HashMap<String, usize>,
    pending: VecDeque<String>,
}

pub struct AnalysisPipeline {
    store: VersionedStore,
    channels: ChannelLog,
    analyzer: Arc<dyn Analyzer>,
    config: AnalysisConfig,
    triggers: Mutex<TriggerState>,
    run_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AnalysisPipeline {
    pub fn new(
        store: VersionedStore,
        channels: ChannelLog,
        analyzer: Arc<dyn Analyzer>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            store,
            channels,
            analyzer,
            config,
            triggers: Mutex::new(TriggerState::default()),
            run_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    // ── Triggering ───────────────────────────────────────────────────────

    /// Note one appended message. Returns true when the topic crossed the
    /// trigger threshold and was queued for analysis.
    pub fn note_message(&self, topic_id: &str) -> bool {
        let mut state = self
            .triggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = state.counts.entry(topic_id.to_string()).or_insert(0);
        *count += 1;
        if *count < self.config.trigger_every {
            return false;
        }
        *count = 0;
        // Coalesce: a topic queues at most once, the newest trigger wins
        // its place at the back.
        state.pending.retain(|pending| pending != topic_id);
        state.pending.push_back(topic_id.to_string());
        if state.pending.len() > self.config.queue_cap {
            if let Some(dropped) = state.pending.pop_front() {
                warn!(topic_id = %dropped, "analysis queue full, dropping oldest pending trigger");
            }
        }
        true
    }

    pub fn take_pending(&self) -> Option<String> {
        self.triggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pending
            .pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.triggers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pending
            .len()
    }

    /// Drain queued triggers sequentially. Analysis is best-effort: a
    /// failing topic is logged and skipped, the rest still run.
    pub async fn run_pending(&self, cancel: &CancellationToken) -> usize {
        let mut completed = 0;
        while let Some(topic_id) = self.take_pending() {
            if cancel.is_cancelled() {
                break;
            }
            match self.analyze(&topic_id, false, cancel).await {
                Ok(_) => completed += 1,
                Err(error) => warn!(topic_id, %error, "queued analysis run failed"),
            }
        }
        completed
    }

    // ── The run itself ───────────────────────────────────────────────────

    /// Analyze a topic. Incremental over messages since the cursor; with
    /// `force` and nothing new, re-derives from the full message range
    /// instead (idempotently).
    pub async fn analyze(
        &self,
        topic_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<AnalysisSummary, AnalysisError> {
        let run_lock = self.run_lock(topic_id);
        let _guard = run_lock.lock().await;
        let started = Instant::now();

        let mut summary = AnalysisSummary {
            topic_id: topic_id.to_string(),
            ..Default::default()
        };

        let plan = {
            let store = self.store.clone();
            let channels = self.channels.clone();
            let topic = topic_id.to_string();
            run_blocking(move || plan_run(&store, &channels, &topic, force)).await?
        };

        let planned = match plan {
            RunPlan::Idle => {
                debug!(topic_id, "nothing new to analyze");
                summary.elapsed_ms = started.elapsed().as_millis() as u64;
                return Ok(summary);
            }
            RunPlan::CursorOnly { newest } => {
                // Entries carried no message payloads; just move the cursor.
                let store = self.store.clone();
                let topic = topic_id.to_string();
                run_blocking(move || advance_cursor(&store, &topic, newest)).await?;
                summary.elapsed_ms = started.elapsed().as_millis() as u64;
                return Ok(summary);
            }
            RunPlan::Run(planned) => planned,
        };

        let result = match tokio::time::timeout(
            self.config.llm_timeout,
            self.analyzer.analyze(&planned.request, cancel),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(AnalysisError::Timeout {
                    seconds: self.config.llm_timeout.as_secs(),
                });
            }
        };

        let analyzed = if planned.absolute {
            0
        } else {
            planned.messages.len()
        };
        summary = {
            let store = self.store.clone();
            let topic = topic_id.to_string();
            run_blocking(move || {
                let mut summary = AnalysisSummary {
                    topic_id: topic.clone(),
                    ..Default::default()
                };
                apply(
                    &store,
                    &mut summary,
                    &topic,
                    &result,
                    &planned.messages,
                    planned.absolute,
                )?;
                if let Some(newest) = planned.newest {
                    // Cursor advances only after every write above succeeded.
                    advance_cursor(&store, &topic, newest)?;
                    prune(&store, &topic, MAX_VERSIONS, RETENTION_MS)?;
                }
                Ok(summary)
            })
            .await?
        };
        summary.analyzed_messages = analyzed;
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        if analyzed > 0 {
            info!(
                topic_id,
                messages = summary.analyzed_messages,
                new_subjects = summary.new_subjects,
                summary_updated = summary.summary_updated,
                "analysis run complete"
            );
        }
        Ok(summary)
    }

    // ── Queries ──────────────────────────────────────────────────────────
    //
    // Read-only lookups stay synchronous: they touch the mmapped tables
    // without writing, which is the non-suspending in-memory case.

    pub fn get_subjects(&self, topic_id: &str) -> Result<Vec<(IdHash, Subject)>, AnalysisError> {
        Ok(active_subjects(&self.store, topic_id)?)
    }

    pub fn get_keywords(&self, topic_id: &str) -> Result<Vec<Keyword>, AnalysisError> {
        let subject_ids: BTreeSet<IdHash> = subjects::subjects_of_topic(&self.store, topic_id)?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        Ok(keywords::keywords_for_subjects(&self.store, &subject_ids)?)
    }

    pub fn get_summary(
        &self,
        topic_id: &str,
        include_history: bool,
    ) -> Result<(Option<Summary>, Option<Vec<Summary>>), AnalysisError> {
        let current = current_summary(&self.store, topic_id)?;
        let history = if include_history {
            Some(summary_history(&self.store, topic_id)?)
        } else {
            None
        };
        Ok((current, history))
    }

    /// Manual summary edit: a new version with caller-provided content and
    /// the current subject weights.
    pub fn update_summary(
        &self,
        topic_id: &str,
        content: &str,
        reason: Option<&str>,
    ) -> Result<Summary, AnalysisError> {
        let active = active_subjects(&self.store, topic_id)?;
        let weighted = weighted_subjects(&active);
        let (written, _) = write_version(&self.store, topic_id, content, weighted)?;
        info!(
            topic_id,
            version = written.version,
            reason = reason.unwrap_or("unspecified"),
            "summary updated manually"
        );
        prune(&self.store, topic_id, MAX_VERSIONS, RETENTION_MS)?;
        Ok(written)
    }

    pub fn merge_subjects(
        &self,
        topic_id: &str,
        left: &IdHash,
        right: &IdHash,
        override_keywords: Option<BTreeSet<String>>,
    ) -> Result<(IdHash, Subject), AnalysisError> {
        subjects::merge_subjects(&self.store, topic_id, left, right, override_keywords)
    }

    fn run_lock(&self, topic_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .run_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(topic_id.to_string()).or_default().clone()
    }
}

// ── Run phases (blocking pool) ────────────────────────────────────────────

/// Everything a run needs before the analyzer call.
struct PlannedRun {
    /// Newest entry to record in the cursor; `None` for re-derivation
    /// passes, whose cursor is already at the head.
    newest: Option<ContentHash>,
    absolute: bool,
    messages: Vec<Message>,
    request: AnalysisRequest,
}

enum RunPlan {
    Idle,
    CursorOnly { newest: ContentHash },
    Run(PlannedRun),
}

async fn run_blocking<T, F>(work: F) -> Result<T, AnalysisError>
where
    F: FnOnce() -> Result<T, AnalysisError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|error| AnalysisError::Failed {
            cause: format!("blocking store task failed: {error}"),
        })?
}

fn plan_run(
    store: &VersionedStore,
    channels: &ChannelLog,
    topic_id: &str,
    force: bool,
) -> Result<RunPlan, AnalysisError> {
    let cursor_id = cursor_id(store, topic_id)?;
    let cursor: Option<AnalysisCursor> = store.try_get_current_typed(&cursor_id)?;
    let analyzed_until = cursor.as_ref().and_then(|c| c.last_analyzed_entry);

    // Entries newer than the cursor, newest first.
    let mut delta: Vec<(ContentHash, i64, ContentHash)> = Vec::new();
    for result in channels.iter_topic(topic_id)? {
        let (hash, entry) = result?;
        if Some(hash) == analyzed_until {
            break;
        }
        delta.push((hash, entry.creation_time, entry.data_hash));
    }

    if delta.is_empty() {
        if !force {
            return Ok(RunPlan::Idle);
        }
        // Deterministic re-derivation over the full range: subjects and
        // summary are recomputed, keyword frequencies stay untouched.
        let all = collect_all_messages(store, channels, topic_id)?;
        if all.is_empty() {
            return Ok(RunPlan::Idle);
        }
        let request = build_request(store, topic_id, &all)?;
        return Ok(RunPlan::Run(PlannedRun {
            newest: None,
            absolute: true,
            messages: all,
            request,
        }));
    }

    let newest = delta[0].0;
    let messages = load_messages(store, &delta)?;
    if messages.is_empty() {
        return Ok(RunPlan::CursorOnly { newest });
    }
    let request = build_request(store, topic_id, &messages)?;
    Ok(RunPlan::Run(PlannedRun {
        newest: Some(newest),
        absolute: false,
        messages,
        request,
    }))
}

fn build_request(
    store: &VersionedStore,
    topic_id: &str,
    messages: &[Message],
) -> Result<AnalysisRequest, AnalysisError> {
    let current = active_subjects(store, topic_id)?;
    let subject_ids: BTreeSet<IdHash> = current.iter().map(|(id, _)| *id).collect();
    let known_keywords = keywords::keywords_for_subjects(store, &subject_ids)?
        .into_iter()
        .map(|keyword| keyword.term)
        .collect();

    Ok(AnalysisRequest {
        topic_id: topic_id.to_string(),
        messages: messages
            .iter()
            .map(|message| MessageText {
                author: message.author.clone(),
                created_at: message.created_at,
                text: message.text.clone(),
            })
            .collect(),
        current_subjects: current
            .iter()
            .map(|(_, subject)| SubjectBrief {
                name: subject.name.clone(),
                keywords: subject.keywords.iter().cloned().collect(),
            })
            .collect(),
        known_keywords,
    })
}

/// Fold an analyzer result into the store. `absolute` marks a
/// re-derivation pass: subject counts are reconciled instead of added and
/// keyword frequencies are left alone.
fn apply(
    store: &VersionedStore,
    summary: &mut AnalysisSummary,
    topic_id: &str,
    result: &AnalysisResult,
    messages: &[Message],
    absolute: bool,
) -> Result<(), AnalysisError> {
    let token_sets: Vec<BTreeSet<String>> =
        messages.iter().map(|message| tokenize(&message.text)).collect();
    let latest_time = messages
        .iter()
        .map(|message| message.created_at)
        .max()
        .unwrap_or(0);

    // Subjects first, so keywords can back-reference them.
    let mut updates = Vec::new();
    for extracted in &result.subjects {
        let mut combination = BTreeSet::new();
        for raw in &extracted.keywords {
            combination.insert(normalize_term(raw)?);
        }
        if combination.is_empty() {
            continue;
        }
        let matching = token_sets
            .iter()
            .filter(|tokens| combination.is_subset(tokens))
            .count() as i64;
        let count = if absolute { matching } else { matching.max(1) };
        let update = observe_combination(
            store,
            topic_id,
            &extracted.name,
            &combination,
            count,
            latest_time,
            absolute,
        )?;
        if update.created {
            summary.new_subjects += 1;
        } else {
            summary.updated_subjects += 1;
        }
        updates.push(update);
    }

    // Keyword frequencies derive from the newly analyzed range only; a
    // re-derivation pass must not double count.
    let mut keyword_created = false;
    if !absolute {
        for extracted in &result.keywords {
            let term = normalize_term(&extracted.term)?;
            let existing_id = keyword_id(store.objects().registry(), &term)?;
            if store.current_hash(&existing_id)?.is_none() {
                keyword_created = true;
            }
            let occurrences = token_sets
                .iter()
                .filter(|tokens| tokens.contains(&term))
                .count()
                .max(1) as i64;
            let subject_ids: Vec<IdHash> = updates
                .iter()
                .filter(|update| update.subject.keywords.contains(&term))
                .map(|update| update.id)
                .collect();
            keywords::record_occurrences(store, &term, occurrences, latest_time, &subject_ids)?;
            summary.touched_keywords += 1;
        }
    }

    // Merge suggestions are surfaced, never auto-applied.
    let active = active_subjects(store, topic_id)?;
    for update in &updates {
        for (other_id, other) in &active {
            if *other_id == update.id {
                continue;
            }
            let score = jaccard(&update.subject.keywords, &other.keywords);
            if score >= MERGE_SUGGESTION_JACCARD {
                let (left, right) = if update.id < *other_id {
                    (update.id, *other_id)
                } else {
                    (*other_id, update.id)
                };
                if !summary
                    .merge_suggestions
                    .iter()
                    .any(|s| s.left == left && s.right == right)
                {
                    summary.merge_suggestions.push(MergeSuggestion {
                        left,
                        right,
                        jaccard: score,
                    });
                }
            }
        }
    }

    // Summary: a new version only when the derived sets changed and the
    // derived content actually differs.
    let sets_changed = summary.new_subjects > 0 || keyword_created;
    if !active.is_empty() {
        let content = if result.summary_delta.trim().is_empty() {
            compose_content(&active)
        } else {
            truncate_chars(result.summary_delta.trim(), lore_object::SUMMARY_MAX_CHARS)
        };
        let weighted = weighted_subjects(&active);
        let current = current_summary(store, topic_id)?;
        let identical = current
            .as_ref()
            .is_some_and(|c| c.content == content && c.subjects == weighted);
        if !identical && (sets_changed || current.is_none()) {
            let (written, _) = write_version(store, topic_id, &content, weighted)?;
            summary.summary_updated = true;
            summary.summary_version = Some(written.version);
        } else if let Some(current) = current {
            summary.summary_version = Some(current.version);
        }
    }
    Ok(())
}

fn cursor_id(store: &VersionedStore, topic_id: &str) -> Result<IdHash, AnalysisError> {
    Ok(id_hash(
        store.objects().registry(),
        &ObjectData::new(recipes::ANALYSIS_CURSOR).with("topicId", text(topic_id)),
    )?)
}

fn advance_cursor(
    store: &VersionedStore,
    topic_id: &str,
    newest: ContentHash,
) -> Result<(), AnalysisError> {
    let cursor = AnalysisCursor {
        topic_id: topic_id.to_string(),
        last_analyzed_entry: Some(newest),
        previous_version: None,
    };
    store.put_typed(&cursor)?;
    Ok(())
}

fn load_messages(
    store: &VersionedStore,
    delta: &[(ContentHash, i64, ContentHash)],
) -> Result<Vec<Message>, AnalysisError> {
    // Chronological order for the analyzer.
    let mut messages = Vec::new();
    for (_, _, data_hash) in delta.iter().rev() {
        if store.objects().kind_of(data_hash)?.as_deref() == Some(recipes::MESSAGE) {
            messages.push(store.objects().get_typed::<Message>(data_hash)?);
        }
    }
    Ok(messages)
}

fn collect_all_messages(
    store: &VersionedStore,
    channels: &ChannelLog,
    topic_id: &str,
) -> Result<Vec<Message>, AnalysisError> {
    let mut hashes = Vec::new();
    for result in channels.iter_topic(topic_id)? {
        let (hash, entry) = result?;
        hashes.push((hash, entry.creation_time, entry.data_hash));
    }
    load_messages(store, &hashes)
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        input.to_string()
    } else {
        input.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use anyhow::Result;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    use lore_llm::LexicalAnalyzer;
    use lore_object::{Message, RecipeRegistry, Storable};
    use lore_store::{ChannelLog, ObjectStore, StoreDb, VersionedStore};

    use super::{AnalysisConfig, AnalysisPipeline};

    fn pipeline() -> Result<(TempDir, AnalysisPipeline)> {
        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        let store = VersionedStore::new(ObjectStore::new(db, registry));
        let channels = ChannelLog::new(store.clone());
        let pipeline = AnalysisPipeline::new(
            store,
            channels,
            Arc::new(LexicalAnalyzer),
            AnalysisConfig::default(),
        );
        Ok((dir, pipeline))
    }

    fn post(pipeline: &AnalysisPipeline, topic: &str, body: &str, time: i64) -> Result<()> {
        let message = Message::new(None, time, "tester@x", body);
        let data_hash = pipeline.store().objects().put(&message.to_data())?;
        let channels = ChannelLog::new(pipeline.store().clone());
        channels.append(topic, None, data_hash, time)?;
        Ok(())
    }

    fn term_frequencies(pipeline: &AnalysisPipeline, topic: &str) -> Result<Vec<(String, i64)>> {
        let mut pairs: Vec<(String, i64)> = pipeline
            .get_keywords(topic)?
            .into_iter()
            .map(|keyword| (keyword.term, keyword.frequency))
            .collect();
        pairs.sort();
        Ok(pairs)
    }

    #[tokio::test]
    async fn keyword_extraction_counts_message_occurrences() -> Result<()> {
        let (_dir, pipeline) = pipeline()?;
        post(&pipeline, "t1", "pizza dough yeast", 10)?;
        post(&pipeline, "t1", "dough recipe", 20)?;

        let cancel = CancellationToken::new();
        let run = pipeline.analyze("t1", false, &cancel).await?;
        assert_eq!(run.analyzed_messages, 2);

        assert_eq!(
            term_frequencies(&pipeline, "t1")?,
            vec![
                ("dough".into(), 2),
                ("pizza".into(), 1),
                ("recipe".into(), 1),
                ("yeast".into(), 1),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn re_analysis_without_new_messages_changes_nothing() -> Result<()> {
        let (_dir, pipeline) = pipeline()?;
        post(&pipeline, "t1", "pizza dough yeast", 10)?;
        post(&pipeline, "t1", "dough recipe", 20)?;

        let cancel = CancellationToken::new();
        let first = pipeline.analyze("t1", false, &cancel).await?;
        assert!(first.summary_updated);
        let frequencies = term_frequencies(&pipeline, "t1")?;
        let (summary_before, _) = pipeline.get_summary("t1", false)?;

        let second = pipeline.analyze("t1", false, &cancel).await?;
        assert_eq!(second.analyzed_messages, 0);
        assert!(!second.summary_updated);
        assert_eq!(term_frequencies(&pipeline, "t1")?, frequencies);
        let (summary_after, _) = pipeline.get_summary("t1", false)?;
        assert_eq!(
            summary_before.as_ref().map(|s| s.version),
            summary_after.as_ref().map(|s| s.version)
        );
        Ok(())
    }

    #[tokio::test]
    async fn forced_re_derivation_is_idempotent() -> Result<()> {
        let (_dir, pipeline) = pipeline()?;
        post(&pipeline, "t1", "pizza dough yeast", 10)?;
        post(&pipeline, "t1", "dough recipe", 20)?;

        let cancel = CancellationToken::new();
        pipeline.analyze("t1", false, &cancel).await?;
        let subjects_before: Vec<_> = pipeline.get_subjects("t1")?;
        let (summary_before, _) = pipeline.get_summary("t1", false)?;

        pipeline.analyze("t1", true, &cancel).await?;
        pipeline.analyze("t1", true, &cancel).await?;

        let subjects_after: Vec<_> = pipeline.get_subjects("t1")?;
        let (summary_after, _) = pipeline.get_summary("t1", false)?;
        assert_eq!(
            subjects_before.iter().map(|(id, _)| id).collect::<Vec<_>>(),
            subjects_after.iter().map(|(id, _)| id).collect::<Vec<_>>()
        );
        assert_eq!(
            summary_before.as_ref().map(|s| (s.version, s.content.clone())),
            summary_after.as_ref().map(|s| (s.version, s.content.clone()))
        );
        assert_eq!(term_frequencies(&pipeline, "t1")?.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_keyword_sets_become_two_weighted_subjects() -> Result<()> {
        let (_dir, pipeline) = pipeline()?;
        for (body, time) in [
            ("children education", 10),
            ("children education", 20),
            ("children education", 30),
            ("foreigners education", 40),
            ("foreigners education", 50),
        ] {
            post(&pipeline, "t2", body, time)?;
        }

        let cancel = CancellationToken::new();
        pipeline.analyze("t2", false, &cancel).await?;

        let subjects = pipeline.get_subjects("t2")?;
        assert_eq!(subjects.len(), 2);

        let (summary, _) = pipeline.get_summary("t2", false)?;
        let summary = summary.expect("summary v1 exists");
        assert_eq!(summary.version, 1);
        assert_eq!(summary.subjects.len(), 2);
        let total: f64 = summary.subjects.iter().map(|s| s.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((summary.subjects[0].weight - 0.6).abs() < 1e-9);
        Ok(())
    }

    #[tokio::test]
    async fn empty_topic_analysis_is_a_no_op() -> Result<()> {
        let (_dir, pipeline) = pipeline()?;
        let cancel = CancellationToken::new();
        let run = pipeline.analyze("ghost", true, &cancel).await?;
        assert_eq!(run.analyzed_messages, 0);
        assert!(pipeline.get_subjects("ghost")?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn manual_summary_updates_version_the_chain() -> Result<()> {
        let (_dir, pipeline) = pipeline()?;
        pipeline.update_summary("t1", "v1", Some("init"))?;
        pipeline.update_summary("t1", "v2", Some("update"))?;
        let v3 = pipeline.update_summary("t1", "v3", None)?;
        assert_eq!(v3.version, 3);

        let (current, history) = pipeline.get_summary("t1", true)?;
        let history = history.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(current.as_ref().map(|s| s.version), Some(3));
        // The chain links each version to its predecessor's content hash.
        assert!(history[2].previous_version.is_some());
        Ok(())
    }

    #[test]
    fn triggers_coalesce_and_shed_load() -> Result<()> {
        let (_dir, pipeline) = pipeline()?;
        for _ in 0..5 {
            pipeline.note_message("busy");
        }
        assert_eq!(pipeline.pending_len(), 1);
        // Re-triggering the same topic keeps a single pending slot.
        for _ in 0..5 {
            pipeline.note_message("busy");
        }
        assert_eq!(pipeline.pending_len(), 1);

        for topic in 0..20 {
            for _ in 0..5 {
                pipeline.note_message(&format!("topic-{topic}"));
            }
        }
        assert!(pipeline.pending_len() <= pipeline.config.queue_cap);
        Ok(())
    }

    #[tokio::test]
    async fn empty_extracted_term_is_a_validation_error() -> Result<()> {
        use async_trait::async_trait;
        use lore_llm::{AnalysisRequest, AnalysisResult, Analyzer, AnalyzerError, ExtractedKeyword};

        struct BrokenAnalyzer;

        #[async_trait]
        impl Analyzer for BrokenAnalyzer {
            async fn analyze(
                &self,
                _request: &AnalysisRequest,
                _cancel: &CancellationToken,
            ) -> Result<AnalysisResult, AnalyzerError> {
                Ok(AnalysisResult {
                    keywords: vec![ExtractedKeyword {
                        term: "  !! ".into(),
                        confidence: 1.0,
                    }],
                    subjects: Vec::new(),
                    summary_delta: String::new(),
                })
            }
        }

        let dir = TempDir::new()?;
        let db = StoreDb::open(dir.path().join("store.redb"))?;
        let registry = Arc::new(RecipeRegistry::with_builtins());
        let store = VersionedStore::new(ObjectStore::new(db, registry));
        let channels = ChannelLog::new(store.clone());
        let pipeline = AnalysisPipeline::new(
            store,
            channels,
            Arc::new(BrokenAnalyzer),
            AnalysisConfig::default(),
        );
        post(&pipeline, "t1", "pizza", 10)?;

        let cancel = CancellationToken::new();
        let result = pipeline.analyze("t1", false, &cancel).await;
        assert!(matches!(
            result,
            Err(crate::AnalysisError::Object(
                lore_object::ObjectError::Validation { .. }
            ))
        ));

        // The cursor did not advance: a healthy analyzer over the same
        // store still sees the message.
        let recovered = AnalysisPipeline::new(
            pipeline.store().clone(),
            ChannelLog::new(pipeline.store().clone()),
            Arc::new(LexicalAnalyzer),
            AnalysisConfig::default(),
        );
        let rerun = recovered.analyze("t1", false, &cancel).await?;
        assert_eq!(rerun.analyzed_messages, 1);
        Ok(())
    }

    #[tokio::test]
    async fn merge_combines_subjects_within_a_topic() -> Result<()> {
        let (_dir, pipeline) = pipeline()?;
        post(&pipeline, "t1", "pizza dough", 10)?;
        post(&pipeline, "t1", "pizza oven", 20)?;
        let cancel = CancellationToken::new();
        pipeline.analyze("t1", false, &cancel).await?;

        let subjects = pipeline.get_subjects("t1")?;
        assert_eq!(subjects.len(), 2);
        let (merged_id, merged) =
            pipeline.merge_subjects("t1", &subjects[0].0, &subjects[1].0, None)?;
        assert_eq!(merged.keywords, BTreeSet::from([
            "dough".to_string(),
            "oven".to_string(),
            "pizza".to_string(),
        ]));

        let remaining = pipeline.get_subjects("t1")?;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, merged_id);
        Ok(())
    }
}
