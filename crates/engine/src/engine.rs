use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use lore_access::{AccessControl, GrantRequest};
use lore_analysis::{AnalysisConfig, AnalysisPipeline, AnalysisSummary};
use lore_config::{EngineConfig, SecretSealer, SecretStore, SettingsView};
use lore_llm::{Analyzer, HttpLlm, LexicalAnalyzer};
use lore_object::{
    ContentHash, GrantMode, IdHash, Keyword, Message, ObjectData, ProposalConfig,
    RecipeRegistry, Storable, Subject, Summary,
};
use lore_proposal::{
    CacheStats, PartialProposalConfig, ProposalBatch, ProposalEngine, ShareEvent, ShareOutcome,
};
use lore_store::{
    now_ms, ChannelLog, EntryIter, ObjectStore, StoreDb, StoreStats, TopicIter, VersionedStore,
};

use crate::error::EngineError;
use crate::maintenance::{self, MaintenanceReport};

/// Outcome of a versioned write, as exposed on the library surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PutOutcome {
    pub id_hash: IdHash,
    pub version_hash: ContentHash,
    pub unchanged: bool,
}

#[derive(Debug, Clone)]
pub struct SummaryView {
    pub current: Option<Summary>,
    pub history: Option<Vec<Summary>>,
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub store: StoreStats,
    pub proposal_cache: CacheStats,
}

/// The assembled knowledge engine: one data plane (recipe-validated,
/// content-addressed, versioned objects) with the analysis pipeline and
/// proposal engine layered on top. Hosts wire UI and transport around it.
pub struct Engine {
    config: EngineConfig,
    store: VersionedStore,
    channels: ChannelLog,
    analysis: Arc<AnalysisPipeline>,
    proposals: ProposalEngine,
    access: AccessControl,
    secrets: SecretStore,
    cancel: CancellationToken,
}

impl Engine {
    /// Open with the analyzer implied by configuration: HTTP when an
    /// endpoint is configured, the offline lexical analyzer otherwise.
    pub fn open(config: EngineConfig) -> Result<Self, EngineError> {
        let analyzer: Arc<dyn Analyzer> = if config.offline() {
            Arc::new(LexicalAnalyzer)
        } else {
            Arc::new(HttpLlm::new(
                config.llm.endpoint.clone(),
                config.llm.model.clone(),
                None,
            ))
        };
        Self::open_with(config, analyzer, None)
    }

    /// Open with explicit analyzer and secret-sealing implementations.
    pub fn open_with(
        config: EngineConfig,
        analyzer: Arc<dyn Analyzer>,
        sealer: Option<Arc<dyn SecretSealer>>,
    ) -> Result<Self, EngineError> {
        let registry = Arc::new(RecipeRegistry::with_builtins());
        let db = StoreDb::open(config.db_path())?;
        let store = VersionedStore::new(ObjectStore::new(db, registry.clone()));

        // Recipes persist as ordinary versioned objects, bootstrapped from
        // the built-in seed set. Reopening is a no-op: identical content
        // leaves every chain unchanged.
        for recipe in registry.all() {
            store.put_versioned(&recipe.to_data())?;
        }

        let channels = ChannelLog::new(store.clone());
        let analysis = Arc::new(AnalysisPipeline::new(
            store.clone(),
            channels.clone(),
            analyzer,
            AnalysisConfig {
                trigger_every: config.analysis.trigger_every,
                llm_timeout: Duration::from_secs(config.llm.request_timeout_secs),
                queue_cap: config.analysis.queue_cap,
            },
        ));
        let proposals = ProposalEngine::new(store.clone(), config.user_email.clone());
        let access = AccessControl::new(store.clone());
        let secrets = SecretStore::new(store.clone(), sealer);

        info!(
            user = %config.user_email,
            db = %config.db_path().display(),
            offline = config.offline(),
            "engine opened"
        );
        Ok(Self {
            config,
            store,
            channels,
            analysis,
            proposals,
            access,
            secrets,
            cancel: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Cancel background work; in-flight analysis stops without advancing
    /// its cursor.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    // ── Storage ──────────────────────────────────────────────────────────

    /// Validate and write a new version of a logical object. The declared
    /// recipe must match the record's kind.
    pub fn put_versioned(
        &self,
        recipe_name: &str,
        object: &ObjectData,
    ) -> Result<PutOutcome, EngineError> {
        if object.kind() != recipe_name {
            return Err(EngineError::Validation {
                field: "kind".into(),
                reason: format!(
                    "object kind `{}` does not match recipe `{recipe_name}`",
                    object.kind()
                ),
            });
        }
        let put = self.store.put_versioned(object)?;
        Ok(PutOutcome {
            id_hash: put.id,
            version_hash: put.version,
            unchanged: put.unchanged,
        })
    }

    pub fn get_by_id(&self, id: &IdHash) -> Result<ObjectData, EngineError> {
        Ok(self.store.get_current(id)?)
    }

    pub fn get_by_content(&self, hash: &ContentHash) -> Result<ObjectData, EngineError> {
        Ok(self.store.objects().get(hash)?)
    }

    pub fn history(&self, id: &IdHash) -> Result<Vec<ObjectData>, EngineError> {
        Ok(self.store.history(id)?)
    }

    pub fn iter_by_type(
        &self,
        type_name: &str,
    ) -> Result<impl Iterator<Item = Result<ObjectData, EngineError>> + '_, EngineError> {
        Ok(self
            .store
            .objects()
            .iter_by_type(type_name)?
            .map(|result| result.map_err(EngineError::from)))
    }

    // ── Channels ─────────────────────────────────────────────────────────
    //
    // The write path is the host's hot async surface; every redb
    // transaction (and the store's retry backoff) runs on the blocking
    // pool so the append suspends its task instead of stalling a worker.

    /// Append a stored object to a channel, stamped with the wall clock.
    pub async fn append_to_channel(
        &self,
        topic_id: &str,
        owner: Option<&str>,
        data_hash: ContentHash,
    ) -> Result<ContentHash, EngineError> {
        self.append_to_channel_at(topic_id, owner, data_hash, now_ms())
            .await
    }

    /// Append with an explicit creation time.
    pub async fn append_to_channel_at(
        &self,
        topic_id: &str,
        owner: Option<&str>,
        data_hash: ContentHash,
        creation_time: i64,
    ) -> Result<ContentHash, EngineError> {
        let channels = self.channels.clone();
        let topic = topic_id.to_string();
        let owner_owned = owner.map(str::to_owned);
        let entry = tokio::task::spawn_blocking(move || {
            channels.append(&topic, owner_owned.as_deref(), data_hash, creation_time)
        })
        .await
        .map_err(blocking_failed)??;
        if self.analysis.note_message(topic_id) {
            self.spawn_pending_analysis();
        }
        Ok(entry)
    }

    /// Store a message and append it in one step.
    pub async fn post_message(
        &self,
        topic_id: &str,
        owner: Option<&str>,
        author: &str,
        body: &str,
        at: Option<i64>,
    ) -> Result<(ContentHash, ContentHash), EngineError> {
        let at = at.unwrap_or_else(now_ms);
        let message = Message::new(owner.map(str::to_owned), at, author, body);
        let objects = self.store.objects().clone();
        let data = message.to_data();
        let data_hash = tokio::task::spawn_blocking(move || objects.put(&data))
            .await
            .map_err(blocking_failed)??;
        let entry_hash = self
            .append_to_channel_at(topic_id, owner, data_hash, at)
            .await?;
        Ok((data_hash, entry_hash))
    }

    pub fn iter_channel(
        &self,
        topic_id: &str,
        owner: Option<&str>,
    ) -> Result<EntryIter, EngineError> {
        Ok(self.channels.iter(topic_id, owner)?)
    }

    /// Aggregated, time-descending view over all channels of a topic.
    pub fn iter_topic(&self, topic_id: &str) -> Result<TopicIter, EngineError> {
        Ok(self.channels.iter_topic(topic_id)?)
    }

    fn spawn_pending_analysis(&self) {
        // Background analysis is best-effort; failures are logged by the
        // drain itself.
        let pipeline = self.analysis.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let completed = pipeline.run_pending(&cancel).await;
            debug!(completed, "background analysis drained");
        });
    }

    // ── Topic analysis ───────────────────────────────────────────────────

    pub async fn analyze(
        &self,
        topic_id: &str,
        force: bool,
    ) -> Result<AnalysisSummary, EngineError> {
        let cancel = self.cancel.child_token();
        Ok(self.analysis.analyze(topic_id, force, &cancel).await?)
    }

    pub fn get_subjects(&self, topic_id: &str) -> Result<Vec<(IdHash, Subject)>, EngineError> {
        Ok(self.analysis.get_subjects(topic_id)?)
    }

    pub fn get_keywords(&self, topic_id: &str) -> Result<Vec<Keyword>, EngineError> {
        Ok(self.analysis.get_keywords(topic_id)?)
    }

    pub fn get_summary(
        &self,
        topic_id: &str,
        include_history: bool,
    ) -> Result<SummaryView, EngineError> {
        let (current, history) = self.analysis.get_summary(topic_id, include_history)?;
        Ok(SummaryView { current, history })
    }

    pub fn update_summary(
        &self,
        topic_id: &str,
        content: &str,
        reason: Option<&str>,
    ) -> Result<Summary, EngineError> {
        Ok(self.analysis.update_summary(topic_id, content, reason)?)
    }

    pub fn merge_subjects(
        &self,
        topic_id: &str,
        left: &IdHash,
        right: &IdHash,
        new_keywords: Option<BTreeSet<String>>,
    ) -> Result<(IdHash, Subject), EngineError> {
        Ok(self
            .analysis
            .merge_subjects(topic_id, left, right, new_keywords)?)
    }

    // ── Proposals ────────────────────────────────────────────────────────

    pub fn proposals_for_topic(
        &self,
        topic_id: &str,
        force_refresh: bool,
    ) -> Result<ProposalBatch, EngineError> {
        Ok(self.proposals.proposals_for_topic(topic_id, force_refresh)?)
    }

    pub fn share_proposal(&self, proposal_id: &Uuid) -> Result<ShareOutcome, EngineError> {
        Ok(self.proposals.share_proposal(proposal_id)?)
    }

    pub fn dismiss_proposal(
        &self,
        proposal_id: &Uuid,
        topic_id: &str,
        past_subject: IdHash,
    ) -> Result<usize, EngineError> {
        Ok(self
            .proposals
            .dismiss_proposal(proposal_id, topic_id, past_subject)?)
    }

    pub fn get_proposal_config(&self) -> Result<(ProposalConfig, bool), EngineError> {
        Ok(self.proposals.get_config()?)
    }

    pub fn update_proposal_config(
        &self,
        partial: &PartialProposalConfig,
    ) -> Result<(ProposalConfig, ContentHash), EngineError> {
        Ok(self.proposals.update_config(partial)?)
    }

    pub fn take_share_events(&self) -> Option<tokio::sync::mpsc::Receiver<ShareEvent>> {
        self.proposals.take_share_events()
    }

    // ── Access ───────────────────────────────────────────────────────────

    pub fn grant_access(
        &self,
        object_id: &IdHash,
        request: &GrantRequest,
        mode: GrantMode,
    ) -> Result<(), EngineError> {
        self.access.grant_access(object_id, request, mode)?;
        Ok(())
    }

    pub fn closure(&self, hash: &ContentHash) -> Result<BTreeSet<ContentHash>, EngineError> {
        Ok(self.access.closure(hash)?)
    }

    pub fn is_visible_to(&self, object_id: &IdHash, person: &str) -> Result<bool, EngineError> {
        Ok(self.access.is_visible_to(object_id, person)?)
    }

    // ── Secret config ────────────────────────────────────────────────────

    pub fn user_settings(&self) -> Result<SettingsView, EngineError> {
        Ok(self.secrets.get(&self.config.user_email)?)
    }

    pub fn set_llm_settings(
        &self,
        endpoint: Option<String>,
        model: Option<String>,
    ) -> Result<SettingsView, EngineError> {
        Ok(self
            .secrets
            .set_llm(&self.config.user_email, endpoint, model)?)
    }

    pub fn set_api_token(&self, plaintext: &str) -> Result<SettingsView, EngineError> {
        Ok(self.secrets.set_api_token(&self.config.user_email, plaintext)?)
    }

    pub fn unseal_api_token(&self) -> Result<Option<String>, EngineError> {
        Ok(self.secrets.unseal_api_token(&self.config.user_email)?)
    }

    // ── Maintenance & stats ──────────────────────────────────────────────

    pub fn run_maintenance(&self) -> Result<MaintenanceReport, EngineError> {
        maintenance::run_once(
            &self.store,
            self.config.maintenance.orphan_age_days,
            self.proposals.cache_stats(),
        )
    }

    /// Spawn the periodic maintenance task; stops on [`Engine::shutdown`].
    pub fn start_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let interval = Duration::from_secs(self.config.maintenance.interval_minutes * 60);
        let orphan_age_days = self.config.maintenance.orphan_age_days;
        let cancel = self.cancel.child_token();
        tokio::spawn(maintenance::run_periodic(
            store,
            interval,
            orphan_age_days,
            cancel,
        ))
    }

    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            store: lore_store::store_stats(&self.store)?,
            proposal_cache: self.proposals.cache_stats(),
        })
    }
}

fn blocking_failed(error: tokio::task::JoinError) -> EngineError {
    EngineError::Computation(format!("blocking store task failed: {error}"))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Result;
    use tempfile::TempDir;

    use lore_analysis::subjects::observe_combination;
    use lore_analysis::summary::summary_id;
    use lore_config::EngineConfig;
    use lore_object::{content_hash, Storable, Summary, Topic};
    use lore_proposal::PartialProposalConfig;
    use lore_store::now_ms;

    use super::Engine;
    use crate::error::EngineError;

    const DAY_MS: i64 = 24 * 3600 * 1000;

    fn engine() -> Result<(TempDir, Engine)> {
        let dir = TempDir::new()?;
        let mut config = EngineConfig::default();
        config.user_email = "me@x".into();
        config.storage.data_dir = dir.path().display().to_string();
        let engine = Engine::open(config)?;
        Ok((dir, engine))
    }

    fn frequencies(engine: &Engine, topic: &str) -> Result<Vec<(String, i64)>> {
        let mut pairs: Vec<(String, i64)> = engine
            .get_keywords(topic)?
            .into_iter()
            .map(|keyword| (keyword.term, keyword.frequency))
            .collect();
        pairs.sort();
        Ok(pairs)
    }

    fn set(terms: &[&str]) -> BTreeSet<String> {
        terms.iter().map(|t| t.to_string()).collect()
    }

    // ── Storage laws ─────────────────────────────────────────────────────

    #[test]
    fn get_by_content_returns_what_was_put() -> Result<()> {
        let (_dir, engine) = engine()?;
        let topic = Topic::new("a<->b", 5).to_data();
        let put = engine.put_versioned("Topic", &topic)?;
        // The stored revision gained its previousVersion link treatment but
        // is otherwise the caller's object.
        let loaded = engine.get_by_content(&put.version_hash)?;
        assert_eq!(Topic::from_data(&loaded)?.topic_id, "a<->b");
        assert_eq!(engine.get_by_id(&put.id_hash)?, loaded);
        Ok(())
    }

    #[test]
    fn double_put_is_unchanged_and_history_ends_at_current() -> Result<()> {
        let (_dir, engine) = engine()?;
        let first = engine.put_versioned("Topic", &Topic::new("t", 5).to_data())?;
        let second = engine.put_versioned("Topic", &Topic::new("t", 5).to_data())?;
        assert!(!first.unchanged);
        assert!(second.unchanged);
        assert_eq!(first.version_hash, second.version_hash);

        let mut renamed = Topic::new("t", 5);
        renamed.title = Some("renamed".into());
        let third = engine.put_versioned("Topic", &renamed.to_data())?;
        assert_eq!(third.id_hash, first.id_hash);
        assert_ne!(third.version_hash, first.version_hash);

        let history = engine.history(&first.id_hash)?;
        assert_eq!(history.last(), Some(&engine.get_by_id(&first.id_hash)?));
        Ok(())
    }

    #[test]
    fn kind_mismatch_is_a_validation_error() -> Result<()> {
        let (_dir, engine) = engine()?;
        let result = engine.put_versioned("Person", &Topic::new("t", 5).to_data());
        assert!(matches!(result, Err(EngineError::Validation { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn keyword_extraction_is_idempotent() -> Result<()> {
        let (_dir, engine) = engine()?;
        engine
            .post_message("T1", None, "me@x", "pizza dough yeast", Some(1_000))
            .await?;
        engine
            .post_message("T1", None, "me@x", "dough recipe", Some(2_000))
            .await?;

        engine.analyze("T1", false).await?;
        let expected = vec![
            ("dough".to_string(), 2),
            ("pizza".to_string(), 1),
            ("recipe".to_string(), 1),
            ("yeast".to_string(), 1),
        ];
        assert_eq!(frequencies(&engine, "T1")?, expected);
        let version_before = engine
            .get_summary("T1", false)?
            .current
            .map(|summary| summary.version);

        engine.analyze("T1", false).await?;
        assert_eq!(frequencies(&engine, "T1")?, expected);
        let version_after = engine
            .get_summary("T1", false)?
            .current
            .map(|summary| summary.version);
        assert_eq!(version_before, version_after);
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_keywords_split_into_weighted_subjects() -> Result<()> {
        let (_dir, engine) = engine()?;
        for (body, at) in [
            ("children education", 1_000),
            ("children education", 2_000),
            ("children education", 3_000),
            ("foreigners education", 4_000),
            ("foreigners education", 5_000),
        ] {
            engine.post_message("T2", None, "me@x", body, Some(at)).await?;
        }
        engine.analyze("T2", false).await?;

        let subjects = engine.get_subjects("T2")?;
        assert_eq!(subjects.len(), 2);

        let view = engine.get_summary("T2", false)?;
        let summary = view.current.expect("summary v1");
        assert_eq!(summary.version, 1);
        assert_eq!(summary.subjects.len(), 2);
        let total: f64 = summary.subjects.iter().map(|s| s.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn proposal_scoring_matches_the_weighted_formula() -> Result<()> {
        let (_dir, engine) = engine()?;
        observe_combination(
            engine.store(),
            "A",
            "",
            &set(&["pizza", "dough", "yeast"]),
            1,
            now_ms(),
            false,
        )?;
        observe_combination(
            engine.store(),
            "B",
            "",
            &set(&["pizza", "recipe", "dough"]),
            1,
            now_ms() - 10 * DAY_MS,
            false,
        )?;

        let batch = engine.proposals_for_topic("A", false)?;
        assert_eq!(batch.proposals.len(), 1);
        let proposal = &batch.proposals[0];
        assert_eq!(proposal.matched_keywords, set(&["dough", "pizza"]));
        assert!((proposal.relevance_score - 0.55).abs() < 0.01);
        Ok(())
    }

    #[test]
    fn config_update_invalidates_the_proposal_cache() -> Result<()> {
        let (_dir, engine) = engine()?;
        observe_combination(
            engine.store(),
            "A",
            "",
            &set(&["pizza", "dough", "yeast"]),
            1,
            now_ms(),
            false,
        )?;
        observe_combination(
            engine.store(),
            "B",
            "",
            &set(&["pizza", "recipe", "dough"]),
            1,
            now_ms(),
            false,
        )?;

        let populated = engine.proposals_for_topic("A", false)?;
        assert!(!populated.proposals.is_empty());
        assert!(engine.proposals_for_topic("A", false)?.cached);

        engine.update_proposal_config(&PartialProposalConfig {
            min_jaccard: Some(0.9),
            ..Default::default()
        })?;

        let after = engine.proposals_for_topic("A", false)?;
        assert!(!after.cached);
        assert!(after.proposals.is_empty());
        Ok(())
    }

    #[test]
    fn summary_versions_chain_through_previous_version() -> Result<()> {
        let (_dir, engine) = engine()?;
        engine.update_summary("T", "v1", Some("init"))?;
        engine.update_summary("T", "v2", Some("update"))?;
        engine.update_summary("T", "v3", None)?;

        let view = engine.get_summary("T", true)?;
        let history = view.history.expect("history requested");
        assert_eq!(history.len(), 3);
        let current = view.current.expect("current summary");
        assert_eq!(current.version, 3);

        let id = summary_id(engine.store().objects().registry(), "T")?;
        let v2_data = engine.store().get_version(&id, 2)?;
        let v2_hash = content_hash(engine.store().objects().registry(), &v2_data)?;
        assert_eq!(current.previous_version, Some(v2_hash));
        assert_eq!(Summary::from_data(&v2_data)?.content, "v2");
        Ok(())
    }

    #[tokio::test]
    async fn multi_channel_topics_merge_newest_first() -> Result<()> {
        let (_dir, engine) = engine()?;
        engine
            .post_message("G", Some("p1@x"), "p1@x", "first", Some(1_000))
            .await?;
        engine
            .post_message("G", Some("p2@x"), "p2@x", "second", Some(2_000))
            .await?;

        let times: Vec<i64> = engine
            .iter_topic("G")?
            .map(|result| result.map(|(_, entry)| entry.creation_time))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(times, vec![2_000, 1_000]);

        engine
            .post_message("G", Some("p3@x"), "p3@x", "third", Some(3_000))
            .await?;
        let times: Vec<i64> = engine
            .iter_topic("G")?
            .map(|result| result.map(|(_, entry)| entry.creation_time))
            .collect::<Result<Vec<_>, _>>()?;
        assert_eq!(times, vec![3_000, 2_000, 1_000]);
        Ok(())
    }

    // ── Cross-cutting ────────────────────────────────────────────────────

    #[test]
    fn no_subjects_surfaces_as_its_own_error() -> Result<()> {
        let (_dir, engine) = engine()?;
        assert!(matches!(
            engine.proposals_for_topic("empty", false),
            Err(EngineError::NoSubjects { .. })
        ));
        Ok(())
    }

    #[test]
    fn secret_operations_fail_closed_without_a_sealer() -> Result<()> {
        let (_dir, engine) = engine()?;
        assert!(matches!(
            engine.set_api_token("sk-nope"),
            Err(EngineError::SecretUnavailable)
        ));
        assert!(!engine.user_settings()?.has_api_token);
        Ok(())
    }

    #[tokio::test]
    async fn maintenance_reports_cover_the_whole_store() -> Result<()> {
        let (_dir, engine) = engine()?;
        engine
            .post_message("T1", None, "me@x", "pizza dough yeast", Some(1_000))
            .await?;
        engine
            .post_message("T1", None, "me@x", "dough recipe", Some(2_000))
            .await?;
        engine.analyze("T1", false).await?;

        let report = engine.run_maintenance()?;
        assert!(report.store.total_objects > 0);
        assert!(report.store.per_kind.contains_key("Keyword"));
        assert_eq!(report.summaries_pruned, 0);

        let stats = engine.stats()?;
        assert_eq!(stats.store.total_objects, report.store.total_objects);
        Ok(())
    }

    #[test]
    fn reopening_the_engine_preserves_state() -> Result<()> {
        let dir = TempDir::new()?;
        let mut config = EngineConfig::default();
        config.user_email = "me@x".into();
        config.storage.data_dir = dir.path().display().to_string();

        let put = {
            let engine = Engine::open(config.clone())?;
            engine.put_versioned("Topic", &Topic::new("persisted", 7).to_data())?
        };

        let engine = Engine::open(config)?;
        let loaded = Topic::from_data(&engine.get_by_id(&put.id_hash)?)?;
        assert_eq!(loaded.topic_id, "persisted");
        assert_eq!(loaded.created_at, 7);
        Ok(())
    }
}
