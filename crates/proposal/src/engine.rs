//! Cross-conversation recommendation engine.
//!
//! Matches the active topic's subjects against every other topic's
//! subjects with Jaccard similarity plus a recency bonus, ranks, and
//! caches. Share and dismiss act on session memory only — nothing here
//! persists, and a restart forgets all dismissals.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use lore_analysis::jaccard;
use lore_analysis::subjects::active_subjects;
use lore_object::{ContentHash, IdHash, Subject};
use lore_store::{now_ms, VersionedStore};

use crate::cache::{CacheKey, CacheStats, ProposalCache};
use crate::config::{load_config, update_config, PartialProposalConfig};
use crate::error::ProposalError;

const DAY_MS: i64 = 24 * 3600 * 1000;
const SHARE_EVENT_BUFFER: usize = 32;

/// One ranked match between a current subject and a past one.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    /// Session-scoped identifier used by share/dismiss.
    pub id: Uuid,
    pub current_subject: IdHash,
    pub past_subject: IdHash,
    pub past_subject_name: String,
    pub source_topic_id: String,
    pub matched_keywords: BTreeSet<String>,
    pub relevance_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProposalBatch {
    pub proposals: Vec<Proposal>,
    pub cached: bool,
    pub compute_time_ms: u64,
}

/// Emitted when the user shares a proposal into the conversation; the
/// chat subsystem consumes these.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareEvent {
    pub topic_id: String,
    pub subject_name: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShareOutcome {
    pub subject_name: String,
    pub keywords: Vec<String>,
}

struct ActiveProposal {
    topic_id: String,
    proposal: Proposal,
}

pub struct ProposalEngine {
    store: VersionedStore,
    user_email: String,
    cache: Mutex<ProposalCache>,
    /// Session-only dismissals, keyed (topicId, past subject id).
    dismissed: Mutex<HashSet<(String, IdHash)>>,
    /// Live proposals addressable by id for share/dismiss.
    active: Mutex<HashMap<Uuid, ActiveProposal>>,
    share_tx: mpsc::Sender<ShareEvent>,
    share_rx: Mutex<Option<mpsc::Receiver<ShareEvent>>>,
}

impl ProposalEngine {
    pub fn new(store: VersionedStore, user_email: impl Into<String>) -> Self {
        let (share_tx, share_rx) = mpsc::channel(SHARE_EVENT_BUFFER);
        Self {
            store,
            user_email: user_email.into(),
            cache: Mutex::new(ProposalCache::default()),
            dismissed: Mutex::new(HashSet::new()),
            active: Mutex::new(HashMap::new()),
            share_tx,
            share_rx: Mutex::new(Some(share_rx)),
        }
    }

    /// The share event stream. Takeable once, by the host's chat wiring.
    pub fn take_share_events(&self) -> Option<mpsc::Receiver<ShareEvent>> {
        self.share_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Ranked proposals for a topic, with the current subject set queried
    /// from the analysis layer.
    pub fn proposals_for_topic(
        &self,
        topic_id: &str,
        force_refresh: bool,
    ) -> Result<ProposalBatch, ProposalError> {
        let current = active_subjects(&self.store, topic_id)?;
        self.compute(topic_id, current, force_refresh)
    }

    /// Same matching, but against an explicit current subject set instead
    /// of the queried one.
    pub fn proposals_for_subjects(
        &self,
        topic_id: &str,
        subject_ids: &[IdHash],
        force_refresh: bool,
    ) -> Result<ProposalBatch, ProposalError> {
        let mut current = Vec::with_capacity(subject_ids.len());
        for id in subject_ids {
            current.push((*id, self.store.get_current_typed::<Subject>(id)?));
        }
        self.compute(topic_id, current, force_refresh)
    }

    fn compute(
        &self,
        topic_id: &str,
        current: Vec<(IdHash, Subject)>,
        force_refresh: bool,
    ) -> Result<ProposalBatch, ProposalError> {
        if current.is_empty() {
            return Err(ProposalError::NoSubjects {
                topic_id: topic_id.to_string(),
            });
        }
        let current_ids: Vec<IdHash> = current.iter().map(|(id, _)| *id).collect();
        let key = CacheKey::new(topic_id, &current_ids);

        if !force_refresh {
            let cached = {
                let mut cache = self
                    .cache
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                cache.get(&key)
            };
            if let Some(proposals) = cached {
                debug!(topic_id, count = proposals.len(), "proposal cache hit");
                return Ok(ProposalBatch {
                    proposals: self.without_dismissed(topic_id, proposals),
                    cached: true,
                    compute_time_ms: 0,
                });
            }
        }

        let started = Instant::now();
        let (config, _) = load_config(&self.store, &self.user_email)?;

        let past: Vec<(IdHash, Subject)> = self
            .store
            .iter_current_typed::<Subject>()?
            .into_iter()
            .filter(|(_, subject)| subject.topic_id != topic_id && !subject.archived)
            .collect();

        let now = now_ms();
        let mut proposals: Vec<Proposal> = Vec::new();
        for (current_id, current_subject) in &current {
            for (past_id, past_subject) in &past {
                let similarity = jaccard(&current_subject.keywords, &past_subject.keywords);
                if similarity < config.min_jaccard {
                    continue;
                }
                let age_days = ((now - past_subject.timestamp).max(0)) as f64 / DAY_MS as f64;
                let recency = (1.0 - age_days / config.recency_window_days as f64).max(0.0);
                let score = config.match_weight * similarity + config.recency_weight * recency;
                proposals.push(Proposal {
                    id: Uuid::new_v4(),
                    current_subject: *current_id,
                    past_subject: *past_id,
                    past_subject_name: past_subject.name.clone(),
                    source_topic_id: past_subject.topic_id.clone(),
                    matched_keywords: current_subject
                        .keywords
                        .intersection(&past_subject.keywords)
                        .cloned()
                        .collect(),
                    relevance_score: score,
                });
            }
        }

        proposals.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.past_subject.cmp(&b.past_subject))
        });
        proposals.truncate(config.max_proposals.max(0) as usize);

        {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for proposal in &proposals {
                active.insert(
                    proposal.id,
                    ActiveProposal {
                        topic_id: topic_id.to_string(),
                        proposal: proposal.clone(),
                    },
                );
            }
        }
        {
            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            cache.insert(key, proposals.clone());
        }

        let batch = ProposalBatch {
            proposals: self.without_dismissed(topic_id, proposals),
            cached: false,
            compute_time_ms: started.elapsed().as_millis() as u64,
        };
        debug!(
            topic_id,
            count = batch.proposals.len(),
            elapsed_ms = batch.compute_time_ms,
            "proposals computed"
        );
        Ok(batch)
    }

    /// Share a proposal: dismisses it for the session and emits a
    /// [`ShareEvent`] for the chat subsystem.
    pub fn share_proposal(&self, proposal_id: &Uuid) -> Result<ShareOutcome, ProposalError> {
        let (topic_id, proposal) = {
            let active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let live = active
                .get(proposal_id)
                .ok_or(ProposalError::UnknownProposal(*proposal_id))?;
            (live.topic_id.clone(), live.proposal.clone())
        };

        self.dismiss_pair(&topic_id, proposal.past_subject);
        let keywords: Vec<String> = proposal.matched_keywords.iter().cloned().collect();
        // Best effort: a full buffer only means the host is not draining
        // share events; the share itself still succeeded.
        let _ = self.share_tx.try_send(ShareEvent {
            topic_id,
            subject_name: proposal.past_subject_name.clone(),
            keywords: keywords.clone(),
        });
        info!(proposal = %proposal_id, "proposal shared");
        Ok(ShareOutcome {
            subject_name: proposal.past_subject_name,
            keywords,
        })
    }

    /// Dismiss a proposal for this session. Returns how many proposals
    /// remain live for the topic.
    pub fn dismiss_proposal(
        &self,
        proposal_id: &Uuid,
        topic_id: &str,
        past_subject: IdHash,
    ) -> Result<usize, ProposalError> {
        {
            let mut active = self
                .active
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            active.remove(proposal_id);
        }
        self.dismiss_pair(topic_id, past_subject);

        let dismissed = self
            .dismissed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let remaining = active
            .values()
            .filter(|live| live.topic_id == topic_id)
            .filter(|live| {
                !dismissed.contains(&(topic_id.to_string(), live.proposal.past_subject))
            })
            .count();
        Ok(remaining)
    }

    pub fn get_config(&self) -> Result<(lore_object::ProposalConfig, bool), ProposalError> {
        Ok(load_config(&self.store, &self.user_email)?)
    }

    /// Apply a sparse config update. The whole proposal cache is dropped:
    /// every cached ranking was computed under the old parameters.
    pub fn update_config(
        &self,
        partial: &PartialProposalConfig,
    ) -> Result<(lore_object::ProposalConfig, ContentHash), ProposalError> {
        let updated = update_config(&self.store, &self.user_email, partial)?;
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache.clear();
        info!(user = %self.user_email, "proposal config updated, cache invalidated");
        Ok(updated)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .stats()
    }

    fn dismiss_pair(&self, topic_id: &str, past_subject: IdHash) {
        let mut dismissed = self
            .dismissed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        dismissed.insert((topic_id.to_string(), past_subject));
    }

    fn without_dismissed(&self, topic_id: &str, proposals: Vec<Proposal>) -> Vec<Proposal> {
        let dismissed = self
            .dismissed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        proposals
            .into_iter()
            .filter(|proposal| {
                !dismissed.contains(&(topic_id.to_string(), proposal.past_subject))
            })
            .collect()
    }
}
