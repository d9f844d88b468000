//! Proposal engine: Jaccard-plus-recency matching of the active topic's
//! subjects against every past conversation, with a TTL-bounded LRU cache
//! and per-user weighting configuration.

mod cache;
mod config;
mod engine;
mod error;

pub use cache::{CacheKey, CacheStats, ProposalCache, CACHE_CAPACITY, CACHE_TTL};
pub use config::{config_id, load_config, update_config, PartialProposalConfig};
pub use engine::{
    Proposal, ProposalBatch, ProposalEngine, ShareEvent, ShareOutcome,
};
pub use error::ProposalError;
