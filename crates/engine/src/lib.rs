//! Library façade over the conversational knowledge engine.
//!
//! Hosts construct an [`Engine`] from an [`lore_config::EngineConfig`] and
//! consume the grouped APIs: storage, channels, topic analysis, proposals,
//! access, secret config, and maintenance. Everything returns a typed
//! result or an [`EngineError`] from the fixed taxonomy; the engine never
//! swallows errors and never retries silently beyond the store's bounded
//! CAS policy.

mod engine;
mod error;
mod maintenance;
mod telemetry;

pub use engine::{Engine, EngineStats, PutOutcome, SummaryView};
pub use error::EngineError;
pub use maintenance::MaintenanceReport;
pub use telemetry::init_tracing;

// Re-exports so hosts depend on this crate alone for the common types.
pub use lore_access::GrantRequest;
pub use lore_analysis::{AnalysisSummary, MergeSuggestion};
pub use lore_config::{EngineConfig, SecretSealer, SettingsView};
pub use lore_llm::{AnalysisResult, Analyzer, ChatMessage, ChatRole, HttpLlm, LexicalAnalyzer};
pub use lore_object::{
    ContentHash, GrantMode, IdHash, Keyword, Message, ObjectData, Person, ProposalConfig,
    Subject, Summary, Topic, Value, VersionRef,
};
pub use lore_proposal::{PartialProposalConfig, Proposal, ProposalBatch, ShareEvent, ShareOutcome};
