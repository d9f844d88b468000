//! Topic analysis: keyword, subject, and summary derivation from message
//! streams, driven by an external [`lore_llm::Analyzer`].
//!
//! All derived artifacts are ordinary versioned objects; reverse lookups
//! (keyword→subjects, topic→summaries) are rebuildable indices, never
//! stored cycles.

mod error;
pub mod keywords;
mod pipeline;
pub mod subjects;
pub mod summary;

pub use error::AnalysisError;
pub use pipeline::{
    AnalysisConfig, AnalysisPipeline, AnalysisSummary, MergeSuggestion,
};
pub use subjects::jaccard;
