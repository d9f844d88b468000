use lore_llm::AnalyzerError;
use lore_object::ObjectError;
use lore_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// The external analyzer failed; no partial state was committed and
    /// the analysis cursor did not advance.
    #[error("analysis failed: {cause}")]
    Failed { cause: String },

    /// The topic has no current subjects. Callers treat this as an empty
    /// result, not a fault.
    #[error("topic `{topic_id}` has no subjects")]
    NoSubjects { topic_id: String },

    /// Subjects can only merge within one topic.
    #[error("cannot merge subjects across topics `{left}` and `{right}`")]
    CrossTopicMerge { left: String, right: String },

    #[error("analysis timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("analysis cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Object(#[from] ObjectError),
}

impl From<AnalyzerError> for AnalysisError {
    fn from(error: AnalyzerError) -> Self {
        match error {
            AnalyzerError::Failed { cause } => AnalysisError::Failed { cause },
            AnalyzerError::Cancelled => AnalysisError::Cancelled,
        }
    }
}
