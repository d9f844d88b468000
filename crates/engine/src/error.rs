use thiserror::Error;

use lore_access::AccessError;
use lore_analysis::AnalysisError;
use lore_config::ConfigError;
use lore_object::ObjectError;
use lore_proposal::ProposalError;
use lore_store::StoreError;

/// The engine-level error taxonomy. Subsystem errors map onto these
/// variants losslessly; the host decides user visibility.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed for field `{field}`: {reason}")]
    Validation { field: String, reason: String },

    #[error("unknown recipe: {0}")]
    UnknownRecipe(String),

    #[error("invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("stale write: {0}")]
    StaleWrite(String),

    #[error("analysis failed: {cause}")]
    AnalysisFailed { cause: String },

    #[error("topic `{topic_id}` has no subjects")]
    NoSubjects { topic_id: String },

    #[error("computation error: {0}")]
    Computation(String),

    #[error("cannot merge subjects across topics `{left}` and `{right}`")]
    CrossTopicMerge { left: String, right: String },

    #[error("unresolved reference {0}")]
    UnresolvedReference(String),

    #[error("secret unavailable")]
    SecretUnavailable,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,
}

impl From<ObjectError> for EngineError {
    fn from(error: ObjectError) -> Self {
        match error {
            ObjectError::UnknownRecipe(name) => EngineError::UnknownRecipe(name),
            ObjectError::Validation { field, reason } => EngineError::Validation { field, reason },
            ObjectError::InvalidEncoding(detail) => EngineError::InvalidEncoding(detail),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::StaleWrite { id } => EngineError::StaleWrite(id.to_string()),
            StoreError::Corrupt { hash } => {
                EngineError::InvalidEncoding(format!("corrupt object {hash} quarantined"))
            }
            StoreError::Object(inner) => inner.into(),
            StoreError::Backend(detail) => EngineError::Computation(detail),
        }
    }
}

impl From<AnalysisError> for EngineError {
    fn from(error: AnalysisError) -> Self {
        match error {
            AnalysisError::Failed { cause } => EngineError::AnalysisFailed { cause },
            AnalysisError::NoSubjects { topic_id } => EngineError::NoSubjects { topic_id },
            AnalysisError::CrossTopicMerge { left, right } => {
                EngineError::CrossTopicMerge { left, right }
            }
            AnalysisError::Timeout { .. } => EngineError::Timeout,
            AnalysisError::Cancelled => EngineError::Cancelled,
            AnalysisError::Store(inner) => inner.into(),
            AnalysisError::Object(inner) => inner.into(),
        }
    }
}

impl From<ProposalError> for EngineError {
    fn from(error: ProposalError) -> Self {
        match error {
            ProposalError::NoSubjects { topic_id } => EngineError::NoSubjects { topic_id },
            ProposalError::UnknownProposal(id) => {
                EngineError::NotFound(format!("proposal {id}"))
            }
            ProposalError::Store(inner) => inner.into(),
            ProposalError::Object(inner) => inner.into(),
        }
    }
}

impl From<AccessError> for EngineError {
    fn from(error: AccessError) -> Self {
        match error {
            AccessError::UnresolvedReference { hash } => {
                EngineError::UnresolvedReference(hash.to_string())
            }
            AccessError::Store(inner) => inner.into(),
            AccessError::Object(inner) => inner.into(),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::SecretUnavailable => EngineError::SecretUnavailable,
            ConfigError::Store(inner) => inner.into(),
            ConfigError::Object(inner) => inner.into(),
            ConfigError::Io(inner) => EngineError::Computation(inner.to_string()),
            ConfigError::Parse(inner) => EngineError::Computation(inner.to_string()),
            ConfigError::Render(inner) => EngineError::Computation(inner.to_string()),
        }
    }
}
