use lore_object::ObjectError;
use lore_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ProposalError {
    /// The requesting topic has no current subjects. Treated as an empty
    /// result by callers, not as a fault.
    #[error("topic `{topic_id}` has no subjects")]
    NoSubjects { topic_id: String },

    /// A session-scoped proposal id that is not (or no longer) live.
    #[error("unknown proposal {0}")]
    UnknownProposal(Uuid),

    /// Underlying store failure surfaced during matching.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Object(#[from] ObjectError),
}
