//! Object model for the knowledge engine: typed records, declarative
//! recipes, and canonical content hashing.
//!
//! Every durable entity is a recipe-validated [`ObjectData`] record. Its
//! [`ContentHash`] derives from the full canonical encoding; its [`IdHash`]
//! derives only from identity-forming fields, so the logical identity is
//! stable while revisions accumulate.

pub mod encode;
mod entity;
mod error;
mod hash;
mod recipe;
mod value;

pub use encode::{canonical_decode, canonical_encode, content_hash, id_hash};
pub use entity::{
    AccessGrant, AnalysisCursor, ChannelInfo, Entry, GrantMode, Group, Keyword, Message, Person,
    ProposalConfig, Storable, Subject, Summary, SummarySubject, SUMMARY_MAX_CHARS, Topic,
    UserSettings,
};
pub use error::ObjectError;
pub use hash::{ContentHash, HASH_LEN, IdHash, VersionRef};
pub use recipe::{
    FieldRule, ItemType, PREVIOUS_VERSION, Recipe, RecipeRegistry, recipes,
};
pub use value::{ObjectData, Value, text, text_set};
