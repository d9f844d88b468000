//! Typed views over recipe-validated records.
//!
//! The store traffics in [`ObjectData`]; the engine API traffics in these
//! structs. Conversions are explicit so a decoding mismatch surfaces as a
//! typed error instead of a panic.

use std::collections::BTreeSet;

use crate::error::ObjectError;
use crate::hash::{ContentHash, IdHash};
use crate::recipe::{PREVIOUS_VERSION, recipes};
use crate::value::{ObjectData, Value, text, text_set};

/// A record that knows its recipe and converts to/from the stored form.
pub trait Storable: Sized {
    const RECIPE: &'static str;

    fn to_data(&self) -> ObjectData;
    fn from_data(data: &ObjectData) -> Result<Self, ObjectError>;
}

fn expect_kind(data: &ObjectData, recipe: &str) -> Result<(), ObjectError> {
    if data.kind() == recipe {
        Ok(())
    } else {
        Err(ObjectError::InvalidEncoding(format!(
            "expected `{recipe}`, found `{}`",
            data.kind()
        )))
    }
}

// ── Person / Group ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Person {
    pub email: String,
    pub name: Option<String>,
    pub deactivated: bool,
    pub previous_version: Option<ContentHash>,
}

impl Person {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
            deactivated: false,
            previous_version: None,
        }
    }
}

impl Storable for Person {
    const RECIPE: &'static str = recipes::PERSON;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("email", text(&self.email))
            .with_opt("name", self.name.as_deref().map(text))
            .with("deactivated", Value::Bool(self.deactivated))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            email: data.text("email")?.to_string(),
            name: data.opt_text("name")?.map(str::to_owned),
            deactivated: data.bool("deactivated")?,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub group_id: String,
    pub members: BTreeSet<String>,
    pub previous_version: Option<ContentHash>,
}

impl Storable for Group {
    const RECIPE: &'static str = recipes::GROUP;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("groupId", text(&self.group_id))
            .with("members", text_set(self.members.iter().cloned()))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            group_id: data.text("groupId")?.to_string(),
            members: data.text_set("members")?.into_iter().collect(),
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

// ── Topic / Channel / Entry / Message ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub topic_id: String,
    pub title: Option<String>,
    pub sharing_enabled: bool,
    pub created_at: i64,
    pub previous_version: Option<ContentHash>,
}

impl Topic {
    /// Deterministic id for a 1:1 conversation: the sorted participant pair.
    pub fn one_to_one_id(a: &str, b: &str) -> String {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        format!("{low}<->{high}")
    }

    pub fn new(topic_id: impl Into<String>, created_at: i64) -> Self {
        Self {
            topic_id: topic_id.into(),
            title: None,
            sharing_enabled: false,
            created_at,
            previous_version: None,
        }
    }
}

impl Storable for Topic {
    const RECIPE: &'static str = recipes::TOPIC;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("topicId", text(&self.topic_id))
            .with_opt("title", self.title.as_deref().map(text))
            .with("sharingEnabled", Value::Bool(self.sharing_enabled))
            .with("createdAt", Value::Int(self.created_at))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            topic_id: data.text("topicId")?.to_string(),
            title: data.opt_text("title")?.map(str::to_owned),
            sharing_enabled: data.bool("sharingEnabled")?,
            created_at: data.int("createdAt")?,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

/// Per-writer channel head. `owner = None` is the shared 1:1 channel; a
/// group topic aggregates one channel per participant.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub topic_id: String,
    pub owner: Option<String>,
    pub head: Option<ContentHash>,
    pub entry_count: i64,
    pub previous_version: Option<ContentHash>,
}

impl ChannelInfo {
    pub fn new(topic_id: impl Into<String>, owner: Option<String>) -> Self {
        Self {
            topic_id: topic_id.into(),
            owner,
            head: None,
            entry_count: 0,
            previous_version: None,
        }
    }
}

impl Storable for ChannelInfo {
    const RECIPE: &'static str = recipes::CHANNEL;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("topicId", text(&self.topic_id))
            .with_opt("owner", self.owner.as_deref().map(text))
            .with_opt("head", self.head.map(Value::Reference))
            .with("entryCount", Value::Int(self.entry_count))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            topic_id: data.text("topicId")?.to_string(),
            owner: data.opt_text("owner")?.map(str::to_owned),
            head: data.opt_reference("head")?,
            entry_count: data.int("entryCount")?,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

/// One link in a channel's hash chain. Every field is identity-forming, so
/// an Entry is immutable by construction and never versioned.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub topic_id: String,
    pub owner: Option<String>,
    pub previous_entry: Option<ContentHash>,
    pub data_hash: ContentHash,
    pub creation_time: i64,
}

impl Storable for Entry {
    const RECIPE: &'static str = recipes::ENTRY;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("topicId", text(&self.topic_id))
            .with_opt("owner", self.owner.as_deref().map(text))
            .with_opt("previousEntry", self.previous_entry.map(Value::Reference))
            .with("dataHash", Value::Reference(self.data_hash))
            .with("creationTime", Value::Int(self.creation_time))
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            topic_id: data.text("topicId")?.to_string(),
            owner: data.opt_text("owner")?.map(str::to_owned),
            previous_entry: data.opt_reference("previousEntry")?,
            data_hash: data.reference("dataHash")?,
            creation_time: data.int("creationTime")?,
        })
    }
}

/// Immutable once written; edits create new Messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel_owner: Option<String>,
    pub created_at: i64,
    pub author: String,
    pub text_hash: String,
    pub text: String,
    pub attachments: Vec<ContentHash>,
}

impl Message {
    pub fn new(
        channel_owner: Option<String>,
        created_at: i64,
        author: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let body = body.into();
        Self {
            channel_owner,
            created_at,
            author: author.into(),
            text_hash: ContentHash::of(body.as_bytes()).to_hex(),
            text: body,
            attachments: Vec::new(),
        }
    }
}

impl Storable for Message {
    const RECIPE: &'static str = recipes::MESSAGE;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with_opt("channelOwner", self.channel_owner.as_deref().map(text))
            .with("createdAt", Value::Int(self.created_at))
            .with("author", text(&self.author))
            .with("textHash", text(&self.text_hash))
            .with("text", text(&self.text))
            .with(
                "attachments",
                Value::Array(self.attachments.iter().copied().map(Value::Reference).collect()),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        let attachments = data
            .require("attachments")?
            .as_array()
            .ok_or_else(|| {
                ObjectError::InvalidEncoding("Message: attachments must be array".into())
            })?
            .iter()
            .map(|v| {
                v.as_reference().ok_or_else(|| {
                    ObjectError::InvalidEncoding("Message: attachment must be reference".into())
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            channel_owner: data.opt_text("channelOwner")?.map(str::to_owned),
            created_at: data.int("createdAt")?,
            author: data.text("author")?.to_string(),
            text_hash: data.text("textHash")?.to_string(),
            text: data.text("text")?.to_string(),
            attachments,
        })
    }
}

// ── Analysis entities ─────────────────────────────────────────────────────

/// Global singleton per normalized term; frequency only ever grows.
#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub term: String,
    pub frequency: i64,
    pub score: Option<f64>,
    pub subjects: BTreeSet<IdHash>,
    pub last_seen: i64,
    pub deleted: bool,
    pub previous_version: Option<ContentHash>,
}

impl Keyword {
    pub fn new(term: impl Into<String>, last_seen: i64) -> Self {
        Self {
            term: term.into(),
            frequency: 0,
            score: None,
            subjects: BTreeSet::new(),
            last_seen,
            deleted: false,
            previous_version: None,
        }
    }
}

impl Storable for Keyword {
    const RECIPE: &'static str = recipes::KEYWORD;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("term", text(&self.term))
            .with("frequency", Value::Int(self.frequency))
            .with_opt("score", self.score.map(Value::Number))
            .with(
                "subjects",
                Value::Set(self.subjects.iter().copied().map(Value::IdReference).collect()),
            )
            .with("lastSeen", Value::Int(self.last_seen))
            .with("deleted", Value::Bool(self.deleted))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            term: data.text("term")?.to_string(),
            frequency: data.int("frequency")?,
            score: data.opt_number("score")?,
            subjects: data.id_reference_set("subjects")?.into_iter().collect(),
            last_seen: data.int("lastSeen")?,
            deleted: data.bool("deleted")?,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

/// A distinct keyword combination observed within one topic.
#[derive(Debug, Clone, PartialEq)]
pub struct Subject {
    pub topic_id: String,
    pub keyword_set_hash: String,
    pub name: String,
    pub keywords: BTreeSet<String>,
    pub message_count: i64,
    pub timestamp: i64,
    pub archived: bool,
    pub archived_at: Option<i64>,
    pub previous_version: Option<ContentHash>,
}

impl Subject {
    /// Identity digest of a keyword combination: hash of the sorted,
    /// newline-joined terms. `BTreeSet` iteration supplies the sort.
    pub fn keyword_set_digest(keywords: &BTreeSet<String>) -> String {
        let joined = keywords.iter().cloned().collect::<Vec<_>>().join("\n");
        ContentHash::of(joined.as_bytes()).to_hex()
    }

    pub fn new(topic_id: impl Into<String>, keywords: BTreeSet<String>, timestamp: i64) -> Self {
        let keyword_set_hash = Self::keyword_set_digest(&keywords);
        let name = keywords.iter().cloned().collect::<Vec<_>>().join(" / ");
        Self {
            topic_id: topic_id.into(),
            keyword_set_hash,
            name,
            keywords,
            message_count: 0,
            timestamp,
            archived: false,
            archived_at: None,
            previous_version: None,
        }
    }
}

impl Storable for Subject {
    const RECIPE: &'static str = recipes::SUBJECT;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("topicId", text(&self.topic_id))
            .with("keywordSetHash", text(&self.keyword_set_hash))
            .with("name", text(&self.name))
            .with("keywords", text_set(self.keywords.iter().cloned()))
            .with("messageCount", Value::Int(self.message_count))
            .with("timestamp", Value::Int(self.timestamp))
            .with("archived", Value::Bool(self.archived))
            .with_opt("archivedAt", self.archived_at.map(Value::Int))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            topic_id: data.text("topicId")?.to_string(),
            keyword_set_hash: data.text("keywordSetHash")?.to_string(),
            name: data.text("name")?.to_string(),
            keywords: data.text_set("keywords")?.into_iter().collect(),
            message_count: data.int("messageCount")?,
            timestamp: data.int("timestamp")?,
            archived: data.bool("archived")?,
            archived_at: data.opt_int("archivedAt")?,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

/// Weighted subject reference inside a summary; order-significant.
#[derive(Debug, Clone, PartialEq)]
pub struct SummarySubject {
    pub subject: IdHash,
    pub weight: f64,
}

impl Storable for SummarySubject {
    const RECIPE: &'static str = recipes::SUMMARY_SUBJECT;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("subject", Value::IdReference(self.subject))
            .with("weight", Value::Number(self.weight))
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            subject: data.id_reference("subject")?,
            weight: data.number("weight")?,
        })
    }
}

/// Maximum summary body length; longer content is rejected upstream.
pub const SUMMARY_MAX_CHARS: usize = 3000;

#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub topic_id: String,
    pub version: i64,
    pub content: String,
    pub subjects: Vec<SummarySubject>,
    pub previous_version: Option<ContentHash>,
}

impl Storable for Summary {
    const RECIPE: &'static str = recipes::SUMMARY;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("topicId", text(&self.topic_id))
            .with("version", Value::Int(self.version))
            .with("content", text(&self.content))
            .with(
                "subjects",
                Value::Array(
                    self.subjects
                        .iter()
                        .map(|s| Value::Object(s.to_data()))
                        .collect(),
                ),
            )
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        let subjects = data
            .require("subjects")?
            .as_array()
            .ok_or_else(|| {
                ObjectError::InvalidEncoding("Summary: subjects must be array".into())
            })?
            .iter()
            .map(|v| {
                v.as_object()
                    .ok_or_else(|| {
                        ObjectError::InvalidEncoding(
                            "Summary: subject entry must be nested object".into(),
                        )
                    })
                    .and_then(SummarySubject::from_data)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            topic_id: data.text("topicId")?.to_string(),
            version: data.int("version")?,
            content: data.text("content")?.to_string(),
            subjects,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

/// Progress marker for the analysis pipeline; one per topic.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisCursor {
    pub topic_id: String,
    pub last_analyzed_entry: Option<ContentHash>,
    pub previous_version: Option<ContentHash>,
}

impl Storable for AnalysisCursor {
    const RECIPE: &'static str = recipes::ANALYSIS_CURSOR;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("topicId", text(&self.topic_id))
            .with_opt(
                "lastAnalyzedEntry",
                self.last_analyzed_entry.map(Value::Reference),
            )
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            topic_id: data.text("topicId")?.to_string(),
            last_analyzed_entry: data.opt_reference("lastAnalyzedEntry")?,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

// ── Proposal configuration ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ProposalConfig {
    pub user_email: String,
    pub match_weight: f64,
    pub recency_weight: f64,
    pub recency_window_days: i64,
    pub min_jaccard: f64,
    pub max_proposals: i64,
    pub updated: i64,
    pub previous_version: Option<ContentHash>,
}

impl ProposalConfig {
    pub fn defaults_for(user_email: impl Into<String>) -> Self {
        Self {
            user_email: user_email.into(),
            match_weight: 0.7,
            recency_weight: 0.3,
            recency_window_days: 30,
            min_jaccard: 0.2,
            max_proposals: 10,
            updated: 0,
            previous_version: None,
        }
    }
}

impl Storable for ProposalConfig {
    const RECIPE: &'static str = recipes::PROPOSAL_CONFIG;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("userEmail", text(&self.user_email))
            .with("matchWeight", Value::Number(self.match_weight))
            .with("recencyWeight", Value::Number(self.recency_weight))
            .with("recencyWindowDays", Value::Int(self.recency_window_days))
            .with("minJaccard", Value::Number(self.min_jaccard))
            .with("maxProposals", Value::Int(self.max_proposals))
            .with("updated", Value::Int(self.updated))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            user_email: data.text("userEmail")?.to_string(),
            match_weight: data.number("matchWeight")?,
            recency_weight: data.number("recencyWeight")?,
            recency_window_days: data.int("recencyWindowDays")?,
            min_jaccard: data.number("minJaccard")?,
            max_proposals: data.int("maxProposals")?,
            updated: data.int("updated")?,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

// ── Access grants ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantMode {
    /// Additive: unioned with prior grants for the object.
    Add,
    /// Supersedes every prior grant for the object.
    Replace,
}

impl GrantMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantMode::Add => "ADD",
            GrantMode::Replace => "REPLACE",
        }
    }

    pub fn parse(input: &str) -> Result<Self, ObjectError> {
        match input {
            "ADD" => Ok(GrantMode::Add),
            "REPLACE" => Ok(GrantMode::Replace),
            other => Err(ObjectError::validation(
                "mode",
                format!("unknown grant mode `{other}`"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AccessGrant {
    pub object_id: IdHash,
    pub mode: GrantMode,
    pub persons: BTreeSet<String>,
    pub groups: BTreeSet<String>,
    pub previous_version: Option<ContentHash>,
}

impl AccessGrant {
    pub fn new(object_id: IdHash, mode: GrantMode) -> Self {
        Self {
            object_id,
            mode,
            persons: BTreeSet::new(),
            groups: BTreeSet::new(),
            previous_version: None,
        }
    }
}

impl Storable for AccessGrant {
    const RECIPE: &'static str = recipes::ACCESS_GRANT;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("objectId", Value::IdReference(self.object_id))
            .with("mode", text(self.mode.as_str()))
            .with("persons", text_set(self.persons.iter().cloned()))
            .with("groups", text_set(self.groups.iter().cloned()))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            object_id: data.id_reference("objectId")?,
            mode: GrantMode::parse(data.text("mode")?)?,
            persons: data.text_set("persons")?.into_iter().collect(),
            groups: data.text_set("groups")?.into_iter().collect(),
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

// ── User settings (secret config store) ───────────────────────────────────

/// Per-user settings; the API token is stored sealed, never in plaintext.
#[derive(Debug, Clone, PartialEq)]
pub struct UserSettings {
    pub user_email: String,
    pub llm_endpoint: Option<String>,
    pub llm_model: Option<String>,
    pub api_token_cipher: Option<String>,
    pub updated: i64,
    pub previous_version: Option<ContentHash>,
}

impl UserSettings {
    pub fn new(user_email: impl Into<String>, updated: i64) -> Self {
        Self {
            user_email: user_email.into(),
            llm_endpoint: None,
            llm_model: None,
            api_token_cipher: None,
            updated,
            previous_version: None,
        }
    }
}

impl Storable for UserSettings {
    const RECIPE: &'static str = recipes::USER_SETTINGS;

    fn to_data(&self) -> ObjectData {
        ObjectData::new(Self::RECIPE)
            .with("userEmail", text(&self.user_email))
            .with_opt("llmEndpoint", self.llm_endpoint.as_deref().map(text))
            .with_opt("llmModel", self.llm_model.as_deref().map(text))
            .with_opt(
                "apiTokenCipher",
                self.api_token_cipher.as_deref().map(text),
            )
            .with("updated", Value::Int(self.updated))
            .with_opt(
                PREVIOUS_VERSION,
                self.previous_version.map(Value::Reference),
            )
    }

    fn from_data(data: &ObjectData) -> Result<Self, ObjectError> {
        expect_kind(data, Self::RECIPE)?;
        Ok(Self {
            user_email: data.text("userEmail")?.to_string(),
            llm_endpoint: data.opt_text("llmEndpoint")?.map(str::to_owned),
            llm_model: data.opt_text("llmModel")?.map(str::to_owned),
            api_token_cipher: data.opt_text("apiTokenCipher")?.map(str::to_owned),
            updated: data.int("updated")?,
            previous_version: data.opt_reference(PREVIOUS_VERSION)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use anyhow::Result;

    use super::{
        AccessGrant, ChannelInfo, GrantMode, Keyword, Message, Storable, Subject, Summary,
        SummarySubject, Topic,
    };
    use crate::hash::IdHash;
    use crate::recipe::RecipeRegistry;

    fn keywords(terms: &[&str]) -> BTreeSet<String> {
        terms.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn one_to_one_topic_id_is_order_independent() {
        assert_eq!(
            Topic::one_to_one_id("bob@x", "alice@x"),
            Topic::one_to_one_id("alice@x", "bob@x")
        );
        assert_eq!(Topic::one_to_one_id("a", "b"), "a<->b");
    }

    #[test]
    fn subject_identity_ignores_keyword_insertion_order() {
        let digest_a = Subject::keyword_set_digest(&keywords(&["pizza", "dough", "yeast"]));
        let digest_b = Subject::keyword_set_digest(&keywords(&["yeast", "dough", "pizza"]));
        assert_eq!(digest_a, digest_b);
        assert_ne!(
            digest_a,
            Subject::keyword_set_digest(&keywords(&["pizza", "dough"]))
        );
    }

    #[test]
    fn message_text_hash_tracks_text() {
        let first = Message::new(None, 1, "alice@x", "pizza dough yeast");
        let second = Message::new(None, 1, "alice@x", "dough recipe");
        assert_ne!(first.text_hash, second.text_hash);
        let same = Message::new(None, 1, "alice@x", "pizza dough yeast");
        assert_eq!(first.text_hash, same.text_hash);
    }

    #[test]
    fn entities_round_trip_through_object_data() -> Result<()> {
        let registry = RecipeRegistry::with_builtins();

        let mut subject = Subject::new("t1", keywords(&["pizza", "dough"]), 42);
        subject.message_count = 3;
        let data = subject.to_data();
        registry.validate(&data)?;
        assert_eq!(Subject::from_data(&data)?, subject);

        let summary = Summary {
            topic_id: "t1".into(),
            version: 2,
            content: "an overview".into(),
            subjects: vec![SummarySubject {
                subject: IdHash::from_bytes([7; 32]),
                weight: 1.0,
            }],
            previous_version: None,
        };
        let data = summary.to_data();
        registry.validate(&data)?;
        assert_eq!(Summary::from_data(&data)?, summary);

        let mut grant = AccessGrant::new(IdHash::from_bytes([1; 32]), GrantMode::Add);
        grant.persons.insert("alice@x".into());
        let data = grant.to_data();
        registry.validate(&data)?;
        assert_eq!(AccessGrant::from_data(&data)?, grant);

        let channel = ChannelInfo::new("t1", Some("alice@x".into()));
        let data = channel.to_data();
        registry.validate(&data)?;
        assert_eq!(ChannelInfo::from_data(&data)?, channel);

        let mut keyword = Keyword::new("pizza", 42);
        keyword.frequency = 2;
        keyword.subjects.insert(IdHash::from_bytes([9; 32]));
        let data = keyword.to_data();
        registry.validate(&data)?;
        assert_eq!(Keyword::from_data(&data)?, keyword);
        Ok(())
    }

    #[test]
    fn wrong_kind_is_rejected() {
        let topic = Topic::new("t1", 0).to_data();
        assert!(Subject::from_data(&topic).is_err());
    }

    #[test]
    fn grant_mode_round_trips() -> Result<()> {
        assert_eq!(GrantMode::parse(GrantMode::Add.as_str())?, GrantMode::Add);
        assert_eq!(
            GrantMode::parse(GrantMode::Replace.as_str())?,
            GrantMode::Replace
        );
        assert!(GrantMode::parse("SHOUT").is_err());
        Ok(())
    }
}
