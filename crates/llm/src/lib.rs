//! External LLM contract for topic analysis.
//!
//! The engine never talks to a model directly; it hands an
//! [`AnalysisRequest`] to an [`Analyzer`] and gets back a structured
//! [`AnalysisResult`]. Two implementations ship here: an HTTP client for
//! OpenAI-compatible chat endpoints and a deterministic lexical fallback
//! used offline and in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod http;
mod lexical;

pub use http::HttpLlm;
pub use lexical::{tokenize, LexicalAnalyzer};

// ── Chat types ────────────────────────────────────────────────────────────

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

// ── Analysis contract ─────────────────────────────────────────────────────

/// One message handed to the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageText {
    pub author: String,
    pub created_at: i64,
    pub text: String,
}

/// A subject the topic already has, for context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectBrief {
    pub name: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub topic_id: String,
    pub messages: Vec<MessageText>,
    pub current_subjects: Vec<SubjectBrief>,
    pub known_keywords: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedKeyword {
    pub term: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedSubject {
    pub name: String,
    pub keywords: Vec<String>,
    pub is_new: bool,
}

/// Structured result of one analysis pass over a message range.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub keywords: Vec<ExtractedKeyword>,
    pub subjects: Vec<ExtractedSubject>,
    /// Free-form summary addition. May be empty, in which case the
    /// pipeline composes summary content from subject state.
    pub summary_delta: String,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("analysis failed: {cause}")]
    Failed { cause: String },

    #[error("analysis cancelled")]
    Cancelled,
}

impl AnalyzerError {
    pub fn failed(cause: impl Into<String>) -> Self {
        Self::Failed {
            cause: cause.into(),
        }
    }
}

/// The single seam between the engine and any model backend.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, AnalyzerError>;
}
