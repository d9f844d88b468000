//! OpenAI-compatible chat client.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    AnalysisRequest, AnalysisResult, Analyzer, AnalyzerError, ChatMessage, ChatRole,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for any `/chat/completions`-shaped endpoint (Ollama, OpenRouter,
/// and compatible gateways all speak it).
#[derive(Debug, Clone)]
pub struct HttpLlm {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireAnalysis {
    #[serde(default)]
    keywords: Vec<WireKeyword>,
    #[serde(default)]
    subjects: Vec<WireSubject>,
    #[serde(default, rename = "summaryDelta")]
    summary_delta: String,
}

#[derive(Debug, Deserialize)]
struct WireKeyword {
    term: String,
    #[serde(default = "confidence_default")]
    confidence: f64,
}

#[derive(Debug, Deserialize)]
struct WireSubject {
    name: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default, rename = "isNew")]
    is_new: bool,
}

fn confidence_default() -> f64 {
    1.0
}

impl HttpLlm {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_token: Option<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            model: model.into(),
            api_token,
        }
    }

    /// One chat turn; returns the assistant's text.
    pub async fn chat(&self, history: &[ChatMessage]) -> Result<String, AnalyzerError> {
        let body = json!({
            "model": self.model,
            "messages": history
                .iter()
                .map(|message| json!({
                    "role": match message.role {
                        ChatRole::System => "system",
                        ChatRole::User => "user",
                        ChatRole::Assistant => "assistant",
                    },
                    "content": message.content,
                }))
                .collect::<Vec<_>>(),
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .timeout(DEFAULT_TIMEOUT)
            .json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|error| AnalyzerError::failed(format!("request failed: {error}")))?;
        if !response.status().is_success() {
            return Err(AnalyzerError::failed(format!(
                "endpoint returned {}",
                response.status()
            )));
        }
        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|error| AnalyzerError::failed(format!("malformed response: {error}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| AnalyzerError::failed("response carried no content"))
    }

    /// The chat-side contract: a conversational reply plus the structured
    /// analysis of the same history, in one exchange each.
    pub async fn chat_with_analysis(
        &self,
        history: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<(String, AnalysisResult), AnalyzerError> {
        let reply = self.run_cancellable(self.chat(history), cancel).await?;
        let request = AnalysisRequest {
            topic_id: String::new(),
            messages: history
                .iter()
                .filter(|message| message.role == ChatRole::User)
                .map(|message| crate::MessageText {
                    author: "user".into(),
                    created_at: 0,
                    text: message.content.clone(),
                })
                .collect(),
            current_subjects: Vec::new(),
            known_keywords: Vec::new(),
        };
        let analysis = self.analyze(&request, cancel).await?;
        Ok((reply, analysis))
    }

    async fn run_cancellable<T>(
        &self,
        work: impl std::future::Future<Output = Result<T, AnalyzerError>>,
        cancel: &CancellationToken,
    ) -> Result<T, AnalyzerError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AnalyzerError::Cancelled),
            result = work => result,
        }
    }

    fn analysis_prompt(request: &AnalysisRequest) -> Vec<ChatMessage> {
        let transcript = request
            .messages
            .iter()
            .map(|message| format!("{}: {}", message.author, message.text))
            .collect::<Vec<_>>()
            .join("\n");
        let subjects = request
            .current_subjects
            .iter()
            .map(|subject| format!("{} [{}]", subject.name, subject.keywords.join(", ")))
            .collect::<Vec<_>>()
            .join("; ");

        vec![
            ChatMessage::system(
                "You extract conversation analytics. Reply with ONLY a JSON object of the shape \
                 {\"keywords\":[{\"term\":\"...\",\"confidence\":0.0}],\
                 \"subjects\":[{\"name\":\"...\",\"keywords\":[\"...\"],\"isNew\":true}],\
                 \"summaryDelta\":\"...\"}. Terms are lowercase single words. A subject is a \
                 distinct combination of keywords the conversation covers.",
            ),
            ChatMessage::user(format!(
                "Existing subjects: {subjects}\nKnown keywords: {}\n\nMessages:\n{transcript}",
                request.known_keywords.join(", ")
            )),
        ]
    }

    /// Pull the first balanced JSON object out of a model reply; models
    /// routinely wrap JSON in prose or code fences.
    fn extract_json(reply: &str) -> Option<&str> {
        let start = reply.find('{')?;
        let end = reply.rfind('}')?;
        (end > start).then(|| &reply[start..=end])
    }
}

#[async_trait]
impl Analyzer for HttpLlm {
    async fn analyze(
        &self,
        request: &AnalysisRequest,
        cancel: &CancellationToken,
    ) -> Result<AnalysisResult, AnalyzerError> {
        let prompt = Self::analysis_prompt(request);
        let reply = self.run_cancellable(self.chat(&prompt), cancel).await?;
        debug!(topic = %request.topic_id, bytes = reply.len(), "analysis reply received");

        let json_slice = Self::extract_json(&reply)
            .ok_or_else(|| AnalyzerError::failed("reply carried no JSON object"))?;
        let wire: WireAnalysis = serde_json::from_str(json_slice).map_err(|error| {
            warn!(%error, "analysis reply was not valid JSON");
            AnalyzerError::failed(format!("unparseable analysis JSON: {error}"))
        })?;

        Ok(AnalysisResult {
            keywords: wire
                .keywords
                .into_iter()
                .filter(|keyword| !keyword.term.trim().is_empty())
                .map(|keyword| crate::ExtractedKeyword {
                    term: keyword.term.trim().to_lowercase(),
                    confidence: keyword.confidence.clamp(0.0, 1.0),
                })
                .collect(),
            subjects: wire
                .subjects
                .into_iter()
                .map(|subject| crate::ExtractedSubject {
                    name: subject.name,
                    keywords: subject
                        .keywords
                        .into_iter()
                        .map(|keyword| keyword.trim().to_lowercase())
                        .filter(|keyword| !keyword.is_empty())
                        .collect(),
                    is_new: subject.is_new,
                })
                .collect(),
            summary_delta: wire.summary_delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::HttpLlm;

    #[test]
    fn json_extraction_survives_prose_wrapping() {
        let reply = "Sure! Here is the analysis:\n```json\n{\"keywords\":[]}\n``` hope it helps";
        assert_eq!(HttpLlm::extract_json(reply), Some("{\"keywords\":[]}"));
        assert_eq!(HttpLlm::extract_json("no json here"), None);
    }

    #[test]
    fn wire_analysis_tolerates_missing_fields() {
        let wire: super::WireAnalysis =
            serde_json::from_str("{\"keywords\":[{\"term\":\"pizza\"}]}").unwrap();
        assert_eq!(wire.keywords.len(), 1);
        assert!((wire.keywords[0].confidence - 1.0).abs() < f64::EPSILON);
        assert!(wire.subjects.is_empty());
        assert!(wire.summary_delta.is_empty());
    }
}
