//! External collaborators the core codes against: the Embedder (text →
//! vector) and the LLM client used by the distiller's synthesis step. Both
//! are HTTP services outside the process boundary — this crate owns the
//! transport and retry policy; the core never talks to either directly.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for calls that cross the process boundary. Mirrors the
/// core's own `Invalid | NotFound | Transient | Conflict | Fatal` shape so
/// callers can fold this into the same retry policy without translating
/// error kinds twice.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl LlmError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

// ── Embedder ─────────────────────────────────────────────────────────────────

/// `Embed(texts) → [][]float32`, dimension-agreeing across calls. Errors are
/// classified transient vs permanent by the implementation so only transient
/// ones get retried by `embed_with_retry`.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Fixed dimension this embedder produces, when known ahead of a call.
    fn dimension(&self) -> Option<usize> {
        None
    }
}

/// Retry an embed call with bounded exponential backoff. Only `Transient`
/// errors are retried; `Invalid`/`Fatal` propagate immediately.
pub async fn embed_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
    max_attempts: u32,
) -> Result<Vec<Vec<f32>>> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match embedder.embed(texts).await {
            Ok(vectors) => return Ok(vectors),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt.saturating_sub(1)));
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// HTTP embedder calling a JSON endpoint: `POST {base_url}` with
/// `{"input": [...]}`, expecting `{"embeddings": [[...], ...]}` back.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
}

impl HttpEmbedder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(&self.base_url)
            .json(&EmbedRequest { input: texts })
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if response.status().is_server_error() || response.status().as_u16() == 429 {
            return Err(LlmError::Transient(format!(
                "embedder returned {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(LlmError::Invalid(format!(
                "embedder returned {}",
                response.status()
            )));
        }

        let body: EmbedResponse = response.json().await.map_err(classify_reqwest_error)?;
        Ok(body.embeddings)
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> LlmError {
    if err.is_timeout() || err.is_connect() {
        LlmError::Transient(err.to_string())
    } else {
        LlmError::Fatal(err.to_string())
    }
}

// ── LLM synthesis client ─────────────────────────────────────────────────────

/// Structured output the distiller expects back from a `Synthesize` call.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SynthesisOutput {
    pub title: String,
    pub description: String,
    pub content: String,
    pub attribution: String,
}

/// `Synthesize(prompt, inputs) → {title, description, content, attribution}`
/// with a structured-output contract. Malformed output is the caller's
/// problem to handle (the distiller fails only that cluster).
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, prompt: &str, inputs: &[String]) -> Result<SynthesisOutput>;
}

/// HTTP-backed synthesizer: posts a chat-completion-style request and parses
/// the structured JSON block out of the free-form reply.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpSynthesizer {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, prompt: &str, inputs: &[String]) -> Result<SynthesisOutput> {
        let joined_inputs = inputs
            .iter()
            .enumerate()
            .map(|(i, text)| format!("{}. {text}", i + 1))
            .collect::<Vec<_>>()
            .join("\n");
        let user_content = format!(
            "{prompt}\n\nSources:\n{joined_inputs}\n\nRespond with a fenced ```json block \
             containing exactly the keys \"title\", \"description\", \"content\", \"attribution\"."
        );

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: user_content,
            }],
            stream: false,
        };

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;

        if response.status().is_server_error() || response.status().as_u16() == 429 {
            return Err(LlmError::Transient(format!(
                "llm client returned {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(LlmError::Invalid(format!(
                "llm client returned {}",
                response.status()
            )));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(classify_reqwest_error)?;
        let raw = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        extract_json_output::<SynthesisOutput>(&raw)
            .ok_or_else(|| LlmError::Invalid("malformed synthesis output".to_string()))
    }
}

/// Extract the first valid JSON fenced code block from an LLM response.
///
/// Looks for ` ```json\n...\n` ``` ` delimiters first, then falls back to the
/// first balanced-looking `{...}` span in the raw text. Returns `None` when
/// neither strategy yields parseable JSON.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let Some(start) = trimmed.find('{') {
        if let Some(end) = trimmed.rfind('}') {
            if end > start {
                let candidate = &trimmed[start..=end];
                if let Ok(val) = serde_json::from_str(candidate) {
                    return Some(val);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyEmbedder {
        failures_remaining: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self
                .failures_remaining
                .fetch_update(
                    std::sync::atomic::Ordering::SeqCst,
                    std::sync::atomic::Ordering::SeqCst,
                    |n| if n > 0 { Some(n - 1) } else { None },
                )
                .is_ok()
            {
                return Err(LlmError::Transient("connection reset".to_string()));
            }
            Ok(texts.iter().map(|_| vec![0.1, 0.2]).collect())
        }
    }

    #[tokio::test]
    async fn embed_with_retry_succeeds_after_transient_failures() {
        let embedder = FlakyEmbedder {
            failures_remaining: std::sync::atomic::AtomicU32::new(2),
        };
        let result = embed_with_retry(&embedder, &["hello".to_string()], 5).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn embed_with_retry_gives_up_after_max_attempts() {
        let embedder = FlakyEmbedder {
            failures_remaining: std::sync::atomic::AtomicU32::new(10),
        };
        let result = embed_with_retry(&embedder, &["hello".to_string()], 3).await;
        assert!(result.is_err());
    }

    #[test]
    fn extract_json_output_parses_fenced_block() {
        let raw = "Sure!\n```json\n{\"title\":\"t\",\"description\":\"d\",\"content\":\"c\",\"attribution\":\"a\"}\n```";
        let out = extract_json_output::<SynthesisOutput>(raw).unwrap();
        assert_eq!(out.title, "t");
    }

    #[test]
    fn extract_json_output_falls_back_to_bare_json() {
        let raw = "{\"title\":\"t\",\"description\":\"d\",\"content\":\"c\",\"attribution\":\"a\"}";
        let out = extract_json_output::<SynthesisOutput>(raw).unwrap();
        assert_eq!(out.content, "c");
    }

    #[test]
    fn extract_json_output_returns_none_for_malformed_input() {
        let raw = "I could not synthesize a summary.";
        assert!(extract_json_output::<SynthesisOutput>(raw).is_none());
    }
}
