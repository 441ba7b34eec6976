//! OpenRouter integration for transcript enrichment
//!
//! Calls an OpenAI-compatible chat completions API to turn transcripts into
//! structured notes, plus an optional embeddings endpoint for semantic search.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::config::LlmConfig;
use crate::error::{classify_status, PipelineError};

const ENRICH_SYSTEM: &str = "You are a content analyst. You turn video transcripts into \
    structured notes. Always respond with valid JSON and nothing else.";

const ENRICH_INSTRUCTIONS: &str = r#"Summarize the transcript below. Respond with a single JSON object shaped exactly like this:

{
  "summary": "2-4 sentence summary of the whole video",
  "chapters": [
    {"title": "chapter title", "timestamp": "HH:MM:SS"}
  ],
  "key_points": ["one takeaway per entry"]
}

Use 5-10 chapters for long transcripts and fewer for short ones. Give 3-8 key points. Omit a chapter timestamp if the transcript carries no timing information."#;

/// Structured notes for one transcript, as returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentPayload {
    pub summary: String,
    pub chapters: Vec<Chapter>,
    pub key_points: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnrichmentResult {
    pub payload: EnrichmentPayload,
    pub model: String,
    pub tokens_used: Option<i64>,
    pub latency_ms: i64,
}

/// The enrichment pass only sees this trait, so tests substitute a scripted
/// summarizer.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn enrich(&self, transcript: &str) -> Result<EnrichmentResult, PipelineError>;

    /// Ok(None) when no embedding model is configured.
    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, PipelineError>;
}

/// OpenRouter client for chat completions and embeddings
pub struct OpenRouterClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    embedding_model: Option<String>,
    max_prompt_chars: usize,
}

impl OpenRouterClient {
    pub fn new(config: &LlmConfig) -> Result<Self, PipelineError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| PipelineError::Config("llm.api_key is not set".to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| PipelineError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            embedding_model: config.embedding_model.clone(),
            max_prompt_chars: config.max_prompt_chars,
        })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<(String, Option<i64>), PipelineError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            // Lower temperature for more consistent extraction
            temperature: 0.3,
            max_tokens: 2048,
        };

        tracing::debug!(
            "sending chat completion: model={}, prompt_len={}",
            self.model,
            user.len()
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(
                status,
                &format!("chat completions: {}", snippet(&body)),
            ));
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Validation(format!("chat completions response: {}", e)))?;

        let content = result
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| {
                PipelineError::Validation("chat completions returned no choices".to_string())
            })?;

        Ok((content, result.usage.and_then(|u| u.total_tokens)))
    }
}

#[async_trait]
impl Summarizer for OpenRouterClient {
    async fn enrich(&self, transcript: &str) -> Result<EnrichmentResult, PipelineError> {
        let excerpt = truncate_chars(transcript, self.max_prompt_chars);
        let user = format!("{}\n\n---\nTRANSCRIPT:\n{}\n---", ENRICH_INSTRUCTIONS, excerpt);

        let started = Instant::now();
        let (content, tokens_used) = self.chat(ENRICH_SYSTEM, &user).await?;
        let latency_ms = started.elapsed().as_millis() as i64;

        let payload = parse_payload(&content)?;

        Ok(EnrichmentResult {
            payload,
            model: self.model.clone(),
            tokens_used,
            latency_ms,
        })
    }

    async fn embed(&self, text: &str) -> Result<Option<Vec<f32>>, PipelineError> {
        let model = match &self.embedding_model {
            Some(m) => m.clone(),
            None => return Ok(None),
        };

        let url = format!("{}/embeddings", self.base_url);
        let request = EmbeddingRequest {
            model,
            input: truncate_chars(text, self.max_prompt_chars).to_string(),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(
                status,
                &format!("embeddings: {}", snippet(&body)),
            ));
        }

        let result: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Validation(format!("embeddings response: {}", e)))?;

        let embedding = result
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| PipelineError::Validation("embeddings returned no data".to_string()))?;

        Ok(Some(embedding))
    }
}

/// Parse the model's reply into a payload, tolerating markdown fences and
/// chatter around the JSON object.
fn parse_payload(response: &str) -> Result<EnrichmentPayload, PipelineError> {
    let value = extract_json(response).ok_or_else(|| {
        PipelineError::Validation(format!(
            "no JSON object in model response: {}",
            snippet(response)
        ))
    })?;

    let mut payload: EnrichmentPayload = serde_json::from_value(value)
        .map_err(|e| PipelineError::Validation(format!("model response schema: {}", e)))?;

    if payload.summary.trim().is_empty() {
        return Err(PipelineError::Validation(
            "model returned an empty summary".to_string(),
        ));
    }
    for chapter in &mut payload.chapters {
        chapter.timestamp = chapter.timestamp.take().and_then(|t| normalize_timestamp(&t));
    }

    Ok(payload)
}

/// Extract JSON from an LLM response (handles markdown code blocks)
fn extract_json(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    // Try direct parse first
    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(json);
    }

    // Try to extract from markdown code block
    if let Some(start) = trimmed.find("```json") {
        let after_marker = &trimmed[start + 7..];
        if let Some(end) = after_marker.find("```") {
            let json_str = &after_marker[..end].trim();
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str) {
                return Some(json);
            }
        }
    }

    // Try to find a JSON object in the response
    if let Some(start) = trimmed.find('{') {
        let mut depth = 0;
        let mut end = start;
        // char_indices so the offsets stay byte offsets even when the
        // payload carries multi-byte text
        for (i, c) in trimmed[start..].char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = start + i + c.len_utf8();
                        break;
                    }
                }
                _ => {}
            }
        }
        if end > start {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&trimmed[start..end]) {
                return Some(json);
            }
        }
    }

    None
}

/// Accept "H:MM:SS", "MM:SS", or bare seconds; anything else is dropped.
fn normalize_timestamp(raw: &str) -> Option<String> {
    let trimmed = raw.trim();

    let re = regex::Regex::new(r"^(?:(\d{1,2}):)?(\d{1,2}):(\d{2})$").ok()?;
    if let Some(caps) = re.captures(trimmed) {
        let hours: u64 = caps.get(1).map_or(Ok(0), |m| m.as_str().parse()).ok()?;
        let minutes: u64 = caps[2].parse().ok()?;
        let seconds: u64 = caps[3].parse().ok()?;
        if minutes > 59 || seconds > 59 {
            return None;
        }
        return Some(format!("{:02}:{:02}:{:02}", hours, minutes, seconds));
    }

    if let Ok(total) = trimmed.parse::<u64>() {
        return Some(format!(
            "{:02}:{:02}:{:02}",
            total / 3600,
            (total % 3600) / 60,
            total % 60
        ));
    }

    None
}

fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn snippet(text: &str) -> String {
    text.chars().take(200).collect()
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: i32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: Option<i64>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json() {
        // Direct JSON
        let json = extract_json(r#"{"summary": "test"}"#);
        assert!(json.is_some());

        // Markdown code block
        let json = extract_json(
            r#"Here's the result:
```json
{"summary": "fenced"}
```
"#,
        );
        assert!(json.is_some());

        // JSON embedded in text
        let json = extract_json(r#"The notes are: {"summary": "inline"} and that's it."#);
        assert!(json.is_some());
    }

    #[test]
    fn extract_json_keeps_multibyte_content_intact() {
        // Chatter forces the brace-matching path; accented text inside the
        // object must not throw the closing offset off
        let json = extract_json(r#"Here is the JSON: {"summary": "ééé"} hope that helps"#).unwrap();
        assert_eq!(json["summary"], "ééé");

        let json = extract_json(r#"Voila: {"summary": "café"} enjoy!"#).unwrap();
        assert_eq!(json["summary"], "café");
    }

    #[test]
    fn accented_response_with_chatter_parses() {
        let response = r#"Sure! {"summary": "Un résumé détaillé.", "chapters": [], "key_points": ["clé"]} Let me know if that works."#;
        let payload = parse_payload(response).unwrap();
        assert_eq!(payload.summary, "Un résumé détaillé.");
        assert_eq!(payload.key_points, vec!["clé"]);
    }

    #[test]
    fn valid_payload_parses() {
        let response = r#"{"summary": "A video.", "chapters": [{"title": "Intro", "timestamp": "0:00"}], "key_points": ["one"]}"#;
        let payload = parse_payload(response).unwrap();
        assert_eq!(payload.summary, "A video.");
        assert_eq!(payload.chapters[0].timestamp.as_deref(), Some("00:00:00"));
        assert_eq!(payload.key_points, vec!["one"]);
    }

    #[test]
    fn missing_chapters_is_a_validation_error() {
        let response = r#"{"summary": "A video.", "key_points": ["one"]}"#;
        let err = parse_payload(response).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn empty_summary_is_a_validation_error() {
        let response = r#"{"summary": "  ", "chapters": [], "key_points": []}"#;
        let err = parse_payload(response).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn timestamps_normalize_to_fixed_width() {
        assert_eq!(normalize_timestamp("1:02:03").as_deref(), Some("01:02:03"));
        assert_eq!(normalize_timestamp("5:00").as_deref(), Some("00:05:00"));
        assert_eq!(normalize_timestamp("90").as_deref(), Some("00:01:30"));
        assert_eq!(normalize_timestamp("about halfway"), None);
        assert_eq!(normalize_timestamp("9:99"), None);
    }
}
