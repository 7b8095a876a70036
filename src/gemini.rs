//! Gateway to the Gemini REST API.
//!
//! The three remote capabilities the assistant needs (image classification,
//! streaming chat and search-grounded summarization) sit behind the
//! [`AiGateway`] trait so controllers can be driven by a fake provider in
//! tests. [`GeminiClient`] is the real implementation.

use std::collections::VecDeque;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::chat::{Origin, TranscriptEntry};
use crate::constants;
use crate::diagnosis::AnalysisResult;
use crate::error::GatewayError;
use crate::market::{GroundingSource, MarketInsight};

/// Text fragments of one streaming exchange, in arrival order.
pub type FragmentStream = BoxStream<'static, Result<String, GatewayError>>;

#[async_trait]
pub trait AiGateway: Send + Sync {
    /// Classifies a plant image. Never fails on a malformed reply, only when
    /// the call itself fails.
    async fn classify_image(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<AnalysisResult, GatewayError>;

    /// Opens a streaming chat exchange. The caller concatenates fragments.
    async fn stream_chat(
        &self,
        history: &[TranscriptEntry],
        message: &str,
    ) -> Result<FragmentStream, GatewayError>;

    async fn query_market(&self, query: &str) -> Result<MarketInsight, GatewayError>;
}

/// Drives [`AiGateway::stream_chat`], calling `on_fragment` once per fragment.
///
/// Fragments delivered before a transport error are not rolled back.
pub async fn stream_chat_with<G, F>(
    gateway: &G,
    history: &[TranscriptEntry],
    message: &str,
    mut on_fragment: F,
) -> Result<(), GatewayError>
where
    G: AiGateway + ?Sized,
    F: FnMut(&str),
{
    let mut fragments = gateway.stream_chat(history, message).await?;
    while let Some(fragment) = fragments.next().await {
        on_fragment(&fragment?);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

impl GeminiConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: constants::GEMINI_API_KEY.clone(),
            base_url: constants::GEMINI_API_BASE.clone(),
            model: constants::AGRISMART_MODEL.clone(),
        }
    }
}

pub struct GeminiClient {
    http: Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, GatewayError> {
        if config.api_key.trim().is_empty() {
            return Err(GatewayError::MissingApiKey);
        }
        Ok(Self {
            http: Client::new(),
            config,
        })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn endpoint(&self, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.model,
            method
        )
    }

    async fn post(
        &self,
        method: &str,
        query: &[(&str, &str)],
        request: &GenerateContentRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = self.endpoint(method);
        debug!(%url, "Sending request to Gemini");

        let response = self
            .http
            .post(&url)
            .query(query)
            .header("x-goog-api-key", &self.config.api_key)
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_string());
            error!(%status, %body, "Gemini API request failed");
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    async fn generate(
        &self,
        request: &GenerateContentRequest,
    ) -> Result<GenerateContentResponse, GatewayError> {
        let body = self.post("generateContent", &[], request).await?.text().await?;
        let mut response: GenerateContentResponse = serde_json::from_str(&body)?;
        if let Some(err) = response.error.take() {
            return Err(GatewayError::Api(err.message));
        }
        Ok(response)
    }
}

#[async_trait]
impl AiGateway for GeminiClient {
    #[instrument(skip(self, image), fields(bytes = image.len()))]
    async fn classify_image(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<AnalysisResult, GatewayError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![
                    Part::text(constants::DIAGNOSIS_PROMPT),
                    Part::inline(mime_type, STANDARD.encode(image)),
                ],
            }],
            generation_config: Some(GenerationConfig {
                response_mime_type: Some("application/json".to_string()),
            }),
            ..Default::default()
        };

        let response = self.generate(&request).await?;
        let reply = response.text();
        debug!(%reply, "Received classification reply");
        Ok(AnalysisResult::from_reply(&reply))
    }

    #[instrument(skip(self, history, message), fields(history = history.len()))]
    async fn stream_chat(
        &self,
        history: &[TranscriptEntry],
        message: &str,
    ) -> Result<FragmentStream, GatewayError> {
        let mut contents = history_contents(history);
        contents.push(Content {
            role: Some("user".to_string()),
            parts: vec![Part::text(message)],
        });
        let request = GenerateContentRequest {
            contents,
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part::text(constants::ADVISOR_SYSTEM_INSTRUCTION)],
            }),
            ..Default::default()
        };

        let response = self
            .post("streamGenerateContent", &[("alt", "sse")], &request)
            .await?;
        info!("Chat stream opened");
        Ok(fragment_stream(Box::pin(response.bytes_stream())))
    }

    #[instrument(skip(self))]
    async fn query_market(&self, query: &str) -> Result<MarketInsight, GatewayError> {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(constants::market_prompt(query))],
            }],
            tools: vec![Tool::google_search()],
            ..Default::default()
        };

        let response = self.generate(&request).await?;
        let text = response.text();
        let content = if text.is_empty() {
            "No insights found.".to_string()
        } else {
            text
        };
        let sources = response.grounding_sources();
        debug!(sources = sources.len(), "Received market insight");
        Ok(MarketInsight { content, sources })
    }
}

/// Maps the transcript to provider contents. Failed entries carry a local
/// apology rather than model output, so they are left out, as are empty ones.
fn history_contents(history: &[TranscriptEntry]) -> Vec<Content> {
    history
        .iter()
        .filter(|entry| !entry.failed && !entry.text.is_empty())
        .map(|entry| Content {
            role: Some(
                match entry.origin {
                    Origin::Operator => "user",
                    Origin::Assistant => "model",
                }
                .to_string(),
            ),
            parts: vec![Part::text(&entry.text)],
        })
        .collect()
}

// Structures matching Gemini's generateContent request and response bodies.
#[derive(Serialize, Default, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    // Thought summaries are not part of the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    thought: Option<bool>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    fn inline(mime_type: &str, data: String) -> Self {
        Self {
            inline_data: Some(InlineData {
                mime_type: mime_type.to_string(),
                data,
            }),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: GoogleSearch,
}

impl Tool {
    fn google_search() -> Self {
        Self {
            google_search: GoogleSearch {},
        }
    }
}

#[derive(Serialize, Debug)]
struct GoogleSearch {}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize, Debug)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebChunk>,
}

#[derive(Deserialize, Debug)]
struct WebChunk {
    #[serde(default)]
    uri: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

impl GenerateContentResponse {
    /// Concatenated text parts of the first candidate; empty when absent.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter(|part| part.thought != Some(true))
                    .filter_map(|part| part.text.as_deref())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Web citations of the first candidate, in the order the provider sent them.
    fn grounding_sources(&self) -> Vec<GroundingSource> {
        let Some(metadata) = self
            .candidates
            .first()
            .and_then(|candidate| candidate.grounding_metadata.as_ref())
        else {
            return Vec::new();
        };

        metadata
            .grounding_chunks
            .iter()
            .filter_map(|chunk| chunk.web.as_ref())
            .filter_map(|web| {
                let uri = web.uri.clone().filter(|uri| !uri.is_empty())?;
                let title = web
                    .title
                    .clone()
                    .filter(|title| !title.is_empty())
                    .unwrap_or_else(|| uri.clone());
                Some(GroundingSource { uri, title })
            })
            .collect()
    }
}

/// Splits a server-sent event body into `data` payloads. Bytes are buffered
/// until a full line is available, so events may straddle chunk boundaries.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.accept_line(trim_line_end(&line)) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes whatever the body ended with, terminated or not.
    fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        if let Some(event) = self.accept_line(trim_line_end(&line)) {
            return Some(event);
        }
        self.take_event()
    }

    fn accept_line(&mut self, line: &str) -> Option<String> {
        if line.is_empty() {
            return self.take_event();
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data
                .push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // Comments and event/id/retry fields are ignored.
        None
    }

    fn take_event(&mut self) -> Option<String> {
        if self.data.is_empty() {
            return None;
        }
        let event = self.data.join("\n");
        self.data.clear();
        Some(event)
    }
}

fn trim_line_end(line: &str) -> &str {
    line.trim_end_matches(|c| c == '\n' || c == '\r')
}

fn fragment_from_event(payload: &str) -> Result<Option<String>, GatewayError> {
    let mut chunk: GenerateContentResponse = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(%payload, error = %e, "Skipping undecodable stream event");
            return Ok(None);
        }
    };
    if let Some(err) = chunk.error.take() {
        return Err(GatewayError::Api(err.message));
    }
    let text = chunk.text();
    Ok((!text.is_empty()).then_some(text))
}

struct StreamState<S> {
    body: S,
    decoder: SseDecoder,
    ready: VecDeque<String>,
    finished: bool,
}

/// Lazily turns an SSE response body into text fragments. The stream ends
/// after the body ends or after the first error.
fn fragment_stream<S, B>(body: S) -> FragmentStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = StreamState {
        body,
        decoder: SseDecoder::default(),
        ready: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(payload) = state.ready.pop_front() {
                match fragment_from_event(&payload) {
                    Ok(Some(text)) => return Some((Ok(text), state)),
                    Ok(None) => continue,
                    Err(e) => {
                        state.finished = true;
                        state.ready.clear();
                        return Some((Err(e), state));
                    }
                }
            }
            if state.finished {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(chunk.as_ref());
                    state.ready.extend(events);
                }
                Some(Err(e)) => {
                    error!("Chat stream error: {}", e);
                    state.finished = true;
                    return Some((Err(GatewayError::Transport(e)), state));
                }
                None => {
                    state.finished = true;
                    state.ready.extend(state.decoder.finish());
                }
            }
        }
    })
    .boxed()
}


#[cfg(test)]
mod tests {
    use super::*;

    fn body(
        chunks: Vec<&'static str>,
    ) -> impl Stream<Item = Result<&'static [u8], reqwest::Error>> + Send + Unpin + 'static {
        stream::iter(chunks.into_iter().map(|c| Ok(c.as_bytes())))
    }

    async fn collect(chunks: Vec<&'static str>) -> Vec<Result<String, GatewayError>> {
        fragment_stream(body(chunks)).collect().await
    }

    #[test]
    fn test_sse_decoder_joins_events_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let events = decoder.push(b"1}\r\n\r\ndata: two\n\n");
        assert_eq!(events, vec!["{\"a\":1}".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_sse_decoder_multiline_data_and_comments() {
        let mut decoder = SseDecoder::default();
        let events = decoder.push(b": keepalive\nevent: message\ndata: a\ndata: b\n\n");
        assert_eq!(events, vec!["a\nb".to_string()]);
    }

    #[test]
    fn test_sse_decoder_flushes_unterminated_event() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: last").is_empty());
        assert_eq!(decoder.finish(), Some("last".to_string()));
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn test_fragment_stream_yields_text_in_order() {
        let first = "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hello\"}]}}]}\n\n";
        let second = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\", world\"}]}}]}\n\n";
        let items = collect(vec![first, second]).await;
        let texts: Vec<String> = items.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(texts, vec!["Hello".to_string(), ", world".to_string()]);
    }

    #[tokio::test]
    async fn test_fragment_stream_skips_empty_and_undecodable_events() {
        let items = collect(vec![
            "data: not json\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"ok\"}]}}]}",
        ])
        .await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_fragment_stream_stops_on_provider_error() {
        let items = collect(vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"partial\"}]}}]}\n\n",
            "data: {\"error\":{\"code\":503,\"message\":\"overloaded\"}}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"never\"}]}}]}\n\n",
        ])
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "partial");
        assert!(matches!(items[1], Err(GatewayError::Api(ref m)) if m == "overloaded"));
    }

    #[test]
    fn test_response_text_skips_thought_parts() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"thinking","thought":true},{"text":"A"},{"text":"B"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(response.text(), "AB");
    }

    #[test]
    fn test_grounding_sources_keep_provider_order() {
        let response: GenerateContentResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"x"}]},
                "groundingMetadata":{"groundingChunks":[
                    {"web":{"uri":"https://b","title":"B"}},
                    {"retrievedContext":{}},
                    {"web":{"title":"no uri"}},
                    {"web":{"uri":"https://a"}},
                    {"web":{"uri":"https://b","title":"B"}}
                ]}}]}"#,
        )
        .unwrap();
        let sources = response.grounding_sources();
        let uris: Vec<&str> = sources.iter().map(|s| s.uri.as_str()).collect();
        assert_eq!(uris, vec!["https://b", "https://a", "https://b"]);
        assert_eq!(sources[1].title, "https://a");
    }

    #[test]
    fn test_history_contents_maps_roles_and_drops_failures() {
        let mut failed = TranscriptEntry::assistant("");
        failed.text = constants::ADVISOR_APOLOGY.to_string();
        failed.failed = true;
        let history = vec![
            TranscriptEntry::assistant(constants::ADVISOR_GREETING),
            TranscriptEntry::operator("When to sow peas?"),
            failed,
            TranscriptEntry::assistant(""),
        ];
        let contents = history_contents(&history);
        let roles: Vec<&str> = contents.iter().map(|c| c.role.as_deref().unwrap()).collect();
        assert_eq!(roles, vec!["model", "user"]);
    }

    #[test]
    fn test_request_serializes_in_wire_shape() {
        let request = GenerateContentRequest {
            contents: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text("hi"), Part::inline("image/png", "AAAA".to_string())],
            }],
            generation_config: Some(GenerationConfig {
                response_mime_type: Some("application/json".to_string()),
            }),
            tools: vec![Tool::google_search()],
            ..Default::default()
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(value["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(value["tools"][0]["googleSearch"], serde_json::json!({}));
        assert!(value.get("systemInstruction").is_none());
    }

    #[test]
    fn test_client_requires_api_key() {
        let config = GeminiConfig {
            api_key: "  ".to_string(),
            base_url: "http://localhost".to_string(),
            model: "m".to_string(),
        };
        assert!(matches!(GeminiClient::new(config), Err(GatewayError::MissingApiKey)));
    }
}
