//! Gemini REST backend: `streamGenerateContent?alt=sse` with optional Google Search grounding.

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{Citation, Content, GenerationEvent, GenerationService, Part, TurnRequest};
use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<&'a Content>,
    system_instruction: SystemInstruction<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize, Default)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize, Default)]
struct GroundingChunk {
    #[serde(default)]
    web: Option<WebSource>,
}

#[derive(Deserialize, Default)]
struct WebSource {
    uri: Option<String>,
    title: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Events carried by one SSE `data:` payload. Unparseable payloads yield nothing.
pub fn parse_sse_payload(data: &str) -> Vec<GenerationEvent> {
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "skipping unparseable SSE payload");
            return Vec::new();
        }
    };
    if let Some(err) = chunk.error {
        return vec![GenerationEvent::Failed(err.message)];
    }
    let mut events = Vec::new();
    if let Some(candidate) = chunk.candidates.into_iter().next() {
        let text: String = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();
        if !text.is_empty() {
            events.push(GenerationEvent::Text(text));
        }
        if let Some(meta) = candidate.grounding_metadata {
            let citations: Vec<Citation> = meta
                .grounding_chunks
                .into_iter()
                .filter_map(|c| c.web)
                .filter_map(|w| match (w.uri, w.title) {
                    (Some(u), Some(t)) if !u.is_empty() && !t.is_empty() => Some(Citation::new(u, t)),
                    _ => None,
                })
                .collect();
            if !citations.is_empty() {
                events.push(GenerationEvent::Grounding(citations));
            }
        }
    }
    events
}

pub struct GeminiService {
    client: reqwest::Client,
    api_base: String,
    model: String,
    api_key: String,
    grounding: bool,
}

impl GeminiService {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: CoreConfig::default().api_base,
            model: model.into(),
            api_key: api_key.into(),
            grounding: true,
        }
    }

    /// Fails with a configuration error when no API key is set.
    pub fn from_config(cfg: &CoreConfig) -> CoreResult<Self> {
        let key = cfg.require_api_key()?;
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout())
            .build()?;
        Ok(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            model: cfg.chat_model.clone(),
            api_key: key.to_string(),
            grounding: cfg.grounding_enabled,
        })
    }

    pub fn with_grounding(mut self, enabled: bool) -> Self {
        self.grounding = enabled;
        self
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse",
            self.api_base, self.model
        )
    }
}

/// Splits an SSE byte stream into `data:` payloads.
///
/// Bytes are buffered until a full line arrives, so a character split across network
/// chunks is decoded whole.
#[derive(Debug, Default)]
struct SseLines {
    buffer: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(data) = data_field(&line[..newline_pos]) {
                payloads.push(data);
            }
        }
        payloads
    }

    fn finish(self) -> Option<String> {
        data_field(&self.buffer)
    }
}

fn data_field(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    line.trim().strip_prefix("data:").map(|d| d.trim().to_string())
}

#[async_trait]
impl GenerationService for GeminiService {
    async fn stream_turn(&self, request: TurnRequest) -> CoreResult<mpsc::Receiver<GenerationEvent>> {
        let mut contents: Vec<&Content> = request.history.iter().collect();
        contents.push(&request.input);
        let body = GenerateRequest {
            contents,
            system_instruction: SystemInstruction {
                parts: [TextPart {
                    text: &request.system_instruction,
                }],
            },
            tools: if self.grounding {
                vec![serde_json::json!({ "googleSearch": {} })]
            } else {
                Vec::new()
            },
        };

        tracing::info!(model = %self.model, turns = request.history.len(), "streaming turn started");

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(%status, "generation request rejected: {}", error_text);
            return Err(CoreError::Transport(format!("HTTP {status}: {error_text}")));
        }

        let (tx, rx) = mpsc::channel::<GenerationEvent>(100);
        let model = self.model.clone();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut lines = SseLines::default();

            loop {
                let bytes = match stream.try_next().await {
                    Ok(Some(b)) => b,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "generation stream broke");
                        let _ = tx.send(GenerationEvent::Failed(e.to_string())).await;
                        return;
                    }
                };
                for data in lines.push(&bytes) {
                    for event in parse_sse_payload(&data) {
                        let failed = matches!(event, GenerationEvent::Failed(_));
                        if tx.send(event).await.is_err() || failed {
                            return;
                        }
                    }
                }
            }

            if let Some(data) = lines.finish() {
                for event in parse_sse_payload(&data) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
            tracing::debug!(%model, "generation stream completed");
        });

        Ok(rx)
    }

    fn name(&self) -> &'static str {
        "gemini"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_yields_text_then_grounding() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"Bon"},{"text":"jour"}]},
            "groundingMetadata":{"groundingChunks":[
                {"web":{"uri":"https://a.example","title":"A"}},
                {"web":{"uri":"https://b.example"}},
                {"retrievedContext":{}}
            ]}}]}"#;
        assert_eq!(
            parse_sse_payload(data),
            vec![
                GenerationEvent::Text("Bonjour".into()),
                GenerationEvent::Grounding(vec![Citation::new("https://a.example", "A")]),
            ]
        );
    }

    #[test]
    fn payload_error_is_a_failure() {
        let data = r#"{"error":{"code":429,"message":"quota"}}"#;
        assert_eq!(parse_sse_payload(data), vec![GenerationEvent::Failed("quota".into())]);
    }

    #[test]
    fn garbage_payload_is_skipped() {
        assert!(parse_sse_payload("not json").is_empty());
        assert!(parse_sse_payload(r#"{"candidates":[]}"#).is_empty());
    }

    #[test]
    fn character_split_across_chunks_stays_intact() {
        let line = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"fatigué\"}]}}]}\n";
        let bytes = line.as_bytes();
        // cut between the two bytes of "é"
        let cut = line.find('é').unwrap() + 1;
        let mut lines = SseLines::default();
        assert!(lines.push(&bytes[..cut]).is_empty());
        let payloads = lines.push(&bytes[cut..]);
        assert_eq!(payloads.len(), 1);
        assert_eq!(parse_sse_payload(&payloads[0]), vec![GenerationEvent::Text("fatigué".into())]);
    }

    #[test]
    fn sse_lines_skip_non_data_and_keep_the_tail() {
        let mut lines = SseLines::default();
        assert_eq!(lines.push(b": ping\r\ndata: {\"a\":1}\r\n\r\ndata: {\"b\""), vec![r#"{"a":1}"#]);
        assert_eq!(lines.push(b":2}").len(), 0);
        assert_eq!(lines.finish().as_deref(), Some(r#"{"b":2}"#));
    }

    #[test]
    fn from_config_requires_a_key() {
        let cfg = CoreConfig::default();
        let err = GeminiService::from_config(&cfg).err();
        assert!(matches!(err, Some(CoreError::Configuration(_))));
    }

    #[test]
    fn endpoint_targets_sse_stream() {
        let svc = GeminiService::new("k", "gemini-3-flash-preview");
        assert!(svc
            .endpoint()
            .ends_with("/models/gemini-3-flash-preview:streamGenerateContent?alt=sse"));
    }
}
