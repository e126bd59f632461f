//! Streaming response pipeline.
//!
//! [`StreamingPipeline`] owns the remote [`ChatSession`] (system instruction + history) and
//! turns one user input into a lazy stream of [`TextChunk`]s. Any call that carries a
//! profile rebuilds the session with a fresh instruction, seeded from the caller's
//! conversation, so an instruction is never reused across profiles. Completed turns are committed to the session history only if the stream ran
//! to its end and no reset happened in between.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::Mutex;

use crate::error::CoreResult;
use crate::generation::{Citation, Content, GenerationEvent, GenerationService, Part, TurnRequest};
use crate::prompts::{build_system_instruction, SOURCES_HEADING, TRANSPORT_ERROR_MARKER, VOICE_NOTE_CAPTION};
use crate::shared::{Message, Role, UserProfile};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserInput {
    Text(String),
    /// Recorded audio sent inline with a caption.
    VoiceNote { audio: Vec<u8>, mime_type: String },
}

impl UserInput {
    pub fn text(t: impl Into<String>) -> Self {
        UserInput::Text(t.into())
    }

    fn into_content(self) -> Content {
        match self {
            UserInput::Text(t) => Content::user(vec![Part::text(t)]),
            UserInput::VoiceNote { audio, mime_type } => Content::user(vec![
                Part::inline(mime_type, &audio),
                Part::text(VOICE_NOTE_CAPTION),
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Delta,
    /// Trailing citations block.
    Sources,
    /// Locally generated failure marker; always the last chunk.
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub kind: ChunkKind,
    pub text: String,
}

impl TextChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Delta,
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ChunkKind::Error
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = TextChunk> + Send>>;

/// Remote conversation state.
#[derive(Debug, Clone)]
pub struct ChatSession {
    system_instruction: String,
    history: Vec<Content>,
    id: u64,
}

impl ChatSession {
    fn new(system_instruction: String, history: Vec<Content>, id: u64) -> Self {
        Self {
            system_instruction,
            history,
            id,
        }
    }

    pub fn system_instruction(&self) -> &str {
        &self.system_instruction
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }
}

/// Remote history for a rebuilt session. Error notices are local, so they are dropped
/// together with the user turn they answered.
fn seed_history(prior: &[Message]) -> Vec<Content> {
    let mut history: Vec<Content> = Vec::with_capacity(prior.len());
    for msg in prior {
        if msg.is_error {
            if msg.role == Role::Model && history.last().is_some_and(|c| c.role == "user") {
                history.pop();
            }
            continue;
        }
        if msg.text.is_empty() {
            continue;
        }
        history.push(Content::from_message(msg));
    }
    history
}

/// Citation block for the end of a reply: deduplicated by URL (last title wins), sorted by title.
pub fn format_sources(citations: &[Citation]) -> Option<String> {
    let mut by_url: HashMap<&str, &str> = HashMap::new();
    for c in citations {
        if !c.url.is_empty() && !c.title.is_empty() {
            by_url.insert(&c.url, &c.title);
        }
    }
    if by_url.is_empty() {
        return None;
    }
    let mut entries: Vec<(&str, &str)> = by_url.into_iter().collect();
    entries.sort_by(|(ua, ta), (ub, tb)| {
        ta.to_lowercase()
            .cmp(&tb.to_lowercase())
            .then_with(|| ta.cmp(tb))
            .then_with(|| ua.cmp(ub))
    });
    let mut out = String::from(SOURCES_HEADING);
    for (url, title) in entries {
        out.push_str(&format!("- [{title}]({url})\n"));
    }
    Some(out)
}

pub struct StreamingPipeline {
    service: Arc<dyn GenerationService>,
    session: Arc<Mutex<Option<ChatSession>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl StreamingPipeline {
    pub fn new(service: Arc<dyn GenerationService>) -> Self {
        Self {
            service,
            session: Arc::new(Mutex::new(None)),
            next_id: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn fresh_session(&self, profile: Option<&UserProfile>, prior: &[Message]) -> ChatSession {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        ChatSession::new(build_system_instruction(profile), seed_history(prior), id)
    }

    /// Drop the remote session; the next send starts a new one.
    pub async fn reset(&self) {
        *self.session.lock().await = None;
        tracing::debug!("chat session reset");
    }

    pub async fn session(&self) -> Option<ChatSession> {
        self.session.lock().await.clone()
    }

    /// Send one input. `Err` means the service could not be reached; failures after that
    /// arrive as a final [`ChunkKind::Error`] chunk.
    pub async fn send(&self, input: UserInput, context: Option<&UserProfile>) -> CoreResult<ChunkStream> {
        self.send_with_history(input, context, &[]).await
    }

    /// Like [`send`](Self::send), but a session rebuilt for this call starts from `prior`,
    /// the messages exchanged before `input`.
    pub async fn send_with_history(
        &self,
        input: UserInput,
        context: Option<&UserProfile>,
        prior: &[Message],
    ) -> CoreResult<ChunkStream> {
        let content = input.into_content();
        let (request, session_id) = {
            let mut guard = self.session.lock().await;
            if context.is_some() {
                *guard = None;
            }
            let session = guard.get_or_insert_with(|| {
                tracing::debug!(with_profile = context.is_some(), seeded = prior.len(), "chat session rebuilt");
                self.fresh_session(context, prior)
            });
            (
                TurnRequest {
                    system_instruction: session.system_instruction.clone(),
                    history: session.history.clone(),
                    input: content.clone(),
                },
                session.id,
            )
        };

        let mut events = self.service.stream_turn(request).await?;
        let session = Arc::clone(&self.session);

        let stream = async_stream::stream! {
            let mut reply = String::new();
            let mut citations: Vec<Citation> = Vec::new();
            let mut failed = false;

            while let Some(event) = events.recv().await {
                match event {
                    GenerationEvent::Text(t) => {
                        if t.is_empty() {
                            continue;
                        }
                        reply.push_str(&t);
                        yield TextChunk::delta(t);
                    }
                    GenerationEvent::Grounding(list) => citations = list,
                    GenerationEvent::Failed(reason) => {
                        tracing::warn!(%reason, "generation stream failed");
                        failed = true;
                        break;
                    }
                }
            }

            if failed {
                yield TextChunk { kind: ChunkKind::Error, text: TRANSPORT_ERROR_MARKER.to_string() };
                return;
            }

            if let Some(block) = format_sources(&citations) {
                reply.push_str(&block);
                yield TextChunk { kind: ChunkKind::Sources, text: block };
            }

            let mut guard = session.lock().await;
            if let Some(s) = guard.as_mut().filter(|s| s.id == session_id) {
                s.history.push(content);
                s.history.push(Content::model_text(reply));
            }
        };
        Ok(Box::pin(stream))
    }
}
