//! Per-surface conversation state: ordered messages, one phase, and a stream epoch.
//!
//! Each dispatched exchange gets a new epoch. Fragments are applied only when they carry
//! the current epoch, so anything still in flight when the epoch moves (crisis, clear,
//! close) is dropped on arrival.

use crate::error::{CoreError, CoreResult};
use crate::pipeline::{ChunkKind, TextChunk};
use crate::prompts::FOCUS_MODE_MESSAGE;
use crate::shared::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    /// Request sent, no fragment yet.
    Loading,
    Streaming,
    /// Voice note being captured.
    Recording,
    CrisisLocked,
}

impl SessionPhase {
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionPhase::Loading | SessionPhase::Streaming | SessionPhase::Recording)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationSession {
    messages: Vec<Message>,
    phase: SessionPhase,
    epoch: u64,
}

impl ConversationSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_history(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_locked(&self) -> bool {
        self.phase == SessionPhase::CrisisLocked
    }

    fn ensure_accepting(&self) -> CoreResult<()> {
        match self.phase {
            SessionPhase::CrisisLocked => Err(CoreError::SessionLocked),
            SessionPhase::Recording => Err(CoreError::SessionBusy("recording in progress")),
            SessionPhase::Loading | SessionPhase::Streaming => {
                Err(CoreError::SessionBusy("a reply is still streaming"))
            }
            SessionPhase::Idle => Ok(()),
        }
    }

    /// Local exchange with no remote request (e.g. privacy reassurance).
    pub fn push_local_exchange(&mut self, user: Message, reply: Message) -> CoreResult<()> {
        self.ensure_accepting()?;
        self.messages.push(user);
        self.messages.push(reply);
        Ok(())
    }

    /// Append the user's message and enter `Loading`. Returns the epoch of the new exchange.
    pub fn begin_exchange(&mut self, user: Message) -> CoreResult<u64> {
        self.ensure_accepting()?;
        self.messages.push(user);
        self.phase = SessionPhase::Loading;
        self.epoch += 1;
        Ok(self.epoch)
    }

    pub fn begin_recording(&mut self) -> CoreResult<()> {
        self.ensure_accepting()?;
        self.phase = SessionPhase::Recording;
        Ok(())
    }

    /// Leave `Recording` without sending anything.
    pub fn cancel_recording(&mut self) -> bool {
        if self.phase == SessionPhase::Recording {
            self.phase = SessionPhase::Idle;
            true
        } else {
            false
        }
    }

    /// Turn the open recording into an exchange.
    pub fn finish_recording(&mut self, user: Message) -> CoreResult<u64> {
        match self.phase {
            SessionPhase::Recording => {
                self.phase = SessionPhase::Idle;
                self.begin_exchange(user)
            }
            SessionPhase::CrisisLocked => Err(CoreError::SessionLocked),
            _ => Err(CoreError::InvalidTransition("no recording in progress".into())),
        }
    }

    /// Apply one fragment in delivery order. Returns false if it was stale and dropped.
    pub fn apply_chunk(&mut self, epoch: u64, chunk: &TextChunk) -> bool {
        if epoch != self.epoch || !matches!(self.phase, SessionPhase::Loading | SessionPhase::Streaming) {
            return false;
        }
        if self.phase == SessionPhase::Loading {
            self.messages.push(Message::model(""));
            self.phase = SessionPhase::Streaming;
        }
        if let Some(last) = self.messages.last_mut().filter(|m| m.role == Role::Model) {
            last.text.push_str(&chunk.text);
            if chunk.kind == ChunkKind::Error {
                last.is_error = true;
            }
        }
        true
    }

    /// End of the stream for `epoch`. Returns false if stale.
    pub fn finish(&mut self, epoch: u64) -> bool {
        if epoch != self.epoch || !matches!(self.phase, SessionPhase::Loading | SessionPhase::Streaming) {
            return false;
        }
        self.phase = SessionPhase::Idle;
        true
    }

    /// The exchange never connected: append a model-role error notice.
    pub fn fail_connect(&mut self, epoch: u64, notice: &str) -> bool {
        if epoch != self.epoch || self.phase != SessionPhase::Loading {
            return false;
        }
        self.messages.push(Message::model_error(notice));
        self.phase = SessionPhase::Idle;
        true
    }

    /// Enter `CrisisLocked`, invalidating any in-flight exchange. `user_text` and the focus
    /// notice are appended.
    pub fn lock_for_crisis(&mut self, user_text: Option<&str>) {
        self.epoch += 1;
        self.phase = SessionPhase::CrisisLocked;
        if let Some(text) = user_text {
            self.messages.push(Message::user(text));
        }
        self.messages.push(Message::model_error(FOCUS_MODE_MESSAGE));
    }

    /// Drop all messages and any in-flight exchange. A crisis lock survives.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.epoch += 1;
        if self.phase != SessionPhase::CrisisLocked {
            self.phase = SessionPhase::Idle;
        }
    }

    /// Invalidate any in-flight exchange without touching messages.
    pub fn abandon(&mut self) {
        self.epoch += 1;
        if self.phase.is_busy() {
            self.phase = SessionPhase::Idle;
        }
    }

    /// Concatenated text of the trailing model message.
    pub fn last_reply(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Model)
            .map(|m| m.text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_accumulate_into_one_model_message() {
        let mut c = ConversationSession::new();
        let e = c.begin_exchange(Message::user("salut")).unwrap();
        assert_eq!(c.phase(), SessionPhase::Loading);
        assert!(c.apply_chunk(e, &TextChunk::delta("Bon")));
        assert_eq!(c.phase(), SessionPhase::Streaming);
        assert!(c.apply_chunk(e, &TextChunk::delta("jour")));
        assert!(c.finish(e));
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.last_reply(), Some("Bonjour"));
        assert_eq!(c.phase(), SessionPhase::Idle);
    }

    #[test]
    fn busy_session_refuses_new_exchange() {
        let mut c = ConversationSession::new();
        c.begin_exchange(Message::user("a")).unwrap();
        assert!(matches!(c.begin_exchange(Message::user("b")), Err(CoreError::SessionBusy(_))));
        assert!(matches!(c.begin_recording(), Err(CoreError::SessionBusy(_))));
    }

    #[test]
    fn crisis_lock_drops_late_fragments() {
        let mut c = ConversationSession::new();
        let e = c.begin_exchange(Message::user("a")).unwrap();
        c.apply_chunk(e, &TextChunk::delta("début"));
        c.lock_for_crisis(Some("je veux mourir"));
        assert!(!c.apply_chunk(e, &TextChunk::delta(" suite")));
        assert!(!c.finish(e));
        assert_eq!(c.phase(), SessionPhase::CrisisLocked);
        assert_eq!(c.messages()[1].text, "début");
        assert!(c.messages().last().is_some_and(|m| m.is_error));
        assert!(matches!(c.begin_exchange(Message::user("b")), Err(CoreError::SessionLocked)));
    }

    #[test]
    fn error_chunk_flags_the_reply() {
        let mut c = ConversationSession::new();
        let e = c.begin_exchange(Message::user("a")).unwrap();
        c.apply_chunk(e, &TextChunk::delta("Je"));
        c.apply_chunk(
            e,
            &TextChunk {
                kind: ChunkKind::Error,
                text: "\n[Connexion interrompue]".into(),
            },
        );
        let last = c.messages().last().unwrap();
        assert!(last.is_error);
        assert_eq!(last.text, "Je\n[Connexion interrompue]");
    }

    #[test]
    fn recording_round_trip() {
        let mut c = ConversationSession::new();
        c.begin_recording().unwrap();
        assert!(c.cancel_recording());
        assert!(matches!(
            c.finish_recording(Message::user("x")),
            Err(CoreError::InvalidTransition(_))
        ));
        c.begin_recording().unwrap();
        let e = c.finish_recording(Message::user("🎤")).unwrap();
        assert_eq!(e, c.epoch());
        assert_eq!(c.phase(), SessionPhase::Loading);
    }
}
