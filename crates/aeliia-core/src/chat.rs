//! Text chat surface.
//!
//! Every outbound message is crisis-checked before anything else, including while a reply
//! is still streaming. A match dials the emergency line, locks the conversation and cancels
//! the pump, so no later fragment of the in-flight reply is applied. Otherwise the message
//! is dispatched through the [`StreamingPipeline`] by a spawned pump task that applies
//! fragments to the shared [`ConversationSession`] in delivery order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conversation::{ConversationSession, SessionPhase};
use crate::error::{CoreError, CoreResult};
use crate::generation::GenerationService;
use crate::pipeline::{StreamingPipeline, TextChunk, UserInput};
use crate::prompts::{
    CONNECTION_ERROR_MESSAGE, PRIVACY_REASSURANCE, VOICE_NOTE_ERROR_MESSAGE, VOICE_NOTE_PLACEHOLDER,
};
use crate::safety::{wants_reassurance, CrisisDetector, EmergencyProtocol};
use crate::shared::{Message, UserProfile};
use crate::store::ProfileStore;

/// Collaborators of a chat surface.
#[derive(Clone)]
pub struct ChatDeps {
    pub service: Arc<dyn GenerationService>,
    pub store: ProfileStore,
    pub emergency: EmergencyProtocol,
    pub detector: CrisisDetector,
}

impl ChatDeps {
    pub fn new(service: Arc<dyn GenerationService>, store: ProfileStore, emergency: EmergencyProtocol) -> Self {
        Self {
            service,
            store,
            emergency,
            detector: CrisisDetector::default(),
        }
    }
}

/// Change notifications for a renderer.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatUpdate {
    Appended(Message),
    Fragment(TextChunk),
    Phase(SessionPhase),
    Crisis,
    Cleared,
    Closed,
}

/// Handle on a dispatched exchange.
#[derive(Debug)]
pub struct StreamTicket {
    pub epoch: u64,
    handle: JoinHandle<()>,
}

impl StreamTicket {
    /// Wait until the pump has stopped (completed, failed, or cancelled).
    pub async fn finished(self) {
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "chat pump task ended abnormally");
        }
    }
}

#[derive(Debug)]
pub enum SendOutcome {
    /// Blank input; nothing happened.
    Ignored,
    /// Answered locally with the privacy reassurance.
    Reassured,
    Dispatched(StreamTicket),
    /// Crisis detected: emergency triggered, conversation locked, nothing sent.
    CrisisLocked,
}

struct Shared {
    conversation: Mutex<ConversationSession>,
    pipeline: StreamingPipeline,
    store: ProfileStore,
    detector: CrisisDetector,
    emergency: EmergencyProtocol,
    profile: UserProfile,
    premium: bool,
    updates: broadcast::Sender<ChatUpdate>,
    pump: Mutex<Option<CancellationToken>>,
    activation: CancellationToken,
    closed: AtomicBool,
}

impl Shared {
    fn conv(&self) -> MutexGuard<'_, ConversationSession> {
        self.conversation.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, update: ChatUpdate) {
        let _ = self.updates.send(update);
    }

    fn persist(&self, conv: &ConversationSession) {
        if !self.premium {
            return;
        }
        if let Err(e) = self.store.save_history(conv.messages()) {
            tracing::warn!(error = %e, "could not save chat history");
        }
    }

    fn cancel_pump(&self) {
        let token = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Install a fresh pump token. Called with the conversation guard held so a crisis
    /// lock on another clone always sees the token it has to cancel.
    fn arm_pump(&self, _conv: &ConversationSession) -> CancellationToken {
        let cancel = self.activation.child_token();
        let previous = self.pump.lock().unwrap_or_else(|e| e.into_inner()).replace(cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        cancel
    }

    async fn pump(&self, input: UserInput, epoch: u64, cancel: CancellationToken, connect_notice: &'static str) {
        let prior = {
            let conv = self.conv();
            if cancel.is_cancelled() || conv.is_locked() || conv.epoch() != epoch {
                tracing::debug!(epoch, "exchange superseded before the request went out");
                return;
            }
            // everything before the user turn this exchange opened
            let messages = conv.messages();
            messages[..messages.len().saturating_sub(1)].to_vec()
        };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            r = self.pipeline.send_with_history(input, Some(&self.profile), &prior) => r,
        };

        let mut stream = match sent {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "chat request failed to connect");
                let mut conv = self.conv();
                if conv.fail_connect(epoch, connect_notice) {
                    self.persist(&conv);
                    drop(conv);
                    self.publish(ChatUpdate::Appended(Message::model_error(connect_notice)));
                    self.publish(ChatUpdate::Phase(SessionPhase::Idle));
                }
                return;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(chunk) => {
                    let (applied, started) = {
                        let mut conv = self.conv();
                        let was_loading = conv.phase() == SessionPhase::Loading;
                        (conv.apply_chunk(epoch, &chunk), was_loading)
                    };
                    if !applied {
                        tracing::debug!(epoch, "dropping stale fragment");
                        return;
                    }
                    if started {
                        self.publish(ChatUpdate::Phase(SessionPhase::Streaming));
                    }
                    self.publish(ChatUpdate::Fragment(chunk));
                }
                None => {
                    let mut conv = self.conv();
                    if conv.finish(epoch) {
                        self.persist(&conv);
                        drop(conv);
                        self.publish(ChatUpdate::Phase(SessionPhase::Idle));
                    }
                    return;
                }
            }
        }
    }
}

/// One open chat surface. Clones share the same conversation.
#[derive(Clone)]
pub struct ChatSurface {
    shared: Arc<Shared>,
}

impl ChatSurface {
    /// Open on an activation token from the controller. Requires a complete profile.
    /// Premium users get their stored history back.
    pub fn open(deps: ChatDeps, activation: CancellationToken) -> CoreResult<Self> {
        let profile = deps
            .store
            .profile()
            .filter(UserProfile::is_complete)
            .ok_or_else(|| CoreError::InvalidProfile("chat needs a complete profile".into()))?;
        let premium = deps.store.user().is_some_and(|u| u.is_premium);
        let history = if premium { deps.store.history() } else { Vec::new() };
        tracing::info!(premium, restored = history.len(), "chat surface opened");

        let (updates, _) = broadcast::channel(256);
        Ok(Self {
            shared: Arc::new(Shared {
                conversation: Mutex::new(ConversationSession::with_history(history)),
                pipeline: StreamingPipeline::new(deps.service),
                store: deps.store,
                detector: deps.detector,
                emergency: deps.emergency,
                profile,
                premium,
                updates,
                pump: Mutex::new(None),
                activation,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Open and immediately send `initial` if given.
    pub fn open_with_initial(
        deps: ChatDeps,
        activation: CancellationToken,
        initial: Option<&str>,
    ) -> CoreResult<(Self, Option<SendOutcome>)> {
        let surface = Self::open(deps, activation)?;
        let outcome = match initial {
            Some(text) => Some(surface.send_text(text)?),
            None => None,
        };
        Ok((surface, outcome))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatUpdate> {
        self.shared.updates.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared.conv().messages().to_vec()
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.conv().phase()
    }

    pub fn is_locked(&self) -> bool {
        self.shared.conv().is_locked()
    }

    pub fn profile(&self) -> &UserProfile {
        &self.shared.profile
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.shared.closed.load(Ordering::SeqCst) || self.shared.activation.is_cancelled() {
            return Err(CoreError::InvalidTransition("chat surface is closed".into()));
        }
        Ok(())
    }

    pub fn send_text(&self, text: &str) -> CoreResult<SendOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Ignored);
        }
        let shared = &self.shared;
        let mut conv = shared.conv();
        if conv.is_locked() {
            return Err(CoreError::SessionLocked);
        }
        self.ensure_open()?;

        if let Some(keyword) = shared.detector.matched_keyword(text) {
            tracing::warn!(keyword, "crisis keyword in outbound message");
            shared.cancel_pump();
            shared.emergency.trigger();
            conv.lock_for_crisis(Some(text));
            shared.persist(&conv);
            drop(conv);
            shared.publish(ChatUpdate::Phase(SessionPhase::CrisisLocked));
            shared.publish(ChatUpdate::Crisis);
            return Ok(SendOutcome::CrisisLocked);
        }

        if !conv.phase().is_busy() && wants_reassurance(text, conv.messages().len()) {
            conv.push_local_exchange(Message::user(text), Message::model(PRIVACY_REASSURANCE))?;
            shared.persist(&conv);
            drop(conv);
            shared.publish(ChatUpdate::Appended(Message::user(text)));
            shared.publish(ChatUpdate::Appended(Message::model(PRIVACY_REASSURANCE)));
            return Ok(SendOutcome::Reassured);
        }

        let epoch = conv.begin_exchange(Message::user(text))?;
        tracing::debug!(epoch, "dispatching chat message");
        shared.persist(&conv);
        let cancel = shared.arm_pump(&conv);
        drop(conv);
        shared.publish(ChatUpdate::Appended(Message::user(text)));
        shared.publish(ChatUpdate::Phase(SessionPhase::Loading));
        Ok(self.dispatch(UserInput::text(text), epoch, cancel, CONNECTION_ERROR_MESSAGE))
    }

    fn dispatch(
        &self,
        input: UserInput,
        epoch: u64,
        cancel: CancellationToken,
        connect_notice: &'static str,
    ) -> SendOutcome {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            shared.pump(input, epoch, cancel, connect_notice).await;
        });
        SendOutcome::Dispatched(StreamTicket { epoch, handle })
    }

    /// Enter `Recording` for a voice note.
    pub fn begin_recording(&self) -> CoreResult<()> {
        self.ensure_open()?;
        self.shared.conv().begin_recording()?;
        self.shared.publish(ChatUpdate::Phase(SessionPhase::Recording));
        Ok(())
    }

    pub fn cancel_recording(&self) {
        if self.shared.conv().cancel_recording() {
            self.shared.publish(ChatUpdate::Phase(SessionPhase::Idle));
        }
    }

    /// Send the recorded note. Empty audio just ends the recording.
    pub fn send_voice_note(&self, audio: Vec<u8>, mime_type: &str) -> CoreResult<SendOutcome> {
        if audio.is_empty() {
            self.cancel_recording();
            return Ok(SendOutcome::Ignored);
        }
        self.ensure_open()?;
        let (epoch, cancel) = {
            let mut conv = self.shared.conv();
            let epoch = conv.finish_recording(Message::user(VOICE_NOTE_PLACEHOLDER))?;
            self.shared.persist(&conv);
            (epoch, self.shared.arm_pump(&conv))
        };
        tracing::debug!(epoch, bytes = audio.len(), mime_type, "dispatching voice note");
        self.shared.publish(ChatUpdate::Appended(Message::user(VOICE_NOTE_PLACEHOLDER)));
        self.shared.publish(ChatUpdate::Phase(SessionPhase::Loading));
        let input = UserInput::VoiceNote {
            audio,
            mime_type: mime_type.to_string(),
        };
        Ok(self.dispatch(input, epoch, cancel, VOICE_NOTE_ERROR_MESSAGE))
    }

    /// Forget the conversation: messages, stored history and the remote session.
    pub async fn clear_history(&self) -> CoreResult<()> {
        self.shared.cancel_pump();
        self.shared.conv().clear();
        self.shared.store.clear_history()?;
        self.shared.pipeline.reset().await;
        self.shared.publish(ChatUpdate::Cleared);
        Ok(())
    }

    /// Close the surface. Safe to call more than once.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.cancel_pump();
        {
            let mut conv = self.shared.conv();
            conv.abandon();
            self.shared.persist(&conv);
        }
        self.shared.publish(ChatUpdate::Closed);
        tracing::info!("chat surface closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{MockReply, MockService};
    use crate::safety::LogDialer;
    use std::time::Duration;

    fn deps(service: Arc<dyn GenerationService>) -> (ChatDeps, LogDialer) {
        let store = ProfileStore::temporary().unwrap();
        store.save_profile(&UserProfile::new("Lou", "35", "non précisé")).unwrap();
        let dialer = LogDialer::new();
        let emergency = EmergencyProtocol::new(Arc::new(dialer.clone()));
        (ChatDeps::new(service, store, emergency), dialer)
    }

    #[tokio::test]
    async fn blank_input_is_ignored() {
        let (d, _) = deps(Arc::new(MockService::mirror()));
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        assert!(matches!(chat.send_text("   ").unwrap(), SendOutcome::Ignored));
        assert!(chat.messages().is_empty());
    }

    #[tokio::test]
    async fn reply_streams_into_one_message() {
        let svc = Arc::new(MockService::mirror().with_delay(Duration::ZERO));
        let (d, _) = deps(svc.clone());
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        let SendOutcome::Dispatched(ticket) = chat.send_text("je suis là").unwrap() else {
            panic!("expected dispatch");
        };
        ticket.finished().await;
        let msgs = chat.messages();
        assert_eq!(msgs.len(), 2);
        assert!(msgs[1].text.contains("je suis là"));
        assert_eq!(chat.phase(), SessionPhase::Idle);
        assert!(svc.requests()[0].system_instruction.contains("Lou"));
    }

    #[tokio::test]
    async fn later_messages_carry_the_earlier_exchange() {
        let svc = Arc::new(MockService::mirror().with_delay(Duration::ZERO));
        let (d, _) = deps(svc.clone());
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        for text in ["premier", "second"] {
            let SendOutcome::Dispatched(ticket) = chat.send_text(text).unwrap() else {
                panic!("expected dispatch");
            };
            ticket.finished().await;
        }
        let requests = svc.requests();
        assert!(requests[0].history.is_empty());
        assert_eq!(requests[1].history.len(), 2);
        assert_eq!(requests[1].history[0].parts[0].text.as_deref(), Some("premier"));
    }

    #[tokio::test]
    async fn connect_failure_appends_friendly_error() {
        let svc = Arc::new(MockService::scripted([MockReply::ConnectError("dns".into())]));
        let (d, _) = deps(svc);
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        let SendOutcome::Dispatched(ticket) = chat.send_text("allo").unwrap() else {
            panic!("expected dispatch");
        };
        ticket.finished().await;
        let last = chat.messages().pop().unwrap();
        assert!(last.is_error);
        assert_eq!(last.text, CONNECTION_ERROR_MESSAGE);
        assert_eq!(chat.phase(), SessionPhase::Idle);
    }

    #[tokio::test]
    async fn crisis_never_reaches_the_service() {
        let svc = Arc::new(MockService::mirror());
        let (d, dialer) = deps(svc.clone());
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        assert!(matches!(chat.send_text("je veux mourir").unwrap(), SendOutcome::CrisisLocked));
        assert_eq!(svc.request_count(), 0);
        assert_eq!(dialer.dialed(), vec!["3114".to_string()]);
        assert!(matches!(chat.send_text("bonjour"), Err(CoreError::SessionLocked)));
        assert!(matches!(chat.send_text("sos"), Err(CoreError::SessionLocked)));
        assert_eq!(dialer.dialed().len(), 1);
    }

    #[tokio::test]
    async fn crisis_on_a_clone_stops_a_queued_request() {
        let svc = Arc::new(MockService::mirror().with_delay(Duration::ZERO));
        let (d, dialer) = deps(svc.clone());
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        let other = chat.clone();
        // the pump is spawned but has not run yet on this runtime
        let SendOutcome::Dispatched(ticket) = chat.send_text("bonjour").unwrap() else {
            panic!("expected dispatch");
        };
        assert!(matches!(other.send_text("je veux mourir").unwrap(), SendOutcome::CrisisLocked));
        ticket.finished().await;
        assert_eq!(svc.request_count(), 0);
        assert_eq!(dialer.dialed().len(), 1);
        assert_eq!(chat.phase(), SessionPhase::CrisisLocked);
    }

    #[tokio::test]
    async fn pump_does_not_send_once_the_conversation_is_locked() {
        let svc = Arc::new(MockService::mirror().with_delay(Duration::ZERO));
        let (d, _) = deps(svc.clone());
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        // exchange begun, but no pump token armed yet when the crisis lands
        let epoch = chat.shared.conv().begin_exchange(Message::user("bonjour")).unwrap();
        assert!(matches!(chat.send_text("je veux mourir").unwrap(), SendOutcome::CrisisLocked));
        chat.shared
            .pump(UserInput::text("bonjour"), epoch, CancellationToken::new(), CONNECTION_ERROR_MESSAGE)
            .await;
        assert_eq!(svc.request_count(), 0);
        assert!(chat.is_locked());
    }

    #[tokio::test]
    async fn privacy_question_is_answered_locally_after_five_messages() {
        let svc = Arc::new(MockService::mirror().with_delay(Duration::ZERO));
        let (d, _) = deps(svc.clone());
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        assert!(matches!(chat.send_text("c'est anonyme ?").unwrap(), SendOutcome::Dispatched(_)));
        // wait for the first reply before sending the next
        for text in ["un", "deux"] {
            while chat.phase() != SessionPhase::Idle {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = chat.send_text(text).unwrap();
        }
        while chat.phase() != SessionPhase::Idle {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(chat.messages().len(), 6);
        assert!(matches!(chat.send_text("c'est anonyme ?").unwrap(), SendOutcome::Reassured));
        assert_eq!(svc.request_count(), 3);
        assert_eq!(chat.messages().last().map(|m| m.text.as_str()), Some(PRIVACY_REASSURANCE));
    }

    #[tokio::test]
    async fn voice_note_goes_through_recording() {
        let svc = Arc::new(MockService::mirror().with_delay(Duration::ZERO));
        let (d, _) = deps(svc.clone());
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        assert!(chat.send_voice_note(vec![1], "audio/wav").is_err());
        chat.begin_recording().unwrap();
        assert!(matches!(chat.send_text("coucou"), Err(CoreError::SessionBusy(_))));
        let SendOutcome::Dispatched(ticket) = chat.send_voice_note(vec![1, 2], "audio/wav").unwrap() else {
            panic!("expected dispatch");
        };
        ticket.finished().await;
        assert_eq!(chat.messages()[0].text, VOICE_NOTE_PLACEHOLDER);
        assert!(svc.requests()[0].input.parts[0].inline_data.is_some());
    }

    #[tokio::test]
    async fn closed_surface_refuses_input() {
        let (d, _) = deps(Arc::new(MockService::mirror()));
        let chat = ChatSurface::open(d, CancellationToken::new()).unwrap();
        chat.close();
        chat.close();
        assert!(matches!(chat.send_text("hello"), Err(CoreError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn open_requires_complete_profile() {
        let store = ProfileStore::temporary().unwrap();
        store.save_profile(&UserProfile::prefilled("Lou")).unwrap();
        let d = ChatDeps::new(
            Arc::new(MockService::mirror()),
            store,
            EmergencyProtocol::new(Arc::new(LogDialer::new())),
        );
        assert!(matches!(
            ChatSurface::open(d, CancellationToken::new()),
            Err(CoreError::InvalidProfile(_))
        ));
    }
}
