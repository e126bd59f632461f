//! Terminal host: routes commands through the gated controller and renders the
//! chat surface and the live voice session.

use std::io::Write as _;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use aeliia_core::prompts::{LIVE_START_ERROR_MESSAGE, MICROPHONE_ERROR_MESSAGE};
use aeliia_core::{
    ChatDeps, ChatSurface, ChatUpdate, ChunkKind, CoreConfig, CoreError, EmergencyProtocol, GateState,
    GatedActionController, GenerationService, ProfileStore, Role, SendOutcome, SessionPhase, SurfaceKind, User,
    UserProfile,
};
use aeliia_voice::{
    CpalCapture, GeminiLiveConnector, Microphone, RodioPlayback, Recording, VoiceContext, VoiceDeps,
    VoiceDuplexSession, VoiceEvent, VoiceNoteRecorder, VOICE_NOTE_MIME_TYPE,
};

pub const HELP: &str = "\
Commandes :
  /login <email> [nom]        se connecter
  /pay                        passer en premium
  /profile <âge> <genre> [humeur]
  /chat [message]             ouvrir le chat
  /voice                      ouvrir la voix en direct (premium)
  /record, /send, /discard    message vocal dans le chat
  /clear                      effacer l'historique
  /close                      fermer la surface active
  /dismiss                    lever le mode focus (fausse alerte)
  /consent                    accepter les cookies
  /cancel                     abandonner l'étape en cours
  /logout, /quit";

/// Something a surface produced while the host was waiting for input.
pub enum Signal {
    Chat(Option<ChatUpdate>),
    Voice(Option<VoiceEvent>),
}

pub struct Companion {
    config: CoreConfig,
    controller: GatedActionController,
    chat_deps: ChatDeps,
    emergency: EmergencyProtocol,
    microphone: Microphone,
    recorder: VoiceNoteRecorder,
    chat: Option<ChatSurface>,
    chat_updates: Option<broadcast::Receiver<ChatUpdate>>,
    live: Option<VoiceDuplexSession>,
    recording: Option<Recording>,
}

impl Companion {
    pub fn new(
        config: CoreConfig,
        store: ProfileStore,
        service: Arc<dyn GenerationService>,
        emergency: EmergencyProtocol,
    ) -> Self {
        let credential = config.has_api_key() || config.is_mock();
        let controller = GatedActionController::with_credential(store.clone(), credential);
        let microphone = Microphone::new();
        let recorder = VoiceNoteRecorder::new(microphone.clone(), Arc::new(CpalCapture));
        Self {
            chat_deps: ChatDeps::new(service, store, emergency.clone()),
            config,
            controller,
            emergency,
            microphone,
            recorder,
            chat: None,
            chat_updates: None,
            live: None,
            recording: None,
        }
    }

    pub fn greet(&self) {
        match self.controller.user() {
            Some(user) => println!("Bonjour {}. Tapez /chat pour commencer, /help pour l'aide.", user.name),
            None => println!("Bienvenue sur AELIIA. Tapez /chat pour commencer, /help pour l'aide."),
        }
        if !self.controller.store().cookie_consent() {
            println!("Ce service utilise un stockage local. Tapez /consent pour accepter.");
        }
    }

    /// Wait for the next chat update or voice event. Pending forever when nothing is open.
    pub async fn next_signal(&mut self) -> Signal {
        let Self { chat_updates, live, .. } = self;
        let chat = async {
            match chat_updates.as_mut() {
                Some(rx) => loop {
                    match rx.recv().await {
                        Ok(update) => break Some(update),
                        Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "chat renderer lagged"),
                        Err(RecvError::Closed) => break None,
                    }
                },
                None => std::future::pending().await,
            }
        };
        let voice = async {
            match live.as_mut() {
                Some(session) => session.next_event().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            update = chat => Signal::Chat(update),
            event = voice => Signal::Voice(event),
        }
    }

    pub async fn on_signal(&mut self, signal: Signal) {
        match signal {
            Signal::Chat(Some(update)) => self.on_chat_update(update),
            Signal::Chat(None) => self.chat_updates = None,
            Signal::Voice(Some(event)) => self.on_voice_event(event).await,
            Signal::Voice(None) => self.live = None,
        }
    }

    /// Returns `false` when the user asked to quit.
    pub async fn handle_line(&mut self, line: &str) -> bool {
        let line = line.trim();
        if line.is_empty() {
            return true;
        }
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };
        let result = match command {
            "/quit" | "/exit" => return false,
            "/help" => {
                println!("{HELP}");
                Ok(())
            }
            "/login" => self.login(rest).await,
            "/pay" => match self.controller.complete_payment() {
                Ok(state) => {
                    self.apply(state).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            "/profile" => self.onboard(rest).await,
            "/cancel" => {
                let state = self.controller.cancel_gate();
                self.announce(state);
                Ok(())
            }
            "/chat" => {
                if let Some(mut session) = self.live.take() {
                    session.close().await;
                }
                self.open_chat(rest)
            }
            "/voice" => self.request_voice().await,
            "/record" => self.start_recording(),
            "/send" => self.send_recording(),
            "/discard" => {
                self.discard_recording();
                Ok(())
            }
            "/clear" => match &self.chat {
                Some(chat) => chat.clear_history().await,
                None => self.controller.store().clear_history(),
            },
            "/close" => {
                self.close_surfaces().await;
                let state = self.controller.close();
                self.announce(state);
                Ok(())
            }
            "/dismiss" => match self.controller.dismiss_crisis() {
                Ok(_) => {
                    self.close_surfaces().await;
                    println!("Mode focus levé. Tapez /chat pour reprendre.");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            "/consent" => self.controller.store().record_cookie_consent(),
            "/logout" => {
                self.close_surfaces().await;
                match self.controller.logout() {
                    Ok(_) => {
                        println!("Déconnecté. Vos données locales ont été effacées.");
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            _ if command.starts_with('/') => {
                println!("Commande inconnue. Tapez /help.");
                Ok(())
            }
            _ => self.send_text(line),
        };
        if let Err(e) = result {
            self.report_error(e);
        }
        true
    }

    async fn login(&mut self, rest: &str) -> Result<(), CoreError> {
        let mut words = rest.split_whitespace();
        let Some(email) = words.next() else {
            println!("Usage : /login <email> [nom]");
            return Ok(());
        };
        let name: Vec<&str> = words.collect();
        let user = if name.is_empty() {
            User::from_email(email)
        } else {
            User::new(name.join(" "), email)
        };
        let state = self.controller.complete_auth(user)?;
        self.apply(state).await;
        Ok(())
    }

    async fn onboard(&mut self, rest: &str) -> Result<(), CoreError> {
        let mut words = rest.split_whitespace();
        let (Some(age), Some(gender)) = (words.next(), words.next()) else {
            println!("Usage : /profile <âge> <genre> [humeur]");
            return Ok(());
        };
        let name = self
            .controller
            .profile()
            .map(|p| p.name)
            .filter(|n| !n.is_empty())
            .or_else(|| self.controller.user().map(|u| u.name))
            .unwrap_or_default();
        let mood: Vec<&str> = words.collect();
        let mut profile = UserProfile::new(name, age, gender);
        if !mood.is_empty() {
            profile = profile.with_mood(mood.join(" "));
        }
        let state = self.controller.submit_onboarding(profile)?;
        println!("Profil enregistré.");
        self.apply(state).await;
        Ok(())
    }

    fn open_chat(&mut self, initial: &str) -> Result<(), CoreError> {
        if self.chat.as_ref().is_some_and(|c| !c.is_locked()) {
            return if initial.is_empty() { Ok(()) } else { self.send_text(initial) };
        }
        let state = self.controller.request(SurfaceKind::Chat)?;
        if state == GateState::ChatActive {
            let initial = (!initial.is_empty()).then_some(initial);
            self.ensure_chat(initial)
        } else {
            self.announce(state);
            Ok(())
        }
    }

    fn ensure_chat(&mut self, initial: Option<&str>) -> Result<(), CoreError> {
        if let Some(old) = self.chat.take() {
            old.close();
        }
        let (chat, outcome) =
            ChatSurface::open_with_initial(self.chat_deps.clone(), self.controller.activation_token(), initial)?;
        self.chat_updates = Some(chat.subscribe());
        for message in chat.messages() {
            render_message(&message.role, &message.text);
        }
        self.chat = Some(chat);
        if let Some(outcome) = outcome {
            self.on_send_outcome(outcome);
        }
        println!("(chat ouvert)");
        Ok(())
    }

    async fn request_voice(&mut self) -> Result<(), CoreError> {
        if self.live.is_some() {
            return Ok(());
        }
        let state = self.controller.request(SurfaceKind::Voice)?;
        if let Some(chat) = self.chat.take() {
            chat.close();
            self.chat_updates = None;
        }
        self.apply(state).await;
        Ok(())
    }

    async fn apply(&mut self, state: GateState) {
        match state {
            GateState::VoiceActive if self.live.is_none() => self.open_voice().await,
            GateState::ChatActive if self.chat.is_none() => {
                if let Err(e) = self.ensure_chat(None) {
                    self.report_error(e);
                }
            }
            other => self.announce(other),
        }
    }

    async fn open_voice(&mut self) {
        self.discard_recording();
        let connector = match GeminiLiveConnector::from_config(&self.config) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "live voice unavailable");
                println!("{LIVE_START_ERROR_MESSAGE}");
                self.controller.close();
                return;
            }
        };
        let sink = match RodioPlayback::new() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "no audio output");
                println!("{LIVE_START_ERROR_MESSAGE}");
                self.controller.close();
                return;
            }
        };
        let deps = VoiceDeps::new(
            Arc::new(connector),
            Arc::new(CpalCapture),
            Arc::new(sink),
            self.microphone.clone(),
            self.emergency.clone(),
        );
        let context = VoiceContext::from_config(&self.config, self.controller.profile(), self.controller.activation_token());
        match VoiceDuplexSession::open(context, deps).await {
            Ok(session) => {
                println!("🎙️ Voix en direct. Parlez librement ; /close pour terminer.");
                self.live = Some(session);
            }
            Err(e) => {
                tracing::warn!(error = %e, "live voice failed to start");
                println!("{LIVE_START_ERROR_MESSAGE}");
                self.controller.close();
            }
        }
    }

    fn send_text(&mut self, text: &str) -> Result<(), CoreError> {
        let Some(chat) = &self.chat else {
            println!("Aucun chat ouvert. Tapez /chat.");
            return Ok(());
        };
        let outcome = chat.send_text(text)?;
        self.on_send_outcome(outcome);
        Ok(())
    }

    fn on_send_outcome(&mut self, outcome: SendOutcome) {
        match outcome {
            SendOutcome::CrisisLocked => self.enter_crisis(),
            SendOutcome::Ignored | SendOutcome::Reassured | SendOutcome::Dispatched(_) => {}
        }
    }

    fn start_recording(&mut self) -> Result<(), CoreError> {
        let Some(chat) = &self.chat else {
            println!("Aucun chat ouvert. Tapez /chat.");
            return Ok(());
        };
        chat.begin_recording()?;
        match self.recorder.start() {
            Ok(recording) => {
                self.recording = Some(recording);
                println!("⏺️ Enregistrement... /send pour envoyer.");
            }
            Err(e) => {
                tracing::warn!(error = %e, "voice note capture failed");
                chat.cancel_recording();
                println!("{MICROPHONE_ERROR_MESSAGE}");
            }
        }
        Ok(())
    }

    fn send_recording(&mut self) -> Result<(), CoreError> {
        let (Some(chat), Some(recording)) = (&self.chat, self.recording.take()) else {
            println!("Aucun enregistrement en cours.");
            return Ok(());
        };
        let outcome = chat.send_voice_note(recording.finish(), VOICE_NOTE_MIME_TYPE)?;
        self.on_send_outcome(outcome);
        Ok(())
    }

    fn discard_recording(&mut self) {
        if let Some(recording) = self.recording.take() {
            recording.cancel();
            if let Some(chat) = &self.chat {
                chat.cancel_recording();
            }
        }
    }

    fn on_chat_update(&mut self, update: ChatUpdate) {
        match update {
            ChatUpdate::Appended(message) if message.role == Role::User => {}
            ChatUpdate::Appended(message) => render_message(&message.role, &message.text),
            ChatUpdate::Fragment(chunk) => {
                if chunk.kind == ChunkKind::Error {
                    tracing::debug!("reply ended with a transport error");
                }
                print!("{}", chunk.text);
                let _ = std::io::stdout().flush();
            }
            ChatUpdate::Phase(SessionPhase::Loading) => print!("AELIIA : "),
            ChatUpdate::Phase(SessionPhase::Idle) => println!(),
            ChatUpdate::Phase(_) => {}
            ChatUpdate::Crisis => self.enter_crisis(),
            ChatUpdate::Cleared => println!("(historique effacé)"),
            ChatUpdate::Closed => {
                self.chat_updates = None;
            }
        }
    }

    async fn on_voice_event(&mut self, event: VoiceEvent) {
        match event {
            VoiceEvent::Connected => tracing::info!("live voice connected"),
            VoiceEvent::Transcription(text) => println!("vous (voix) : {text}"),
            VoiceEvent::Interrupted => tracing::debug!("playback interrupted"),
            VoiceEvent::TurnComplete => {}
            VoiceEvent::Crisis { .. } => self.enter_crisis(),
            VoiceEvent::Error(message) => println!("{message}"),
            VoiceEvent::Closed(reason) => {
                tracing::info!(?reason, "live voice ended");
                if let Some(mut session) = self.live.take() {
                    session.close().await;
                }
                let state = self.controller.close();
                if state != GateState::CrisisLocked {
                    println!("(voix terminée)");
                }
            }
        }
    }

    fn enter_crisis(&mut self) {
        if let Err(e) = self.controller.report_crisis() {
            tracing::debug!(error = %e, "crisis outside an active surface");
        }
        println!();
        println!("🚨 MODE FOCUS ACTIVÉ");
        println!(
            "Appel du {} en cours. Si besoin, composez aussi le {}.",
            self.emergency.number(),
            self.emergency.secondary_number()
        );
        println!("Vous n'êtes pas seul(e). /dismiss s'il s'agit d'une erreur.");
    }

    async fn close_surfaces(&mut self) {
        self.discard_recording();
        if let Some(chat) = self.chat.take() {
            chat.close();
        }
        self.chat_updates = None;
        if let Some(mut session) = self.live.take() {
            session.close().await;
        }
    }

    pub async fn shutdown(&mut self) {
        self.close_surfaces().await;
        self.controller.close();
        if let Err(e) = self.controller.store().flush() {
            tracing::warn!(error = %e, "store flush failed");
        }
    }

    fn announce(&self, state: GateState) {
        match state {
            GateState::AwaitingAuth => println!("Connectez-vous d'abord : /login <email> [nom]"),
            GateState::AwaitingPayment => println!("La voix en direct est réservée aux membres premium : /pay"),
            GateState::AwaitingOnboarding => println!("Dites-m'en un peu plus : /profile <âge> <genre> [humeur]"),
            GateState::CrisisLocked => println!("Mode focus actif. /dismiss pour lever l'alerte."),
            GateState::Idle | GateState::ChatActive | GateState::VoiceActive => {
                tracing::debug!(?state, "gate state")
            }
        }
    }

    fn report_error(&self, err: CoreError) {
        tracing::warn!(error = %err, "command failed");
        match err {
            CoreError::SessionLocked => println!("Conversation suspendue (mode focus)."),
            CoreError::InvalidProfile(m) => println!("Profil incomplet : {m}"),
            other => println!("Erreur : {other}"),
        }
    }
}

fn render_message(role: &Role, text: &str) {
    match role {
        Role::User => println!("vous : {text}"),
        Role::Model => println!("AELIIA : {text}"),
    }
}
