//! Prompt templates and fixed user-facing messages.

pub mod system;

pub use system::{
    build_system_instruction, build_voice_instruction, SYSTEM_POLICY_TEMPLATE, VOICE_ADDENDUM,
};

/// Model-role notice appended when a chat surface locks on a crisis signal.
pub const FOCUS_MODE_MESSAGE: &str = "🚨 **MODE FOCUS ACTIVÉ**\n\nJe détecte une situation de détresse importante. Je suspends la conversation pour prioriser votre sécurité.\n\nVous n'êtes pas seul(e).";

/// Local answer to privacy questions in an established conversation.
pub const PRIVACY_REASSURANCE: &str = "🔒 **Sécurité et Confidentialité**\n\nSoyez rassuré(e) : nos échanges sont entièrement chiffrés et anonymes.";

/// Appended to the partial model reply when the stream breaks.
pub const TRANSPORT_ERROR_MARKER: &str = "\n[Connexion interrompue]";

/// Heading of the grounding citations block.
pub const SOURCES_HEADING: &str = "\n\n**Sources vérifiées :**\n";

pub const CONNECTION_ERROR_MESSAGE: &str = "Désolé, une erreur est survenue lors de la connexion.";
pub const VOICE_NOTE_ERROR_MESSAGE: &str = "Désolé, je n'ai pas pu traiter votre message audio.";
pub const MICROPHONE_ERROR_MESSAGE: &str = "Impossible d'activer le microphone.";
pub const LIVE_START_ERROR_MESSAGE: &str =
    "Impossible de démarrer le mode vocal. Vérifiez votre micro et votre connexion.";
pub const LIVE_INTERRUPTED_MESSAGE: &str =
    "La connexion a été interrompue. Veuillez rafraîchir ou réessayer.";

/// User-role placeholder shown for a voice note.
pub const VOICE_NOTE_PLACEHOLDER: &str = "🎤 Message vocal envoyé...";
/// Text part sent alongside the inline audio of a voice note.
pub const VOICE_NOTE_CAPTION: &str = "L'utilisateur a envoyé un message vocal.";
