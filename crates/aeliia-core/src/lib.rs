//! aeliia-core: conversational safety and session gating for the AELIIA companion.
//!
//! Crisis keyword detection and emergency dialing, the two-scope profile store, the
//! streaming chat pipeline, and the gated controller that decides when chat or voice may
//! start.

pub mod chat;
pub mod config;
pub mod controller;
pub mod conversation;
mod error;
pub mod generation;
pub mod pipeline;
pub mod prompts;
pub mod safety;
mod shared;
pub mod store;

// Errors
pub use error::{CoreError, CoreResult};

// Data model
pub use shared::{
    Message, Role, SurfaceKind, User, UserProfile, CHAT_HISTORY_KEY, COOKIE_CONSENT_KEY, PROFILE_KEY,
    USER_KEY,
};

// Configuration
pub use config::{env_bool, env_opt_string, CoreConfig};

// Safety
pub use safety::{detect, CrisisDetector, Dialer, EmergencyProtocol, LogDialer, SystemDialer};

// Store
pub use store::{ProfileStore, StoreScope};

// Generation + streaming pipeline
pub use generation::{
    Citation, Content, GeminiService, GenerationEvent, GenerationService, MockReply, MockService, Part,
    TurnRequest,
};
pub use pipeline::{format_sources, ChatSession, ChunkKind, ChunkStream, StreamingPipeline, TextChunk, UserInput};

// Session state + gating + chat surface
pub use chat::{ChatDeps, ChatSurface, ChatUpdate, SendOutcome, StreamTicket};
pub use controller::{GateState, GatedActionController};
pub use conversation::{ConversationSession, SessionPhase};

/// Cancellation primitive shared by the controller and every surface.
pub use tokio_util::sync::CancellationToken;
