//! Error types for the AELIIA core.
//!
//! A detected crisis is deliberately absent from this enum: it is a forced-termination
//! signal carried by [`crate::chat::SendOutcome::CrisisLocked`], not a failure.

use thiserror::Error;

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the session, store and streaming layers
#[derive(Error, Debug)]
pub enum CoreError {
    /// Required credential or setting missing. Fatal to the requested action, never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Microphone or dial capability unavailable or denied. The action stays retryable.
    #[error("Capability unavailable: {0}")]
    Capability(String),

    /// Remote connection or stream failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage backend failure (not malformed data, which is recovered silently).
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Incomplete profile: {0}")]
    InvalidProfile(String),

    /// A send was attempted while another exchange is in flight or a recording is open.
    #[error("Session busy: {0}")]
    SessionBusy(&'static str),

    /// The surface is crisis-locked; it must be closed and reopened.
    #[error("Session locked after a crisis signal")]
    SessionLocked,

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

impl From<sled::Error> for CoreError {
    fn from(err: sled::Error) -> Self {
        CoreError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Persistence(err.to_string())
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        CoreError::Transport(err.to_string())
    }
}

impl From<config::ConfigError> for CoreError {
    fn from(err: config::ConfigError) -> Self {
        CoreError::Configuration(err.to_string())
    }
}

impl CoreError {
    /// True for errors the user can fix by simply trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Capability(_) | CoreError::Transport(_) | CoreError::SessionBusy(_)
        )
    }
}
