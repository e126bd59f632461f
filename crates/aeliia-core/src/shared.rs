//! Shared data model: user identity, demographic profile, conversation messages.
//!
//! Field names serialize in camelCase so records stored by earlier web clients
//! (`isPremium`, `isError`) load without migration.

use serde::{Deserialize, Serialize};

/// Durable key for the signed-in [`User`].
pub const USER_KEY: &str = "aeliia_user";
/// Session key for the [`UserProfile`].
pub const PROFILE_KEY: &str = "aeliia_user_profile";
/// Durable key for premium conversation history.
pub const CHAT_HISTORY_KEY: &str = "aeliia_chat_history";
/// Durable key for the cookie-consent flag.
pub const COOKIE_CONSENT_KEY: &str = "aeliia_cookie_consent";

/// Identity record created at sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub is_premium: bool,
}

impl User {
    /// New free-tier user.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            is_premium: false,
        }
    }

    /// Simulated sign-in from an email address: the local part becomes the display name.
    pub fn from_email(email: &str) -> Self {
        let local = email.split('@').next().unwrap_or_default().trim();
        let name = if local.is_empty() { "Utilisateur" } else { local };
        Self::new(name, email.trim())
    }
}

/// Demographic context used to personalise the system instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub name: String,
    pub age: String,
    pub gender: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<String>,
}

impl UserProfile {
    pub fn new(name: impl Into<String>, age: impl Into<String>, gender: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            age: age.into(),
            gender: gender.into(),
            mood: None,
        }
    }

    /// Partial profile stored at sign-in: name only, so onboarding still gates.
    pub fn prefilled(name: impl Into<String>) -> Self {
        Self::new(name, "", "")
    }

    pub fn with_mood(mut self, mood: impl Into<String>) -> Self {
        self.mood = Some(mood.into());
        self
    }

    /// Age and gender are both present. Required before chat or voice activates.
    pub fn is_complete(&self) -> bool {
        !self.age.trim().is_empty() && !self.gender.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            is_error: false,
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            is_error: false,
        }
    }

    /// Model-role message flagged as an error (transport failure, crisis notice).
    pub fn model_error(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
            is_error: true,
        }
    }
}

/// Which surface the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceKind {
    Chat,
    Voice,
}

impl SurfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurfaceKind::Chat => "chat",
            SurfaceKind::Voice => "voice",
        }
    }
}

impl std::fmt::Display for SurfaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
