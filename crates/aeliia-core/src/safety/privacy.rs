//! Local privacy reassurance for established conversations.

use super::crisis::normalize;

pub const PRIVACY_KEYWORDS: &[&str] = &[
    "privé",
    "confidentialité",
    "sécurité",
    "anonymat",
    "anonyme",
    "données",
    "espion",
    "enregistré",
    "lu par qui",
];

/// Minimum conversation length before the reassurance replaces a model turn.
pub const PRIVACY_MIN_MESSAGES: usize = 5;

pub fn mentions_privacy(text: &str) -> bool {
    let haystack = normalize(text);
    PRIVACY_KEYWORDS
        .iter()
        .any(|k| haystack.contains(normalize(k).as_str()))
}

/// True when `text` should be answered with the local reassurance instead of a model request.
pub fn wants_reassurance(text: &str, message_count: usize) -> bool {
    message_count >= PRIVACY_MIN_MESSAGES && mentions_privacy(text)
}
