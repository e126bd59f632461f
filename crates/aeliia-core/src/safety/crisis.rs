//! Keyword crisis detector.
//!
//! A plain substring heuristic over normalised text: lowercase, Unicode NFD, combining marks
//! (U+0300..=U+036F) removed. There are no word boundaries, so `sos` also matches inside
//! longer words. The keyword list is policy; change it with [`CrisisDetector::with_keywords`].

use unicode_normalization::UnicodeNormalization;

/// Default crisis keywords (French). Normalised at construction, so accented forms are fine.
pub const CRISIS_KEYWORDS: &[&str] = &[
    "suicide",
    "suicid",
    "me tuer",
    "finir avec la vie",
    "pendre",
    "overdose",
    "mourir",
    "scarifier",
    "plus envie de vivre",
    "adieu monde",
    "sauter du pont",
    "sauter par la fenetre",
    "mutiler",
    "tuer quelqu",
    "me faire du mal",
    "je vais craquer",
    "appel au secours",
    "sos",
    "danger",
    "urgence",
    "détresse",
];

/// Lowercase, decompose and drop combining diacritical marks.
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .nfd()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .collect()
}

#[derive(Debug, Clone)]
pub struct CrisisDetector {
    /// (original keyword, normalised form)
    keywords: Vec<(String, String)>,
}

impl Default for CrisisDetector {
    fn default() -> Self {
        Self::with_keywords(CRISIS_KEYWORDS.iter().copied())
    }
}

impl CrisisDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Detector over a custom keyword set. Blank keywords are ignored.
    pub fn with_keywords<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keywords = keywords
            .into_iter()
            .filter_map(|k| {
                let k = k.as_ref().trim();
                let n = normalize(k);
                (!n.is_empty()).then(|| (k.to_string(), n))
            })
            .collect();
        Self { keywords }
    }

    pub fn detect(&self, text: &str) -> bool {
        self.matched_keyword(text).is_some()
    }

    /// First keyword (in list order) found in `text`.
    pub fn matched_keyword(&self, text: &str) -> Option<&str> {
        if text.is_empty() {
            return None;
        }
        let haystack = normalize(text);
        self.keywords
            .iter()
            .find(|(_, n)| haystack.contains(n.as_str()))
            .map(|(k, _)| k.as_str())
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(|(k, _)| k.as_str())
    }
}

/// [`CrisisDetector::detect`] with the default keyword list.
pub fn detect(text: &str) -> bool {
    CrisisDetector::default().detect(text)
}
