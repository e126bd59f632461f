//! Runtime configuration.
//!
//! | Key (file / `AELIIA__*` env) | Default | Description |
//! |------------------------------|---------|-------------|
//! | storage_path | ./data | Directory of the durable sled store |
//! | llm_mode | gemini | `gemini` or `mock` |
//! | api_key | (none) | Falls back to `GEMINI_API_KEY`, then `API_KEY` |
//! | api_base | https://generativelanguage.googleapis.com/v1beta | REST base URL |
//! | chat_model | gemini-3-flash-preview | Text chat model |
//! | voice_model | gemini-2.5-flash-native-audio-preview-09-2025 | Live audio model |
//! | live_url | wss://generativelanguage.googleapis.com/ws/...BidiGenerateContent | Live duplex endpoint |
//! | voice_name | Zephyr | Prebuilt output voice |
//! | grounding_enabled | true | Attach the web search tool to chat requests |
//! | request_timeout_secs | 60 | HTTP timeout for chat requests |
//! | emergency_number | 3114 | Number dialed by the emergency trigger |
//! | secondary_emergency_number | 15 | Shown alongside the crisis notice |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_CONFIG_PATH: &str = "config/aeliia.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    pub storage_path: String,
    pub llm_mode: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub api_base: String,
    pub chat_model: String,
    pub voice_model: String,
    pub live_url: String,
    pub voice_name: String,
    pub grounding_enabled: bool,
    pub request_timeout_secs: u64,
    pub emergency_number: String,
    pub secondary_emergency_number: String,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_path: "./data".to_string(),
            llm_mode: "gemini".to_string(),
            api_key: None,
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            chat_model: "gemini-3-flash-preview".to_string(),
            voice_model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            live_url: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            voice_name: "Zephyr".to_string(),
            grounding_enabled: true,
            request_timeout_secs: 60,
            emergency_number: "3114".to_string(),
            secondary_emergency_number: "15".to_string(),
        }
    }
}

impl CoreConfig {
    /// Load config from file and environment. Precedence: `AELIIA__*` env > file at
    /// `AELIIA_CONFIG` (or `config/aeliia.toml`) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("AELIIA_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let d = Self::default();
        let builder = config::Config::builder()
            .set_default("storage_path", d.storage_path)?
            .set_default("llm_mode", d.llm_mode)?
            .set_default("api_base", d.api_base)?
            .set_default("chat_model", d.chat_model)?
            .set_default("voice_model", d.voice_model)?
            .set_default("live_url", d.live_url)?
            .set_default("voice_name", d.voice_name)?
            .set_default("grounding_enabled", d.grounding_enabled)?
            .set_default("request_timeout_secs", d.request_timeout_secs as i64)?
            .set_default("emergency_number", d.emergency_number)?
            .set_default("secondary_emergency_number", d.secondary_emergency_number)?;

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("AELIIA").separator("__"))
            .build()?;

        let mut cfg: CoreConfig = built.try_deserialize()?;
        if cfg.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
            cfg.api_key = env_opt_string("GEMINI_API_KEY").or_else(|| env_opt_string("API_KEY"));
        }
        Ok(cfg)
    }

    /// The API credential, or a configuration error naming the missing setting.
    pub fn require_api_key(&self) -> CoreResult<&str> {
        match self.api_key.as_deref().map(str::trim) {
            Some(k) if !k.is_empty() => Ok(k),
            _ => Err(CoreError::Configuration(
                "API key missing (set AELIIA__API_KEY or GEMINI_API_KEY)".to_string(),
            )),
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.require_api_key().is_ok()
    }

    pub fn is_mock(&self) -> bool {
        self.llm_mode.eq_ignore_ascii_case("mock")
    }

    pub fn storage_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage_path)
    }

    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Non-empty trimmed environment value.
pub fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Boolean environment toggle: 1/true/yes/on are true, 0/false/no/off are false, anything else is `default`.
pub fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().as_deref().map(str::trim) {
        Some(v) if matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on") => true,
        Some(v) if matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}
