//! Emergency protocol trigger: dial the crisis hotline through a [`Dialer`] capability.
//!
//! Dialing is best effort. A failure is logged and swallowed so the crisis path that
//! called [`EmergencyProtocol::trigger`] always proceeds to lock the surface.

use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CoreError, CoreResult};

/// National suicide prevention line (France).
pub const DEFAULT_EMERGENCY_NUMBER: &str = "3114";
/// SAMU.
pub const DEFAULT_SECONDARY_NUMBER: &str = "15";

/// Something that can place (or hand off) a phone call.
pub trait Dialer: Send + Sync {
    fn dial(&self, number: &str) -> CoreResult<()>;
}

/// Hands a `tel:` URI to the platform opener (`xdg-open`, `open`, or `start`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDialer;

impl Dialer for SystemDialer {
    fn dial(&self, number: &str) -> CoreResult<()> {
        let uri = format!("tel:{number}");
        let mut cmd = match std::env::consts::OS {
            "windows" => {
                let mut c = Command::new("cmd");
                c.args(["/C", "start", "", &uri]);
                c
            }
            "macos" => {
                let mut c = Command::new("open");
                c.arg(&uri);
                c
            }
            _ => {
                let mut c = Command::new("xdg-open");
                c.arg(&uri);
                c
            }
        };
        cmd.stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
            .map_err(|e| CoreError::Capability(format!("cannot open {uri}: {e}")))
    }
}

/// Records dial intents without doing anything. Used headless and in tests.
#[derive(Debug, Default, Clone)]
pub struct LogDialer {
    dialed: Arc<Mutex<Vec<String>>>,
}

impl LogDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().map(|v| v.clone()).unwrap_or_default()
    }
}

impl Dialer for LogDialer {
    fn dial(&self, number: &str) -> CoreResult<()> {
        tracing::info!(number, "emergency dial requested (log only)");
        if let Ok(mut v) = self.dialed.lock() {
            v.push(number.to_string());
        }
        Ok(())
    }
}

/// Cloneable handle shared by every surface of one process.
#[derive(Clone)]
pub struct EmergencyProtocol {
    dialer: Arc<dyn Dialer>,
    number: String,
    secondary_number: String,
    triggers: Arc<AtomicU64>,
}

impl std::fmt::Debug for EmergencyProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmergencyProtocol")
            .field("number", &self.number)
            .field("secondary_number", &self.secondary_number)
            .field("triggers", &self.trigger_count())
            .finish()
    }
}

impl EmergencyProtocol {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            number: DEFAULT_EMERGENCY_NUMBER.to_string(),
            secondary_number: DEFAULT_SECONDARY_NUMBER.to_string(),
            triggers: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_numbers(mut self, number: impl Into<String>, secondary: impl Into<String>) -> Self {
        self.number = number.into();
        self.secondary_number = secondary.into();
        self
    }

    pub fn from_config(dialer: Arc<dyn Dialer>, cfg: &crate::config::CoreConfig) -> Self {
        Self::new(dialer).with_numbers(&cfg.emergency_number, &cfg.secondary_emergency_number)
    }

    /// Dial the hotline. Never fails; safe to call repeatedly.
    pub fn trigger(&self) {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(number = %self.number, "emergency protocol triggered");
        if let Err(e) = self.dialer.dial(&self.number) {
            tracing::warn!(error = %e, "emergency dial failed");
        }
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn secondary_number(&self) -> &str {
        &self.secondary_number
    }

    /// Number of times [`trigger`](Self::trigger) ran on this handle or its clones.
    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }
}
