//! Safety layer: crisis keyword detection, emergency dialing, privacy reassurance.

pub mod crisis;
pub mod emergency;
pub mod privacy;

pub use crisis::{detect, normalize, CrisisDetector, CRISIS_KEYWORDS};
pub use emergency::{
    Dialer, EmergencyProtocol, LogDialer, SystemDialer, DEFAULT_EMERGENCY_NUMBER,
    DEFAULT_SECONDARY_NUMBER,
};
pub use privacy::{mentions_privacy, wants_reassurance, PRIVACY_KEYWORDS, PRIVACY_MIN_MESSAGES};
