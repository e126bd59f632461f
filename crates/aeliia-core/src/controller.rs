//! Gated action controller.
//!
//! A start request walks the gates in a fixed order: credential, auth (voice), premium
//! (voice), profile completeness, then activation. Completing a gate re-runs the same walk
//! for the request that was blocked. Each activation gets its own [`CancellationToken`];
//! close, crisis and logout cancel it so surfaces built on it tear down.

use tokio_util::sync::CancellationToken;

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use crate::shared::{SurfaceKind, User, UserProfile};
use crate::store::ProfileStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    AwaitingAuth,
    AwaitingPayment,
    AwaitingOnboarding,
    ChatActive,
    VoiceActive,
    CrisisLocked,
}

impl GateState {
    pub fn is_active(&self) -> bool {
        matches!(self, GateState::ChatActive | GateState::VoiceActive)
    }

    pub fn is_gate(&self) -> bool {
        matches!(
            self,
            GateState::AwaitingAuth | GateState::AwaitingPayment | GateState::AwaitingOnboarding
        )
    }
}

pub struct GatedActionController {
    store: ProfileStore,
    credential_present: bool,
    state: GateState,
    /// Request blocked on auth or payment.
    requested: Option<SurfaceKind>,
    /// Request blocked on onboarding.
    pending: Option<SurfaceKind>,
    activation: CancellationToken,
}

impl GatedActionController {
    pub fn new(store: ProfileStore, config: &CoreConfig) -> Self {
        Self::with_credential(store, config.has_api_key())
    }

    pub fn with_credential(store: ProfileStore, credential_present: bool) -> Self {
        Self {
            store,
            credential_present,
            state: GateState::Idle,
            requested: None,
            pending: None,
            activation: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn pending_action(&self) -> Option<SurfaceKind> {
        self.pending
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn user(&self) -> Option<User> {
        self.store.user()
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.store.profile()
    }

    /// Token of the current activation. Cancelled on close, crisis and logout.
    pub fn activation_token(&self) -> CancellationToken {
        self.activation.clone()
    }

    fn set_state(&mut self, next: GateState) -> GateState {
        if self.state != next {
            tracing::info!(from = ?self.state, to = ?next, "gate transition");
        }
        self.state = next;
        next
    }

    fn deactivate(&mut self) {
        self.activation.cancel();
        self.activation = CancellationToken::new();
    }

    fn evaluate(&mut self, kind: SurfaceKind) -> CoreResult<GateState> {
        if !self.credential_present {
            self.requested = None;
            self.pending = None;
            self.set_state(GateState::Idle);
            return Err(CoreError::Configuration("API key missing".into()));
        }

        if kind == SurfaceKind::Voice {
            match self.store.user() {
                None => {
                    self.requested = Some(kind);
                    self.pending = None;
                    return Ok(self.set_state(GateState::AwaitingAuth));
                }
                Some(u) if !u.is_premium => {
                    self.requested = Some(kind);
                    self.pending = None;
                    return Ok(self.set_state(GateState::AwaitingPayment));
                }
                Some(_) => {}
            }
        }

        if !self.store.profile().is_some_and(|p| p.is_complete()) {
            self.requested = None;
            self.pending = Some(kind);
            return Ok(self.set_state(GateState::AwaitingOnboarding));
        }

        self.requested = None;
        self.pending = None;
        self.deactivate();
        Ok(self.set_state(match kind {
            SurfaceKind::Chat => GateState::ChatActive,
            SurfaceKind::Voice => GateState::VoiceActive,
        }))
    }

    /// Ask to start a surface.
    pub fn request(&mut self, kind: SurfaceKind) -> CoreResult<GateState> {
        if self.state == GateState::CrisisLocked {
            return Err(CoreError::SessionLocked);
        }
        if self.state.is_active() {
            self.deactivate();
        }
        tracing::debug!(%kind, "surface requested");
        self.evaluate(kind)
    }

    /// Sign-in finished. Stores the user and, if no profile exists, a name-only profile.
    pub fn complete_auth(&mut self, user: User) -> CoreResult<GateState> {
        self.store.save_user(&user)?;
        if self.store.profile().is_none() {
            self.store.save_profile(&UserProfile::prefilled(user.name.clone()))?;
        }
        tracing::info!("user signed in");
        self.resume_blocked()
    }

    /// Payment succeeded for the signed-in user.
    pub fn complete_payment(&mut self) -> CoreResult<GateState> {
        let mut user = self
            .store
            .user()
            .ok_or_else(|| CoreError::InvalidTransition("payment without a signed-in user".into()))?;
        user.is_premium = true;
        self.store.save_user(&user)?;
        tracing::info!("premium activated");
        self.resume_blocked()
    }

    /// Onboarding form submitted. Consumes the pending action.
    pub fn submit_onboarding(&mut self, profile: UserProfile) -> CoreResult<GateState> {
        if !profile.is_complete() {
            return Err(CoreError::InvalidProfile("age and gender are required".into()));
        }
        self.store.save_profile(&profile)?;
        match self.pending.take() {
            Some(kind) if self.state == GateState::AwaitingOnboarding => self.evaluate(kind),
            _ => Ok(self.state),
        }
    }

    fn resume_blocked(&mut self) -> CoreResult<GateState> {
        let requested = self.requested;
        match requested {
            Some(kind) if matches!(self.state, GateState::AwaitingAuth | GateState::AwaitingPayment) => {
                self.evaluate(kind)
            }
            _ => Ok(self.state),
        }
    }

    /// The user dismissed an auth, payment or onboarding prompt.
    pub fn cancel_gate(&mut self) -> GateState {
        if self.state.is_gate() {
            self.requested = None;
            self.pending = None;
            self.set_state(GateState::Idle);
        }
        self.state
    }

    /// A surface detected a crisis.
    pub fn report_crisis(&mut self) -> CoreResult<GateState> {
        match self.state {
            GateState::CrisisLocked => Ok(self.state),
            s if s.is_active() => {
                self.deactivate();
                tracing::warn!("surface crisis-locked");
                Ok(self.set_state(GateState::CrisisLocked))
            }
            s => Err(CoreError::InvalidTransition(format!("crisis reported while {s:?}"))),
        }
    }

    /// User closed the active surface. A crisis lock is kept.
    pub fn close(&mut self) -> GateState {
        if self.state.is_active() {
            self.deactivate();
            self.set_state(GateState::Idle);
        }
        self.state
    }

    /// The user marked the crisis as a false positive.
    pub fn dismiss_crisis(&mut self) -> CoreResult<GateState> {
        if self.state != GateState::CrisisLocked {
            return Err(CoreError::InvalidTransition("no crisis to dismiss".into()));
        }
        Ok(self.set_state(GateState::Idle))
    }

    pub fn logout(&mut self) -> CoreResult<GateState> {
        self.deactivate();
        self.store.logout()?;
        self.requested = None;
        self.pending = None;
        Ok(self.set_state(GateState::Idle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> GatedActionController {
        GatedActionController::with_credential(ProfileStore::temporary().unwrap(), true)
    }

    #[test]
    fn missing_credential_rejects_before_gates() {
        let mut c = GatedActionController::with_credential(ProfileStore::temporary().unwrap(), false);
        assert!(matches!(c.request(SurfaceKind::Chat), Err(CoreError::Configuration(_))));
        assert_eq!(c.state(), GateState::Idle);
    }

    #[test]
    fn chat_needs_onboarding_then_activates() {
        let mut c = controller();
        assert_eq!(c.request(SurfaceKind::Chat).unwrap(), GateState::AwaitingOnboarding);
        assert_eq!(c.pending_action(), Some(SurfaceKind::Chat));
        assert!(matches!(
            c.submit_onboarding(UserProfile::new("Zoé", "", "femme")),
            Err(CoreError::InvalidProfile(_))
        ));
        assert_eq!(
            c.submit_onboarding(UserProfile::new("Zoé", "22", "femme")).unwrap(),
            GateState::ChatActive
        );
        assert_eq!(c.pending_action(), None);
    }

    #[test]
    fn auth_prefills_name_but_onboarding_still_gates() {
        let mut c = controller();
        assert_eq!(c.request(SurfaceKind::Voice).unwrap(), GateState::AwaitingAuth);
        let state = c.complete_auth(User::from_email("maya@example.org")).unwrap();
        assert_eq!(state, GateState::AwaitingPayment);
        assert_eq!(c.profile().map(|p| p.name), Some("maya".to_string()));
        assert_eq!(c.complete_payment().unwrap(), GateState::AwaitingOnboarding);
        assert_eq!(c.pending_action(), Some(SurfaceKind::Voice));
    }

    #[test]
    fn close_keeps_crisis_lock_until_dismissed() {
        let mut c = controller();
        c.store().save_profile(&UserProfile::new("A", "30", "homme")).unwrap();
        c.request(SurfaceKind::Chat).unwrap();
        let token = c.activation_token();
        c.report_crisis().unwrap();
        assert!(token.is_cancelled());
        assert_eq!(c.close(), GateState::CrisisLocked);
        assert!(matches!(c.request(SurfaceKind::Chat), Err(CoreError::SessionLocked)));
        assert_eq!(c.dismiss_crisis().unwrap(), GateState::Idle);
        assert_eq!(c.request(SurfaceKind::Chat).unwrap(), GateState::ChatActive);
    }

    #[test]
    fn cancel_gate_clears_pending() {
        let mut c = controller();
        c.request(SurfaceKind::Chat).unwrap();
        assert_eq!(c.cancel_gate(), GateState::Idle);
        assert_eq!(c.pending_action(), None);
        assert!(c.report_crisis().is_err());
    }

    #[test]
    fn switching_to_a_blocked_voice_request_drops_pending_chat() {
        let mut c = controller();
        assert_eq!(c.request(SurfaceKind::Chat).unwrap(), GateState::AwaitingOnboarding);
        assert_eq!(c.request(SurfaceKind::Voice).unwrap(), GateState::AwaitingAuth);
        assert_eq!(c.pending_action(), None);

        // onboarding while blocked on auth must not open the old chat request
        assert_eq!(
            c.submit_onboarding(UserProfile::new("Zoé", "22", "femme")).unwrap(),
            GateState::AwaitingAuth
        );
        assert_eq!(c.pending_action(), None);

        c.complete_auth(User::from_email("zoe@example.org")).unwrap();
        assert_eq!(c.state(), GateState::AwaitingPayment);
        assert_eq!(c.pending_action(), None);
    }
}
