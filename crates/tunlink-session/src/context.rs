//! Shared session state
//!
//! Owned by the [`SessionController`](crate::SessionController) and handed
//! to the [`ObservationBus`](crate::ObservationBus) at construction. The bus
//! writes the observed values, the controller writes the identity; readers
//! get copies.

use crate::codec::{SessionIdentity, StatusEvent};
use crate::state::VpnState;
use parking_lot::RwLock;

/// Latest known state of the session in this process
#[derive(Debug, Default)]
pub struct SessionContext {
    vpn_state: RwLock<Option<VpnState>>,
    profile_loaded: RwLock<Option<bool>>,
    last_status: RwLock<Option<StatusEvent>>,
    identity: RwLock<Option<SessionIdentity>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current VPN state, if any has been observed
    pub fn vpn_state(&self) -> Option<VpnState> {
        self.vpn_state.read().clone()
    }

    /// Whether the engine has a profile loaded, if reported
    pub fn profile_loaded(&self) -> Option<bool> {
        *self.profile_loaded.read()
    }

    /// Most recent connection-update sample
    pub fn last_status(&self) -> Option<StatusEvent> {
        self.last_status.read().clone()
    }

    /// Identity of the active session
    pub fn identity(&self) -> Option<SessionIdentity> {
        self.identity.read().clone()
    }

    pub(crate) fn set_vpn_state(&self, state: Option<VpnState>) {
        *self.vpn_state.write() = state;
    }

    pub(crate) fn set_profile_loaded(&self, loaded: bool) {
        *self.profile_loaded.write() = Some(loaded);
    }

    pub(crate) fn set_last_status(&self, event: StatusEvent) {
        *self.last_status.write() = Some(event);
    }

    pub(crate) fn set_identity(&self, identity: Option<SessionIdentity>) {
        *self.identity.write() = identity;
    }

    /// Forget everything observed so far (start of a recovery pass)
    pub(crate) fn reset(&self) {
        *self.vpn_state.write() = None;
        *self.profile_loaded.write() = None;
        *self.last_status.write() = None;
        *self.identity.write() = None;
    }
}
