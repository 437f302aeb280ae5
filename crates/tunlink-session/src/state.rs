//! VPN state labels
//!
//! The engine reports its state as a free-form label. The set below is
//! what engines are known to emit; anything else is carried verbatim in
//! [`VpnState::Other`] and forwarded to listeners unchanged.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// VPN connection state as reported by the tunnel engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VpnState {
    /// Tunnel is being established
    Connecting,
    /// Tunnel is up
    Connected,
    /// Tunnel is being torn down
    Disconnecting,
    /// No tunnel
    Disconnected,
    /// Attempt timed out
    Timeout,
    /// Session reached its configured expiry
    Expired,
    /// Engine rejected the configuration
    Invalid,
    /// Engine is re-establishing after a network change
    Reasserting,
    /// Waiting on authentication
    Auth,
    /// Engine-specific label
    Other(String),
}

impl VpnState {
    /// Canonical label as written by the engine
    pub fn as_str(&self) -> &str {
        match self {
            VpnState::Connecting => "CONNECTING",
            VpnState::Connected => "CONNECTED",
            VpnState::Disconnecting => "DISCONNECTING",
            VpnState::Disconnected => "DISCONNECTED",
            VpnState::Timeout => "TIMEOUT",
            VpnState::Expired => "EXPIRED",
            VpnState::Invalid => "INVALID",
            VpnState::Reasserting => "REASSERTING",
            VpnState::Auth => "AUTH",
            VpnState::Other(label) => label,
        }
    }

    /// Check if the tunnel is up
    pub fn is_connected(&self) -> bool {
        matches!(self, VpnState::Connected)
    }

    /// Check if this state ends the current attempt
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            VpnState::Disconnected | VpnState::Timeout | VpnState::Expired | VpnState::Invalid
        )
    }

    /// Check if a session is in progress (anything but a terminal state).
    ///
    /// Unknown labels count as active: an engine extension state is
    /// assumed to belong to a live session.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if the label is outside the known set
    pub fn is_recognized(&self) -> bool {
        !matches!(self, VpnState::Other(_))
    }
}

impl FromStr for VpnState {
    type Err = Infallible;

    /// Labels are matched exactly; anything else, including a differently
    /// cased or padded known label, is kept verbatim in `Other`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECTING" => VpnState::Connecting,
            "CONNECTED" => VpnState::Connected,
            "DISCONNECTING" => VpnState::Disconnecting,
            "DISCONNECTED" => VpnState::Disconnected,
            "TIMEOUT" => VpnState::Timeout,
            "EXPIRED" => VpnState::Expired,
            "INVALID" => VpnState::Invalid,
            "REASSERTING" => VpnState::Reasserting,
            "AUTH" => VpnState::Auth,
            _ => VpnState::Other(s.to_string()),
        })
    }
}

impl From<String> for VpnState {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(state) => state,
            Err(never) => match never {},
        }
    }
}

impl From<&str> for VpnState {
    fn from(value: &str) -> Self {
        VpnState::from(value.to_string())
    }
}

impl From<VpnState> for String {
    fn from(state: VpnState) -> Self {
        state.as_str().to_string()
    }
}

impl fmt::Display for VpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_labels() {
        assert_eq!(VpnState::from("CONNECTED"), VpnState::Connected);
        assert_eq!(VpnState::from("EXPIRED"), VpnState::Expired);
        assert!(VpnState::Connected.is_connected());
        assert!(!VpnState::Connecting.is_connected());
    }

    #[test]
    fn test_labels_kept_verbatim() {
        let state = VpnState::from("connected");
        assert_eq!(state, VpnState::Other("connected".into()));
        assert_eq!(state.as_str(), "connected");
        assert!(!state.is_connected());

        let padded = VpnState::from(" EXPIRED ");
        assert_eq!(padded.to_string(), " EXPIRED ");
    }

    #[test]
    fn test_unknown_label_passes_through() {
        let state = VpnState::from("wait_connection");
        assert_eq!(state, VpnState::Other("wait_connection".into()));
        assert_eq!(state.to_string(), "wait_connection");
        assert!(!state.is_recognized());
        assert!(state.is_active());
    }

    #[test]
    fn test_terminal_states() {
        assert!(VpnState::Disconnected.is_terminal());
        assert!(VpnState::Timeout.is_terminal());
        assert!(VpnState::Invalid.is_terminal());
        assert!(!VpnState::Reasserting.is_terminal());
        assert!(VpnState::Auth.is_active());
    }

    #[test]
    fn test_serde_as_label() {
        let json = serde_json::to_string(&VpnState::Reasserting).unwrap();
        assert_eq!(json, "\"REASSERTING\"");

        let state: VpnState = serde_json::from_str("\"vendor_x\"").unwrap();
        assert_eq!(state, VpnState::Other("vendor_x".into()));
    }
}
