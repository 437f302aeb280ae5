//! Tunnel engine boundary
//!
//! The engine does the actual tunneling and is reached through whatever
//! bridge the host platform offers. This module only defines what goes
//! across: requests, the engine's own view of the session, and typed
//! errors so callers can tell an unreachable engine from a rejection.

use crate::codec::SessionIdentity;
use crate::config::{IsolationConfig, Platform};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Idle timeout in the encoding the target engine expects.
///
/// Both carry seconds; only the wire type differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutValue {
    /// Integer seconds
    Seconds(u64),
    /// Seconds as a decimal string
    SecondsText(String),
}

impl TimeoutValue {
    /// Encode a timeout for a platform's engine
    pub fn for_platform(platform: Platform, timeout: Duration) -> Self {
        let secs = timeout.as_secs();
        if platform.isolates_engine() {
            TimeoutValue::SecondsText(secs.to_string())
        } else {
            TimeoutValue::Seconds(secs)
        }
    }

    /// Semantic value in seconds
    pub fn seconds(&self) -> Option<u64> {
        match self {
            TimeoutValue::Seconds(s) => Some(*s),
            TimeoutValue::SecondsText(s) => s.parse().ok(),
        }
    }
}

/// Username/password pair for the tunnel
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .finish()
    }
}

/// Parameters of the engine's initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineInit {
    pub platform: Platform,
    /// Present on isolated platforms
    pub isolation: Option<IsolationConfig>,
}

/// Request sent to the engine to start a tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    /// Raw tunnel configuration (e.g. an .ovpn document)
    pub config: String,
    pub credentials: Option<Credentials>,
    pub identity: SessionIdentity,
    /// Absolute expiry, `yyyy-MM-dd HH:mm:ss`
    pub expire_at: Option<String>,
    pub timeout: Option<TimeoutValue>,
}

/// The engine's own view of the session after initialization
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineSnapshot {
    /// Native state label
    pub vpn_status: Option<String>,
    /// Expiry of the running session, `yyyy-MM-dd HH:mm:ss`
    pub expire_at: Option<String>,
    pub connection_name: Option<String>,
    pub connection_id: Option<String>,
}

/// Broad cause of an engine failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// The bridge to the engine failed
    Unreachable,
    /// The engine refused the request (bad config, denied permission, ...)
    Rejected,
    /// Anything else
    Failed,
}

/// Error reported across the engine boundary
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    /// Human-readable message
    pub message: String,
    /// Machine-readable detail; for `start` this carries the numeric code
    pub detail: Option<String>,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Unreachable, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Rejected, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Failed, message)
    }

    /// Attach a detail payload
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Numeric code of a rejected start, `-1` if the payload has none.
    ///
    /// The detail is checked first; some engines put the bare code in the
    /// message instead.
    pub fn code(&self) -> i32 {
        self.detail
            .as_deref()
            .and_then(|d| d.trim().parse().ok())
            .or_else(|| self.message.trim().parse().ok())
            .unwrap_or(-1)
    }
}

/// The external tunnel engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Prepare the engine and report what it knows about a running session
    async fn initialize(&self, init: &EngineInit) -> Result<EngineSnapshot, EngineError>;

    /// Ask the engine to start a tunnel
    async fn start(&self, request: StartRequest) -> Result<(), EngineError>;

    /// Ask the engine to stop the tunnel
    async fn stop(&self) -> Result<(), EngineError>;

    /// Live state label
    async fn query_status(&self) -> Result<String, EngineError>;
}
