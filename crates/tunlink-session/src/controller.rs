//! Session Lifecycle Controller
//!
//! Drives the tunnel engine and keeps the bus, registry and session
//! context in step with it.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = SessionController::new(config, engine, main, group);
//!
//! // Recover whatever was running before the app restarted
//! let recovered = controller.initialize().await?;
//!
//! // UI listeners
//! controller.bus().on_vpn_status(|state| println!("VPN: {state}"));
//!
//! // Start a session; 0 means the engine accepted the request
//! let code = controller
//!     .start(StartParams::new(ovpn, SessionIdentity::new("home", "7")))
//!     .await?;
//!
//! controller.stop().await;
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──initialize()──▶ Initializing ──ok──▶ Ready
//!                                      │
//!                                      └──error──▶ (previous state)
//! ```
//!
//! The VPN state itself belongs to the engine and is only observed here.

use crate::bus::{self, MergePolicy, ObservationBus};
use crate::codec::{self, CodecError, SessionIdentity, StatusEvent};
use crate::config::{ConfigError, SessionConfig};
use crate::context::SessionContext;
use crate::engine::{Credentials, EngineError, EngineInit, StartRequest, TimeoutValue, TunnelEngine};
use crate::registry::{IdentityRegistry, RegistryError};
use crate::state::VpnState;
use crate::store::ChannelStore;
use chrono::NaiveDateTime;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Controller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// `initialize` has not succeeded yet
    Uninitialized,
    /// `initialize` is running
    Initializing,
    /// Engine initialized and status keys observed
    Ready,
}

/// Controller errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid session identity: {0}")]
    Encoding(#[from] CodecError),

    #[error("Controller not initialized")]
    NotInitialized,

    #[error("Initialization already in progress")]
    InitializationInProgress,
}

/// What `initialize` recovered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitializationResult {
    /// State the engine reported
    pub vpn_current_status: Option<VpnState>,
    /// Expiry of the running session
    pub latest_expire_at: Option<NaiveDateTime>,
    /// Name of the running session
    pub latest_connection_name: Option<String>,
    /// Id of the running session
    pub latest_connection_id: Option<String>,
}

/// Parameters of [`SessionController::start`]
#[derive(Debug, Clone)]
pub struct StartParams {
    /// Raw tunnel configuration
    pub config: String,
    pub credentials: Option<Credentials>,
    pub identity: SessionIdentity,
    /// Absolute time at which the engine ends the session
    pub expire_at: Option<NaiveDateTime>,
    /// Idle timeout enforced by the engine
    pub timeout: Option<Duration>,
}

impl StartParams {
    pub fn new(config: impl Into<String>, identity: SessionIdentity) -> Self {
        Self {
            config: config.into(),
            credentials: None,
            identity,
            expire_at: None,
            timeout: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_expiry(mut self, at: NaiveDateTime) -> Self {
        self.expire_at = Some(at);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Session Lifecycle Controller
///
/// The only component that talks to the engine. Owns the session context
/// and hands it to the bus it creates.
pub struct SessionController {
    config: SessionConfig,
    engine: Arc<dyn TunnelEngine>,
    context: Arc<SessionContext>,
    bus: ObservationBus,
    registry: IdentityRegistry,
    lifecycle: RwLock<LifecycleState>,
}

impl SessionController {
    /// Create a controller.
    ///
    /// `group` is only used on platforms that isolate the engine; the
    /// identity registry always lives in `main`.
    pub fn new(
        config: SessionConfig,
        engine: Arc<dyn TunnelEngine>,
        main: Arc<dyn ChannelStore>,
        group: Option<Arc<dyn ChannelStore>>,
    ) -> Self {
        let group = match group {
            Some(store) if !config.platform.isolates_engine() => {
                warn!(
                    "Ignoring group namespace {}: {} runs the engine in-process",
                    store.namespace(),
                    config.platform
                );
                None
            }
            other => other,
        };

        let context = Arc::new(SessionContext::new());
        let bus = ObservationBus::new(context.clone(), config.merge_policy, main.clone(), group);
        let registry = IdentityRegistry::new(main);

        Self {
            config,
            engine,
            context,
            bus,
            registry,
            lifecycle: RwLock::new(LifecycleState::Uninitialized),
        }
    }

    /// Current lifecycle state
    pub async fn lifecycle_state(&self) -> LifecycleState {
        *self.lifecycle.read().await
    }

    /// Initialize the engine and recover the previous session.
    ///
    /// Safe to call again: store observers are registered once, and each
    /// call is a fresh recovery pass.
    pub async fn initialize(&self) -> Result<InitializationResult, SessionError> {
        let previous = {
            let mut lifecycle = self.lifecycle.write().await;
            if *lifecycle == LifecycleState::Initializing {
                return Err(SessionError::InitializationInProgress);
            }
            let previous = *lifecycle;
            *lifecycle = LifecycleState::Initializing;
            previous
        };

        let result = self.do_initialize().await;

        *self.lifecycle.write().await = match result {
            Ok(_) => LifecycleState::Ready,
            Err(_) => previous,
        };

        result
    }

    async fn do_initialize(&self) -> Result<InitializationResult, SessionError> {
        if let Err(e) = self.config.validate() {
            error!("Invalid session configuration: {}", e);
            return Err(e.into());
        }

        let init = EngineInit {
            platform: self.config.platform,
            isolation: self.config.isolation(),
        };

        info!("Initializing tunnel engine ({})", self.config.platform);
        let snapshot = match self.engine.initialize(&init).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Tunnel engine initialization failed: {}", e);
                if let Some(detail) = &e.detail {
                    debug!("Engine detail: {}", detail);
                }
                return Err(e.into());
            }
        };

        // Fresh recovery pass: drop everything observed so far, then rebuild
        // from the stores and the engine's own report
        self.context.reset();
        self.bus.wire_all();
        self.bus.sync_context();

        let engine_state = snapshot
            .vpn_status
            .as_deref()
            .and_then(|s| bus::decode_vpn_state(s).ok());
        if let Some(state) = &engine_state {
            self.context.set_vpn_state(Some(state.clone()));
        }

        let stored = self.registry.current();
        let result = InitializationResult {
            vpn_current_status: engine_state,
            latest_expire_at: snapshot.expire_at.as_deref().and_then(codec::parse_expiry),
            latest_connection_name: non_empty(snapshot.connection_name)
                .or_else(|| stored.as_ref().map(|i| i.name.clone())),
            latest_connection_id: non_empty(snapshot.connection_id)
                .or_else(|| stored.as_ref().map(|i| i.id.clone())),
        };

        if let Some(id) = &result.latest_connection_id {
            let name = result.latest_connection_name.clone().unwrap_or_default();
            self.context
                .set_identity(Some(SessionIdentity::new(name, id.clone())));
        }

        info!(
            "Tunnel engine ready (state: {}, session: {})",
            result
                .vpn_current_status
                .as_ref()
                .map(|s| s.as_str())
                .unwrap_or("unknown"),
            result.latest_connection_id.as_deref().unwrap_or("none")
        );
        Ok(result)
    }

    /// Start a session.
    ///
    /// The identity is persisted before the engine is called, so a restart
    /// mid-connection still recovers it. Returns `0` if the engine accepted
    /// the request, otherwise the engine's code (`-1` if it sent none).
    ///
    /// Calling `start` again before the previous call returns is not
    /// supported by engines and must be avoided by the caller.
    pub async fn start(&self, params: StartParams) -> Result<i32, SessionError> {
        if self.lifecycle_state().await != LifecycleState::Ready {
            return Err(SessionError::NotInitialized);
        }

        let identity = params.identity;
        match self.registry.save(&identity.name, &identity.id) {
            Ok(()) => {}
            Err(RegistryError::Encoding(e)) => return Err(e.into()),
            Err(RegistryError::Store(e)) => {
                warn!("Could not persist identity {}: {}", identity, e);
            }
        }
        self.context.set_identity(Some(identity.clone()));

        let request = StartRequest {
            config: params.config,
            credentials: params.credentials,
            identity: identity.clone(),
            expire_at: params.expire_at.as_ref().map(codec::format_expiry),
            timeout: params
                .timeout
                .map(|t| TimeoutValue::for_platform(self.config.platform, t)),
        };

        info!("Starting session {}", identity);
        match self.engine.start(request).await {
            Ok(()) => {
                debug!("Engine accepted start of {}", identity);
                Ok(0)
            }
            Err(e) => {
                let code = e.code();
                warn!("Engine rejected start of {}: {} (code {})", identity, e, code);
                Ok(code)
            }
        }
    }

    /// Stop the session. Failures are logged, never returned.
    pub async fn stop(&self) {
        info!("Stopping session");
        if let Err(e) = self.engine.stop().await {
            warn!("Tunnel engine stop failed: {}", e);
        }
    }

    /// Live state straight from the engine, `None` if it cannot be read
    pub async fn current_status(&self) -> Option<VpnState> {
        match self.engine.query_status().await {
            Ok(label) => bus::decode_vpn_state(&label).ok(),
            Err(e) => {
                debug!("Status query failed: {}", e);
                None
            }
        }
    }

    /// Latest observed VPN state
    pub fn vpn_state(&self) -> Option<VpnState> {
        self.context.vpn_state()
    }

    /// Check if the latest observed state is connected
    pub fn is_connected(&self) -> bool {
        self.vpn_state().is_some_and(|s| s.is_connected())
    }

    /// Whether the engine has a profile loaded, if reported
    pub fn profile_loaded(&self) -> Option<bool> {
        self.context.profile_loaded()
    }

    /// Latest connection-update sample
    pub fn last_status(&self) -> Option<StatusEvent> {
        self.context.last_status()
    }

    /// Identity of the active session
    pub fn identity(&self) -> Option<SessionIdentity> {
        self.context.identity()
    }

    /// Observation bus, for registering listeners
    pub fn bus(&self) -> &ObservationBus {
        &self.bus
    }

    /// Identity registry
    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// Shared session context
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    /// Configuration in use
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Merge policy of the bus
    pub fn merge_policy(&self) -> MergePolicy {
        self.bus.policy()
    }

    /// Release every store observer and listener
    pub async fn shutdown(&self) {
        self.bus.teardown();
        *self.lifecycle.write().await = LifecycleState::Uninitialized;
        info!("Session controller shut down");
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
