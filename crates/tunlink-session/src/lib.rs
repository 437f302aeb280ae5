//! tunlink session - VPN session state across process boundaries
//!
//! Keeps the UI process in sync with a tunnel engine that may run in a
//! separate extension process, and drives the engine's lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       UI Process                          │
//! │                                                           │
//! │  ┌────────────┐   ┌────────────────┐   ┌──────────────┐  │
//! │  │ Listeners  │◀──│ Observation Bus│◀──│ Main store   │◀─┼── in-process engine
//! │  └────────────┘   └───────┬────────┘   └──────────────┘  │
//! │                           │            ┌──────────────┐  │
//! │  ┌────────────┐           └────────────│ Group store  │◀─┼── extension process
//! │  │ Controller │── start/stop ──▶ engine└──────────────┘  │
//! │  └─────┬──────┘                                          │
//! │        └──▶ Identity Registry (main store)               │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Decoded streams**: connection updates, VPN state and profile status
//! - **Replay on subscribe**: late listeners get the current value once
//! - **Recovery**: identity and state of a running tunnel survive restarts
//! - **File-backed namespaces**: shared with another process via JSON files

mod bus;
mod codec;
mod config;
mod context;
mod controller;
mod engine;
mod file_store;
mod registry;
mod state;
mod store;

pub use bus::{
    decode_vpn_state, EventStream, ListenerId, MergePolicy, ObservationBus, SessionEvent,
    StatusKey,
};
pub use codec::{
    decode_identity, decode_profile_flag, decode_status_event, encode_identity, format_expiry,
    parse_expiry, CodecError, SessionIdentity, StatusEvent, EXPIRY_FORMAT, IDENTITY_SEPARATOR,
    PROFILE_NOT_LOADED, STATUS_SEPARATOR,
};
pub use config::{ConfigError, IsolationConfig, Platform, SessionConfig};
pub use context::SessionContext;
pub use controller::{
    InitializationResult, LifecycleState, SessionController, SessionError, StartParams,
};
pub use engine::{
    Credentials, EngineError, EngineErrorKind, EngineInit, EngineSnapshot, StartRequest,
    TimeoutValue, TunnelEngine,
};
pub use file_store::{FileStore, Namespaces};
pub use registry::{IdentityRegistry, RegistryError, IDENTITY_KEY};
pub use state::VpnState;
pub use store::{
    ChannelStore, MemoryStore, Namespace, NamespaceKind, Observer, ObserverId, StoreChange,
    StoreError,
};
