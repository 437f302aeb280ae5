//! Session Identity Registry
//!
//! Keeps the (name, id) of the active session in the main namespace so a
//! restarted process can tell the UI which profile the running tunnel
//! belongs to.

use crate::codec::{self, CodecError, SessionIdentity};
use crate::store::{ChannelStore, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Store key of the persisted identity
pub const IDENTITY_KEY: &str = "tunlink.identity";

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Cannot encode identity: {0}")]
    Encoding(#[from] CodecError),

    #[error("Cannot persist identity: {0}")]
    Store(#[from] StoreError),
}

/// Persisted identity of the active session
#[derive(Clone)]
pub struct IdentityRegistry {
    store: Arc<dyn ChannelStore>,
}

impl IdentityRegistry {
    /// Create a registry over the main namespace
    pub fn new(store: Arc<dyn ChannelStore>) -> Self {
        Self { store }
    }

    /// Persist an identity, replacing whatever was stored
    pub fn save(&self, name: &str, id: &str) -> Result<(), RegistryError> {
        let encoded = codec::encode_identity(name, id)?;
        self.store.set_string(IDENTITY_KEY, &encoded)?;
        debug!("Saved session identity {:?}/{:?}", name, id);
        Ok(())
    }

    /// Stored identity, if any
    pub fn current(&self) -> Option<SessionIdentity> {
        self.store
            .get_string(IDENTITY_KEY)
            .map(|v| codec::decode_identity(&v))
    }

    /// Stored session id, if any
    pub fn current_id(&self) -> Option<String> {
        self.current().map(|i| i.id)
    }

    /// Stored session name, if any. Empty for identities written before
    /// names were recorded.
    pub fn current_name(&self) -> Option<String> {
        self.current().map(|i| i.name)
    }
}
