//! Observation Bus
//!
//! Turns raw store observers into one decoded stream per logical status
//! key.
//!
//! # Namespaces
//!
//! ```text
//!   main store ──── connectionUpdate ─┐
//!              ──── profileStatus  ───┼──▶ canonical value ──▶ decoder ──▶ listeners
//!              ──── vpnStatus ────────┤        (per key)
//!  group store ──── vpnStatusGroup ───┘
//! ```
//!
//! Each logical key is observed once per namespace that exposes it. When
//! two namespaces feed the same key, the [`MergePolicy`] decides which
//! delivery becomes the canonical value.
//!
//! # Delivery
//!
//! - A new listener immediately receives the canonical value, if one has
//!   been observed, exactly once.
//! - Re-deliveries of an older revision or of an unchanged value are
//!   dropped per namespace.
//! - An unset value never replaces a value delivered by the other
//!   namespace.
//! - Values the decoder rejects are dropped for that listener; the bus
//!   never surfaces decode failures.
//! - Deliveries are queued in order and run by one thread at a time, with
//!   no bus lock held while a listener runs. A listener may write to any
//!   store or subscribe again; what that triggers is delivered after it
//!   returns.

use crate::codec::{self, CodecError, StatusEvent};
use crate::context::SessionContext;
use crate::state::VpnState;
use crate::store::{ChannelStore, NamespaceKind, ObserverId, StoreChange};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Logical status keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKey {
    /// Four-field traffic sample
    ConnectionUpdate,
    /// Opaque VPN state label
    VpnStatus,
    /// Profile-loaded sentinel
    ProfileStatus,
}

impl StatusKey {
    /// All logical keys
    pub fn all() -> &'static [StatusKey] {
        &[
            StatusKey::ConnectionUpdate,
            StatusKey::VpnStatus,
            StatusKey::ProfileStatus,
        ]
    }

    /// Store key for this logical key in a namespace, if exposed there.
    ///
    /// These names are shared with out-of-process writers and must not
    /// change.
    pub fn store_key(&self, namespace: NamespaceKind) -> Option<&'static str> {
        match (self, namespace) {
            (StatusKey::ConnectionUpdate, NamespaceKind::Main) => Some("connectionUpdate"),
            (StatusKey::VpnStatus, NamespaceKind::Main) => Some("vpnStatus"),
            (StatusKey::ProfileStatus, NamespaceKind::Main) => Some("profileStatus"),
            (StatusKey::VpnStatus, NamespaceKind::Group) => Some("vpnStatusGroup"),
            _ => None,
        }
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKey::ConnectionUpdate => write!(f, "connection-update"),
            StatusKey::VpnStatus => write!(f, "vpn-status"),
            StatusKey::ProfileStatus => write!(f, "profile-status"),
        }
    }
}

/// How deliveries from two namespaces for the same key are merged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Whichever namespace delivered most recently wins
    #[default]
    LastDelivered,
    /// While the group namespace reports an active VPN state, VPN states
    /// from the main namespace are recorded but not forwarded
    PreferGroup,
}

/// Decoded event, as sent through [`ObservationBus::event_channel`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionUpdate(StatusEvent),
    VpnStatus(VpnState),
    ProfileStatus(bool),
}

/// Handle for releasing a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type RawListener = Arc<dyn Fn(Option<&str>) + Send + Sync>;

/// Decode a VPN state label. Empty or unset values carry no state.
pub fn decode_vpn_state(value: &str) -> Result<VpnState, CodecError> {
    if value.trim().is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(VpnState::from(value))
}

#[derive(Debug, Clone)]
struct Seen {
    revision: u64,
    value: Option<String>,
}

#[derive(Debug, Clone)]
struct Canonical {
    value: Option<String>,
    namespace: NamespaceKind,
}

#[derive(Default)]
struct BusInner {
    /// `None` while the store observer is being registered
    wired: HashMap<(StatusKey, NamespaceKind), Option<ObserverId>>,
    listeners: HashMap<StatusKey, Vec<(ListenerId, RawListener)>>,
    canonical: HashMap<StatusKey, Canonical>,
    seen: HashMap<(StatusKey, NamespaceKind), Seen>,
    /// Pending deliveries, in the order they were decided
    queue: VecDeque<Pending>,
    /// Set while some thread runs the queue
    draining: bool,
    next_listener: u64,
}

struct Pending {
    key: StatusKey,
    listener: ListenerId,
    value: Option<String>,
}

struct BusShared {
    context: Arc<SessionContext>,
    policy: MergePolicy,
    inner: Mutex<BusInner>,
}

/// Releases the draining flag if a listener panics mid-delivery
struct DrainGuard<'a>(&'a BusShared);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.inner.lock().draining = false;
        }
    }
}

impl BusShared {
    fn on_change(&self, key: StatusKey, change: &StoreChange) {
        {
            let mut inner = self.inner.lock();
            let slot = (key, change.namespace);

            if let Some(seen) = inner.seen.get(&slot) {
                if change.revision < seen.revision {
                    debug!(
                        "Dropping stale {} from {} (rev {} < {})",
                        key, change.namespace, change.revision, seen.revision
                    );
                    return;
                }
                if seen.value == change.value {
                    return;
                }
            }
            inner.seen.insert(
                slot,
                Seen {
                    revision: change.revision,
                    value: change.value.clone(),
                },
            );

            // An unset key in one namespace says nothing about the other
            let foreign_absent = change.value.is_none()
                && inner
                    .canonical
                    .get(&key)
                    .is_some_and(|c| c.namespace != change.namespace);
            if foreign_absent {
                return;
            }

            if self.suppressed(&inner, key, change.namespace) {
                debug!(
                    "Group namespace active, not forwarding {} {:?} from {}",
                    key, change.value, change.namespace
                );
                return;
            }

            inner.canonical.insert(
                key,
                Canonical {
                    value: change.value.clone(),
                    namespace: change.namespace,
                },
            );
            // Context writes are leaf locks; keep them in canonical order
            self.record(key, change.value.as_deref());

            let ids: Vec<ListenerId> = inner
                .listeners
                .get(&key)
                .map(|list| list.iter().map(|(id, _)| *id).collect())
                .unwrap_or_default();
            for listener in ids {
                inner.queue.push_back(Pending {
                    key,
                    listener,
                    value: change.value.clone(),
                });
            }
        }

        self.drain();
    }

    /// Run queued deliveries unless another thread already is
    fn drain(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }
        let _guard = DrainGuard(self);

        loop {
            let (listener, value) = {
                let mut inner = self.inner.lock();
                let Some(next) = inner.queue.pop_front() else {
                    // Cleared under the same lock that saw the queue empty
                    inner.draining = false;
                    return;
                };
                // Skip listeners released since the delivery was queued
                let listener = inner
                    .listeners
                    .get(&next.key)
                    .and_then(|list| list.iter().find(|(id, _)| *id == next.listener))
                    .map(|(_, l)| l.clone());
                match listener {
                    Some(l) => (l, next.value),
                    None => continue,
                }
            };
            listener(value.as_deref());
        }
    }

    fn suppressed(&self, inner: &BusInner, key: StatusKey, namespace: NamespaceKind) -> bool {
        if self.policy != MergePolicy::PreferGroup
            || key != StatusKey::VpnStatus
            || namespace != NamespaceKind::Main
        {
            return false;
        }

        inner
            .seen
            .get(&(StatusKey::VpnStatus, NamespaceKind::Group))
            .and_then(|seen| seen.value.as_deref())
            .and_then(|v| decode_vpn_state(v).ok())
            .map(|state| state.is_active())
            .unwrap_or(false)
    }

    /// Mirror a canonical value into the session context
    fn record(&self, key: StatusKey, value: Option<&str>) {
        let raw = value.unwrap_or("");
        match key {
            StatusKey::VpnStatus => {
                if let Ok(state) = decode_vpn_state(raw) {
                    self.context.set_vpn_state(Some(state));
                }
            }
            StatusKey::ConnectionUpdate => {
                if let Ok(event) = codec::decode_status_event(raw) {
                    self.context.set_last_status(event);
                }
            }
            StatusKey::ProfileStatus => {
                self.context.set_profile_loaded(codec::decode_profile_flag(raw));
            }
        }
    }
}

/// Decoded fan-out over one or two namespaces
pub struct ObservationBus {
    stores: Vec<Arc<dyn ChannelStore>>,
    shared: Arc<BusShared>,
}

impl ObservationBus {
    /// Create a bus over the main namespace and, on isolated platforms,
    /// the group namespace
    pub fn new(
        context: Arc<SessionContext>,
        policy: MergePolicy,
        main: Arc<dyn ChannelStore>,
        group: Option<Arc<dyn ChannelStore>>,
    ) -> Self {
        let mut stores = vec![main];
        stores.extend(group);

        Self {
            stores,
            shared: Arc::new(BusShared {
                context,
                policy,
                inner: Mutex::new(BusInner::default()),
            }),
        }
    }

    /// Merge policy in effect
    pub fn policy(&self) -> MergePolicy {
        self.shared.policy
    }

    /// Observe `key` on every namespace that exposes it. Idempotent.
    pub fn wire(&self, key: StatusKey) {
        for store in &self.stores {
            let namespace = store.namespace().kind;
            let Some(store_key) = key.store_key(namespace) else {
                continue;
            };

            {
                let mut inner = self.shared.inner.lock();
                if inner.wired.contains_key(&(key, namespace)) {
                    continue;
                }
                inner.wired.insert((key, namespace), None);
            }

            let weak: Weak<BusShared> = Arc::downgrade(&self.shared);
            let id = store.observe(
                store_key,
                Arc::new(move |change: &StoreChange| {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_change(key, change);
                    }
                }),
            );

            self.shared.inner.lock().wired.insert((key, namespace), Some(id));
            debug!("Observing {} as {} in {}", key, store_key, store.namespace());
        }
    }

    /// Observe every logical key
    pub fn wire_all(&self) {
        for key in StatusKey::all() {
            self.wire(*key);
        }
    }

    /// Number of store observers currently registered
    pub fn wired_count(&self) -> usize {
        self.shared
            .inner
            .lock()
            .wired
            .values()
            .filter(|id| id.is_some())
            .count()
    }

    /// Register a listener for `key`.
    ///
    /// The key is wired if it was not already, and the canonical value (if
    /// any) is queued for the new listener ahead of any later change. It
    /// is delivered before this returns unless another thread is running
    /// deliveries, in which case that thread delivers it.
    pub fn subscribe<T, D, F>(&self, key: StatusKey, decoder: D, listener: F) -> ListenerId
    where
        D: Fn(&str) -> Result<T, CodecError> + Send + Sync + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let raw: RawListener = Arc::new(move |value: Option<&str>| {
            match decoder(value.unwrap_or("")) {
                Ok(decoded) => listener(decoded),
                Err(e) => debug!("Dropping {} value {:?}: {}", key, value, e),
            }
        });

        self.wire(key);

        let id = {
            let mut inner = self.shared.inner.lock();
            inner.next_listener += 1;
            let id = ListenerId(inner.next_listener);
            inner.listeners.entry(key).or_default().push((id, raw));
            if let Some(canonical) = inner.canonical.get(&key) {
                let value = canonical.value.clone();
                inner.queue.push_back(Pending {
                    key,
                    listener: id,
                    value,
                });
            }
            id
        };

        self.shared.drain();
        id
    }

    /// Listen for connection-update samples
    pub fn on_connection_update<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(StatusEvent) + Send + Sync + 'static,
    {
        self.subscribe(StatusKey::ConnectionUpdate, codec::decode_status_event, listener)
    }

    /// Listen for VPN state changes
    pub fn on_vpn_status<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(VpnState) + Send + Sync + 'static,
    {
        self.subscribe(StatusKey::VpnStatus, decode_vpn_state, listener)
    }

    /// Listen for profile-loaded changes
    pub fn on_profile_status<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.subscribe(
            StatusKey::ProfileStatus,
            |v: &str| Ok(codec::decode_profile_flag(v)),
            listener,
        )
    }

    /// All three streams merged into one channel
    pub fn event_channel(&self) -> EventStream {
        let (tx, rx) = unbounded();

        let status_tx = tx.clone();
        let state_tx = tx.clone();
        let profile_tx = tx;

        let listeners = vec![
            self.on_connection_update(move |e| {
                let _ = status_tx.send(SessionEvent::ConnectionUpdate(e));
            }),
            self.on_vpn_status(move |s| {
                let _ = state_tx.send(SessionEvent::VpnStatus(s));
            }),
            self.on_profile_status(move |p| {
                let _ = profile_tx.send(SessionEvent::ProfileStatus(p));
            }),
        ];

        EventStream { rx, listeners }
    }

    /// Release a listener. Returns false if it was already released.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.shared.inner.lock();
        let mut removed = false;
        for list in inner.listeners.values_mut() {
            let before = list.len();
            list.retain(|(lid, _)| *lid != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Release every listener of an event stream
    pub fn close_stream(&self, stream: EventStream) {
        for id in stream.listeners {
            self.unsubscribe(id);
        }
    }

    /// Canonical raw value of a key, if one has been observed
    pub fn current(&self, key: StatusKey) -> Option<String> {
        self.shared
            .inner
            .lock()
            .canonical
            .get(&key)
            .and_then(|c| c.value.clone())
    }

    /// Namespace the canonical value of a key came from
    pub fn source(&self, key: StatusKey) -> Option<NamespaceKind> {
        self.shared
            .inner
            .lock()
            .canonical
            .get(&key)
            .map(|c| c.namespace)
    }

    /// Re-apply every canonical value to the session context
    pub(crate) fn sync_context(&self) {
        let canonical: Vec<(StatusKey, Option<String>)> = self
            .shared
            .inner
            .lock()
            .canonical
            .iter()
            .map(|(k, c)| (*k, c.value.clone()))
            .collect();

        for (key, value) in canonical {
            self.shared.record(key, value.as_deref());
        }
    }

    /// Release every store observer and listener
    pub fn teardown(&self) {
        let wired: Vec<((StatusKey, NamespaceKind), Option<ObserverId>)> = {
            let mut inner = self.shared.inner.lock();
            inner.listeners.clear();
            inner.queue.clear();
            inner.seen.clear();
            inner.canonical.clear();
            inner.wired.drain().collect()
        };

        if wired.is_empty() {
            return;
        }

        for ((_, namespace), id) in &wired {
            let Some(id) = id else { continue };
            if let Some(store) = self.stores.iter().find(|s| s.namespace().kind == *namespace) {
                store.unobserve(*id);
            }
        }
        info!("Observation bus released {} store observers", wired.len());
    }
}

impl Drop for ObservationBus {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Receiving end of [`ObservationBus::event_channel`]
pub struct EventStream {
    rx: Receiver<SessionEvent>,
    listeners: Vec<ListenerId>,
}

impl EventStream {
    /// Block until the next event
    pub fn recv(&self) -> Option<SessionEvent> {
        self.rx.recv().ok()
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<SessionEvent> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Next event if one is queued
    pub fn try_recv(&self) -> Option<SessionEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Every queued event
    pub fn drain(&self) -> Vec<SessionEvent> {
        self.rx.try_iter().collect()
    }

    /// Listeners backing this stream
    pub fn listener_ids(&self) -> &[ListenerId] {
        &self.listeners
    }
}
