//! Persistent Channel Store
//!
//! Key-value namespaces shared between the host app, the tunnel engine and
//! (on isolated platforms) the extension process.
//!
//! # Contract
//!
//! - `set_string` / `get_string` on durable string values.
//! - `observe` registers a per-key observer. The current value (possibly
//!   absent) is replayed to the new observer immediately, then every
//!   change is delivered in write order for that key.
//! - Writing the value a key already holds is not a change.
//! - No ordering across keys, no transactions across keys or namespaces.
//!
//! Every change carries a revision that increases monotonically per
//! namespace. Consumers use it to discard re-deliveries.

use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Which side of the process boundary a namespace belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NamespaceKind {
    /// The host application's own namespace
    Main,
    /// Namespace shared with the tunnel extension process
    Group,
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NamespaceKind::Main => write!(f, "main"),
            NamespaceKind::Group => write!(f, "group"),
        }
    }
}

/// A named namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub kind: NamespaceKind,
    /// Platform name of the namespace (suite name, group identifier, ...)
    pub name: String,
}

impl Namespace {
    pub fn main(name: impl Into<String>) -> Self {
        Self {
            kind: NamespaceKind::Main,
            name: name.into(),
        }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self {
            kind: NamespaceKind::Group,
            name: name.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// A change delivered to an observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub namespace: NamespaceKind,
    pub key: String,
    /// New value, `None` if the key is unset
    pub value: Option<String>,
    /// Namespace revision of this write (0 if never written)
    pub revision: u64,
}

/// Observer callback
pub type Observer = Arc<dyn Fn(&StoreChange) + Send + Sync>;

/// Handle for releasing an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt namespace file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A durable, observable string store for one namespace
pub trait ChannelStore: Send + Sync {
    /// Namespace served by this store
    fn namespace(&self) -> &Namespace;

    /// Write a value
    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Read a value
    fn get_string(&self, key: &str) -> Option<String>;

    /// Register an observer; the current value is replayed immediately
    fn observe(&self, key: &str, observer: Observer) -> ObserverId;

    /// Release an observer. Returns false if it was already released.
    fn unobserve(&self, id: ObserverId) -> bool;
}

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub(crate) value: String,
    pub(crate) revision: u64,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, Entry>,
    observers: HashMap<String, Vec<(ObserverId, Observer)>>,
    revision: u64,
    next_observer: u64,
}

/// In-process store
///
/// Observers run synchronously on the writing thread. A reentrant
/// delivery gate serializes deliveries so per-key order matches write
/// order even with concurrent writers; observers may write back into
/// the store from inside a callback.
pub struct MemoryStore {
    namespace: Namespace,
    inner: Mutex<StoreInner>,
    delivery: ReentrantMutex<()>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            inner: Mutex::new(StoreInner::default()),
            delivery: ReentrantMutex::new(()),
        }
    }

    /// Current namespace revision
    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    /// Remove a key, notifying observers with an absent value
    pub fn remove(&self, key: &str) {
        self.apply(key, None, None);
    }

    /// Snapshot of every stored entry
    pub(crate) fn entries(&self) -> HashMap<String, Entry> {
        self.inner.lock().entries.clone()
    }

    /// Apply a change and notify observers.
    ///
    /// `revision` is set when the change originates outside this process
    /// (e.g. a reloaded file); otherwise the next namespace revision is
    /// used. Returns false if nothing changed.
    pub(crate) fn apply(&self, key: &str, value: Option<&str>, revision: Option<u64>) -> bool {
        self.apply_if(key, value, revision, |_| true)
    }

    /// Apply a change read back from disk unless the local entry is
    /// already at `revision` or later.
    pub(crate) fn apply_newer(&self, key: &str, value: Option<&str>, revision: u64) -> bool {
        self.apply_if(key, value, Some(revision), |local| match (local, value) {
            (Some(e), Some(_)) => e.revision < revision,
            (Some(e), None) => e.revision <= revision,
            (None, _) => true,
        })
    }

    fn apply_if<F>(&self, key: &str, value: Option<&str>, revision: Option<u64>, accept: F) -> bool
    where
        F: FnOnce(Option<&Entry>) -> bool,
    {
        let _gate = self.delivery.lock();

        let (change, observers) = {
            let mut inner = self.inner.lock();
            let current = inner.entries.get(key);
            if current.map(|e| e.value.as_str()) == value || !accept(current) {
                return false;
            }

            let revision = match revision {
                Some(r) => {
                    inner.revision = inner.revision.max(r);
                    r
                }
                None => {
                    inner.revision += 1;
                    inner.revision
                }
            };

            match value {
                Some(v) => {
                    inner.entries.insert(
                        key.to_string(),
                        Entry {
                            value: v.to_string(),
                            revision,
                        },
                    );
                }
                None => {
                    inner.entries.remove(key);
                }
            }

            let change = StoreChange {
                namespace: self.namespace.kind,
                key: key.to_string(),
                value: value.map(str::to_string),
                revision,
            };
            let observers: Vec<Observer> = inner
                .observers
                .get(key)
                .map(|list| list.iter().map(|(_, o)| o.clone()).collect())
                .unwrap_or_default();
            (change, observers)
        };

        debug!(
            "{} {} = {:?} (rev {})",
            self.namespace, change.key, change.value, change.revision
        );
        for observer in observers {
            observer(&change);
        }
        true
    }
}

impl ChannelStore for MemoryStore {
    fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.apply(key, Some(value), None);
        Ok(())
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.inner.lock().entries.get(key).map(|e| e.value.clone())
    }

    fn observe(&self, key: &str, observer: Observer) -> ObserverId {
        let _gate = self.delivery.lock();

        let (id, replay) = {
            let mut inner = self.inner.lock();
            inner.next_observer += 1;
            let id = ObserverId(inner.next_observer);
            inner
                .observers
                .entry(key.to_string())
                .or_default()
                .push((id, observer.clone()));

            let entry = inner.entries.get(key);
            let replay = StoreChange {
                namespace: self.namespace.kind,
                key: key.to_string(),
                value: entry.map(|e| e.value.clone()),
                revision: entry.map(|e| e.revision).unwrap_or(0),
            };
            (id, replay)
        };

        observer(&replay);
        id
    }

    fn unobserve(&self, id: ObserverId) -> bool {
        let mut inner = self.inner.lock();
        let mut removed = false;
        for list in inner.observers.values_mut() {
            let before = list.len();
            list.retain(|(oid, _)| *oid != id);
            removed |= list.len() != before;
        }
        inner.observers.retain(|_, list| !list.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Observer, Arc<Mutex<Vec<StoreChange>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: Observer = Arc::new(move |change: &StoreChange| {
            sink.lock().push(change.clone());
        });
        (observer, seen)
    }

    #[test]
    fn test_set_get() {
        let store = MemoryStore::new(Namespace::main("app"));
        assert_eq!(store.get_string("k"), None);

        store.set_string("k", "v").unwrap();
        assert_eq!(store.get_string("k"), Some("v".to_string()));
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn test_replay_on_observe() {
        let store = MemoryStore::new(Namespace::main("app"));
        store.set_string("k", "v").unwrap();

        let (observer, seen) = recorder();
        store.observe("k", observer);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value.as_deref(), Some("v"));
        assert_eq!(seen[0].revision, 1);
    }

    #[test]
    fn test_replay_absent_value() {
        let store = MemoryStore::new(Namespace::group("group.app"));
        let (observer, seen) = recorder();
        store.observe("k", observer);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value, None);
        assert_eq!(seen[0].revision, 0);
        assert_eq!(seen[0].namespace, NamespaceKind::Group);
    }

    #[test]
    fn test_same_value_is_not_a_change() {
        let store = MemoryStore::new(Namespace::main("app"));
        let (observer, seen) = recorder();
        store.observe("k", observer);

        store.set_string("k", "v").unwrap();
        store.set_string("k", "v").unwrap();
        store.set_string("k", "w").unwrap();

        let values: Vec<_> = seen.lock().iter().map(|c| c.value.clone()).collect();
        assert_eq!(values, vec![None, Some("v".into()), Some("w".into())]);
    }

    #[test]
    fn test_other_keys_not_delivered() {
        let store = MemoryStore::new(Namespace::main("app"));
        let (observer, seen) = recorder();
        store.observe("a", observer);

        store.set_string("b", "x").unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_unobserve() {
        let store = MemoryStore::new(Namespace::main("app"));
        let (observer, seen) = recorder();
        let id = store.observe("k", observer);

        assert!(store.unobserve(id));
        assert!(!store.unobserve(id));

        store.set_string("k", "v").unwrap();
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_remove_notifies_absent() {
        let store = MemoryStore::new(Namespace::main("app"));
        store.set_string("k", "v").unwrap();
        let (observer, seen) = recorder();
        store.observe("k", observer);

        store.remove("k");
        assert_eq!(store.get_string("k"), None);
        assert_eq!(seen.lock().last().unwrap().value, None);
    }

    #[test]
    fn test_observer_may_write_back() {
        let store = Arc::new(MemoryStore::new(Namespace::main("app")));
        let writer = store.clone();
        store.observe(
            "ping",
            Arc::new(move |change: &StoreChange| {
                if change.value.is_some() {
                    writer.set_string("pong", "1").unwrap();
                }
            }),
        );

        store.set_string("ping", "1").unwrap();
        assert_eq!(store.get_string("pong"), Some("1".to_string()));
    }

    #[test]
    fn test_apply_newer_keeps_later_revision() {
        let store = MemoryStore::new(Namespace::group("group.app"));
        assert!(store.apply_newer("vpnStatusGroup", Some("CONNECTED"), 5));

        // An older read of the file lands late
        assert!(!store.apply_newer("vpnStatusGroup", Some("CONNECTING"), 4));
        assert!(!store.apply_newer("vpnStatusGroup", None, 4));
        assert_eq!(store.get_string("vpnStatusGroup"), Some("CONNECTED".to_string()));

        assert!(store.apply_newer("vpnStatusGroup", None, 6));
        assert_eq!(store.get_string("vpnStatusGroup"), None);
        assert_eq!(store.revision(), 6);
    }
}
