//! File-backed namespace
//!
//! Persists one namespace as a JSON document so values survive restarts
//! and can be shared with another process that opens the same file.
//! Writes go to a uniquely named temp file that is renamed over the
//! original, so a reader never sees a half-written document.
//!
//! Every handle on the file coordinates through an advisory lock on a
//! sibling `.lock` file: writers hold it exclusively across the
//! read-modify-write, readers hold it shared. Observers are notified
//! after the lock is released, and only for changes that reached disk.
//!
//! Changes made by another process are picked up by [`FileStore::refresh`],
//! either called directly or periodically via [`FileStore::spawn_poller`].

use crate::config::SessionConfig;
use crate::store::{ChannelStore, MemoryStore, Namespace, Observer, ObserverId, StoreError};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// On-disk form of a namespace
#[derive(Debug, Default, Serialize, Deserialize)]
struct NamespaceFile {
    revision: u64,
    #[serde(default)]
    entries: BTreeMap<String, FileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    revision: u64,
}

/// A change read back from disk, waiting to be applied in memory
struct Update {
    key: String,
    value: Option<String>,
    revision: u64,
}

/// Held while the namespace file is being read or rewritten.
///
/// flock is per open file, so threads sharing this handle also take the
/// in-process mutex first.
struct NamespaceLock<'a> {
    file: &'a File,
    _local: MutexGuard<'a, ()>,
}

impl Drop for NamespaceLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(self.file) {
            warn!("Failed to release namespace lock: {}", e);
        }
    }
}

/// Durable namespace stored in a single JSON file
pub struct FileStore {
    path: PathBuf,
    memory: MemoryStore,
    lock_file: File,
    local_lock: Mutex<()>,
}

impl FileStore {
    /// Open (or create on first write) the namespace file at `path`
    pub fn open(namespace: Namespace, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path.with_extension("lock"))?;

        let store = Self {
            path,
            memory: MemoryStore::new(namespace),
            lock_file,
            local_lock: Mutex::new(()),
        };
        let loaded = store.refresh()?;

        info!(
            "Opened namespace {} at {} ({} keys)",
            store.memory.namespace(),
            store.path.display(),
            loaded
        );
        Ok(store)
    }

    /// Path of the namespace file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reload the file and notify observers of every key that changed.
    ///
    /// Returns the number of keys that changed.
    pub fn refresh(&self) -> Result<usize, StoreError> {
        let updates = {
            let _lock = self.lock(false)?;
            match self.read_file()? {
                Some(disk) => self.diff(&disk),
                None => return Ok(0),
            }
        };

        let changed = self.apply(updates);
        if changed > 0 {
            debug!("Refreshed {}: {} keys changed", self.memory.namespace(), changed);
        }
        Ok(changed)
    }

    /// Refresh periodically until the store is dropped
    pub fn spawn_poller(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;

                let Some(store) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = store.refresh() {
                    warn!("Refresh of {} failed: {}", store.path.display(), e);
                }
            }
        })
    }

    fn lock(&self, exclusive: bool) -> Result<NamespaceLock<'_>, StoreError> {
        let local = self.local_lock.lock();
        if exclusive {
            fs2::FileExt::lock_exclusive(&self.lock_file)?;
        } else {
            fs2::FileExt::lock_shared(&self.lock_file)?;
        }
        Ok(NamespaceLock {
            file: &self.lock_file,
            _local: local,
        })
    }

    fn read_file(&self) -> Result<Option<NamespaceFile>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(Some(NamespaceFile::default())),
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_file(&self, file: &NamespaceFile) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(serde_json::to_string_pretty(file)?.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Entries on disk that differ from memory
    fn diff(&self, disk: &NamespaceFile) -> Vec<Update> {
        let local = self.memory.entries();
        let mut updates = Vec::new();

        for (key, entry) in &disk.entries {
            let newer = local
                .get(key)
                .map(|l| l.revision < entry.revision)
                .unwrap_or(true);
            if newer {
                updates.push(Update {
                    key: key.clone(),
                    value: Some(entry.value.clone()),
                    revision: entry.revision,
                });
            }
        }

        for (key, entry) in &local {
            if !disk.entries.contains_key(key) && entry.revision <= disk.revision {
                updates.push(Update {
                    key: key.clone(),
                    value: None,
                    revision: disk.revision,
                });
            }
        }
        updates
    }

    fn apply(&self, updates: Vec<Update>) -> usize {
        updates
            .into_iter()
            .filter(|u| self.memory.apply_newer(&u.key, u.value.as_deref(), u.revision))
            .count()
    }
}

/// File-backed namespaces described by a configuration
pub struct Namespaces {
    pub main: Arc<FileStore>,
    /// Present when the engine runs in an extension process
    pub group: Option<Arc<FileStore>>,
}

impl Namespaces {
    /// Open the main namespace and, on isolated platforms, the group
    /// namespace under `config.store_dir` (default: `<tmp>/tunlink`)
    pub fn open(config: &SessionConfig) -> Result<Self, StoreError> {
        let dir = config
            .store_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("tunlink"));

        let main = FileStore::open(
            Namespace::main(config.main_namespace.clone()),
            dir.join(format!("{}.json", config.main_namespace)),
        )?;

        let group = match config.isolation() {
            Some(isolation) if config.platform.isolates_engine() => Some(Arc::new(FileStore::open(
                Namespace::group(isolation.group_identifier.clone()),
                dir.join(format!("{}.json", isolation.group_identifier)),
            )?)),
            _ => None,
        };

        Ok(Self {
            main: Arc::new(main),
            group,
        })
    }

    /// Poll every namespace for changes made by other processes
    pub fn spawn_pollers(&self, interval: Duration) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.main.spawn_poller(interval)];
        handles.extend(self.group.iter().map(|g| g.spawn_poller(interval)));
        handles
    }

    /// Main namespace as a trait object
    pub fn main_store(&self) -> Arc<dyn ChannelStore> {
        self.main.clone()
    }

    /// Group namespace as a trait object
    pub fn group_store(&self) -> Option<Arc<dyn ChannelStore>> {
        self.group.clone().map(|g| g as Arc<dyn ChannelStore>)
    }
}

impl ChannelStore for FileStore {
    fn namespace(&self) -> &Namespace {
        self.memory.namespace()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let updates = {
            let _lock = self.lock(true)?;

            // Start from the file so writes from other processes survive
            let mut disk = self.read_file()?.unwrap_or_default();
            if disk.entries.get(key).map(|e| e.value.as_str()) != Some(value) {
                disk.revision = disk.revision.max(self.memory.revision()) + 1;
                disk.entries.insert(
                    key.to_string(),
                    FileEntry {
                        value: value.to_string(),
                        revision: disk.revision,
                    },
                );
                self.write_file(&disk)?;
            }
            self.diff(&disk)
        };

        self.apply(updates);
        Ok(())
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.memory.get_string(key)
    }

    fn observe(&self, key: &str, observer: Observer) -> ObserverId {
        self.memory.observe(key, observer)
    }

    fn unobserve(&self, id: ObserverId) -> bool {
        self.memory.unobserve(id)
    }
}
