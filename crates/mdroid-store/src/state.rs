//! [`StateStore`] – the shared picture of the vehicle.
//!
//! A single coarse lock guards a map from canonical key to [`Entry`].
//! Writes stamp the entry, release the lock, and only then notify the
//! [`HookRegistry`] and the broadcast change feed, so subscribers never run
//! while the map is locked.
//!
//! Values are always stored as canonical strings.  Typed reads go through
//! [`StateValue`] and report parse failures instead of defaulting.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use mdroid_types::{Entry, StateChange, StateError, StateValue, canonical_key};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::error::PersistError;
use crate::hooks::HookRegistry;

/// Number of buffered changes before slow feed subscribers start lagging.
const DEFAULT_FEED_CAPACITY: usize = 256;

/// Thread-safe key/value store with change timestamps.
///
/// Share it behind an [`Arc`]; every component that reads or writes vehicle
/// state holds a handle to the same store.
pub struct StateStore {
    entries: Mutex<HashMap<String, Entry>>,
    hooks: Arc<HookRegistry>,
    feed: broadcast::Sender<StateChange>,
}

impl StateStore {
    /// Create an empty store that notifies `hooks` on every write.
    pub fn new(hooks: Arc<HookRegistry>) -> Self {
        Self::with_feed_capacity(hooks, DEFAULT_FEED_CAPACITY)
    }

    /// Create an empty store whose change feed buffers `capacity` changes.
    pub fn with_feed_capacity(hooks: Arc<HookRegistry>, capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity);
        Self {
            entries: Mutex::new(HashMap::new()),
            hooks,
            feed,
        }
    }

    /// The hook registry this store notifies.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Replace the value under `key` and return the entry it replaced.
    ///
    /// The new entry's timestamp is never older than the one it replaces.
    /// Hooks and feed subscribers are notified after the lock is released.
    pub fn set(&self, key: &str, value: impl Into<String>) -> Option<Entry> {
        let key = canonical_key(key);
        let value = value.into();

        let (entry, previous) = {
            let mut entries = self.lock();
            let mut stamp = Utc::now();
            if let Some(prev) = entries.get(&key)
                && prev.last_update > stamp
            {
                stamp = prev.last_update;
            }
            let entry = Entry {
                key: key.clone(),
                value,
                last_update: stamp,
            };
            let previous = entries.insert(key.clone(), entry.clone());
            (entry, previous)
        };

        trace!(key = %key, value = %entry.value, "state set");

        let change = StateChange {
            key,
            entry,
            previous: previous.clone(),
        };
        self.hooks.fire(&change);
        // No feed subscribers is the normal case.
        let _ = self.feed.send(change);
        previous
    }

    /// Seed the store without firing hooks or publishing changes.
    ///
    /// Used to restore a saved session at boot.
    pub fn restore(&self, restored: impl IntoIterator<Item = Entry>) -> usize {
        let mut entries = self.lock();
        let mut count = 0;
        for mut entry in restored {
            entry.key = canonical_key(&entry.key);
            entries.insert(entry.key.clone(), entry);
            count += 1;
        }
        count
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Return a copy of the entry under `key`.
    pub fn get(&self, key: &str) -> Result<Entry, StateError> {
        let key = canonical_key(key);
        self.lock()
            .get(&key)
            .cloned()
            .ok_or(StateError::NotFound(key))
    }

    /// Parse the value under `key` as `T`.
    pub fn get_typed<T: StateValue>(&self, key: &str) -> Result<T, StateError> {
        self.get(key)?.parse()
    }

    /// `true` once `key` has been written at least once.
    pub fn is_set(&self, key: &str) -> bool {
        self.lock().contains_key(&canonical_key(key))
    }

    /// Typed boolean read with a caller-chosen fallback.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_typed(key).unwrap_or_else(|e| {
            debug!(key = %key, error = %e, default, "falling back to default");
            default
        })
    }

    /// String read with a caller-chosen fallback for missing keys.
    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        match self.get(key) {
            Ok(entry) => entry.value,
            Err(_) => default.to_string(),
        }
    }

    /// Copy of the full map.
    pub fn snapshot(&self) -> HashMap<String, Entry> {
        self.lock().clone()
    }

    /// Number of keys currently held.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Subscribe to every subsequent write.
    ///
    /// The receiver reports `Lagged` if it falls more than the feed capacity
    /// behind; callers can resynchronise with [`StateStore::snapshot`].
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.feed.subscribe()
    }

    // -----------------------------------------------------------------------
    // Session file
    // -----------------------------------------------------------------------

    /// Restore entries saved by [`StateStore::save_session`].
    ///
    /// A missing file restores nothing and is not an error.
    pub fn load_session(&self, path: &Path) -> Result<usize, PersistError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no saved session; starting empty");
                return Ok(0);
            }
            Err(e) => return Err(PersistError::io(path, e)),
        };
        let saved: BTreeMap<String, Entry> =
            serde_json::from_slice(&raw).map_err(|e| PersistError::json(path, e))?;
        let restored = self.restore(saved.into_iter().map(|(key, mut entry)| {
            entry.key = key;
            entry
        }));
        info!(path = %path.display(), restored, "session restored");
        Ok(restored)
    }

    /// Overwrite `path` with the current snapshot.
    pub fn save_session(&self, path: &Path) -> Result<(), PersistError> {
        let ordered: BTreeMap<String, Entry> = self.snapshot().into_iter().collect();
        let raw = serde_json::to_vec_pretty(&ordered).map_err(|e| PersistError::json(path, e))?;
        std::fs::write(path, raw).map_err(|e| PersistError::io(path, e))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
