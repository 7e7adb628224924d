//! [`SettingsStore`] – user-defined `component → name → value` settings that
//! persist across runs.
//!
//! Every [`SettingsStore::set`] rewrites the whole settings file while the
//! in-process mutex is held; there is no cross-process locking, so the last
//! writer wins.  After the write the component's hooks fire, with the
//! [`StateChange`] key set to the canonical component name and the entry key
//! set to `COMPONENT.NAME`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mdroid_types::{Entry, StateChange, StateError, canonical_key};
use tracing::{info, warn};

use crate::error::PersistError;
use crate::hooks::HookRegistry;

type SettingsMap = BTreeMap<String, BTreeMap<String, String>>;

/// Persisted settings with per-component change hooks.
pub struct SettingsStore {
    path: Option<PathBuf>,
    values: Mutex<SettingsMap>,
    hooks: Arc<HookRegistry>,
}

impl SettingsStore {
    /// Open (or start) the settings file at `path`.
    ///
    /// A missing file yields empty settings; it is created on the first
    /// [`SettingsStore::set`].  A file that exists but does not parse is an
    /// error so that a typo never silently wipes the user's settings.
    pub fn open(path: impl Into<PathBuf>, hooks: Arc<HookRegistry>) -> Result<Self, PersistError> {
        let path = path.into();
        let values = match std::fs::read(&path) {
            Ok(raw) => {
                let loaded: SettingsMap =
                    serde_json::from_slice(&raw).map_err(|e| PersistError::json(&path, e))?;
                canonicalise(loaded)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "settings file absent; starting with defaults");
                SettingsMap::new()
            }
            Err(e) => return Err(PersistError::io(&path, e)),
        };
        Ok(Self {
            path: Some(path),
            values: Mutex::new(values),
            hooks,
        })
    }

    /// Settings that live only in memory (tests, or no settings file configured).
    pub fn in_memory(hooks: Arc<HookRegistry>) -> Self {
        Self {
            path: None,
            values: Mutex::new(SettingsMap::new()),
            hooks,
        }
    }

    /// The hook registry fired on setting changes.
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// Value of `component.name`.
    pub fn get(&self, component: &str, name: &str) -> Result<String, StateError> {
        let component = canonical_key(component);
        let name = canonical_key(name);
        self.lock()
            .get(&component)
            .and_then(|settings| settings.get(&name))
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("{component}.{name}")))
    }

    /// Value of `component.name`, or `default` when unset.
    pub fn get_or(&self, component: &str, name: &str, default: &str) -> String {
        self.get(component, name).unwrap_or_else(|_| default.to_string())
    }

    /// Update `component.name`, rewrite the settings file, then fire the
    /// component's hooks.
    ///
    /// The in-memory value is updated even when the file write fails; the
    /// error is returned so the caller can report it.
    pub fn set(&self, component: &str, name: &str, value: &str) -> Result<(), PersistError> {
        let component = canonical_key(component);
        let name = canonical_key(name);

        let (previous, written) = {
            let mut values = self.lock();
            let previous = values
                .entry(component.clone())
                .or_default()
                .insert(name.clone(), value.to_string());
            let written = match &self.path {
                Some(path) => write_file(path, &values),
                None => Ok(()),
            };
            (previous, written)
        };

        info!(component = %component, setting = %name, value = %value, "setting updated");
        if let Err(e) = &written {
            warn!(error = %e, "settings file not updated");
        }

        let entry_key = format!("{component}.{name}");
        let change = StateChange {
            key: component,
            entry: Entry::now(entry_key.clone(), value),
            previous: previous.map(|value| Entry::now(entry_key, value)),
        };
        self.hooks.fire(&change);
        written
    }

    /// Copy of every setting.
    pub fn all(&self) -> BTreeMap<String, BTreeMap<String, String>> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, SettingsMap> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn canonicalise(loaded: SettingsMap) -> SettingsMap {
    loaded
        .into_iter()
        .map(|(component, settings)| {
            let settings = settings
                .into_iter()
                .map(|(name, value)| (canonical_key(&name), value))
                .collect();
            (canonical_key(&component), settings)
        })
        .collect()
}

fn write_file(path: &Path, values: &SettingsMap) -> Result<(), PersistError> {
    let raw = serde_json::to_vec_pretty(values).map_err(|e| PersistError::json(path, e))?;
    std::fs::write(path, raw).map_err(|e| PersistError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{Cooldown, hook_fn};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn set_then_get_is_case_insensitive() {
        let settings = SettingsStore::in_memory(Arc::new(HookRegistry::new()));
        settings.set("angel_eyes", "power", "AUTO").unwrap();
        assert_eq!(settings.get("ANGEL_EYES", "POWER").unwrap(), "AUTO");
        assert_eq!(
            settings.get("BOARD", "POWER"),
            Err(StateError::NotFound("BOARD.POWER".to_string()))
        );
        assert_eq!(settings.get_or("BOARD", "POWER", "AUTO"), "AUTO");
    }

    #[tokio::test]
    async fn every_set_overwrites_the_whole_file() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("settings.json");
        let hooks = Arc::new(HookRegistry::new());

        let settings = SettingsStore::open(&path, Arc::clone(&hooks)).unwrap();
        settings.set("WIRELESS", "POWER", "ON").unwrap();
        settings.set("MDROID", "AUTOLOCK", "AUTO").unwrap();

        let reopened = SettingsStore::open(&path, hooks).unwrap();
        assert_eq!(reopened.get("WIRELESS", "POWER").unwrap(), "ON");
        assert_eq!(reopened.get("MDROID", "AUTOLOCK").unwrap(), "AUTO");
        assert_eq!(reopened.all().len(), 2);
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "[1, 2").unwrap();
        let result = SettingsStore::open(&path, Arc::new(HookRegistry::new()));
        assert!(matches!(result, Err(PersistError::Json { .. })));
    }

    #[tokio::test]
    async fn loaded_names_are_canonicalised() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"angel_eyes": {"power": "OFF"}}"#).unwrap();
        let settings = SettingsStore::open(&path, Arc::new(HookRegistry::new())).unwrap();
        assert_eq!(settings.get("ANGEL_EYES", "POWER").unwrap(), "OFF");
    }

    #[tokio::test]
    async fn set_fires_component_hooks() {
        let hooks = Arc::new(HookRegistry::new());
        let settings = SettingsStore::in_memory(Arc::clone(&hooks));
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        hooks.register(
            "ANGEL_EYES",
            Cooldown::Always,
            hook_fn(move |change| {
                let seen = Arc::clone(&seen);
                async move {
                    assert_eq!(change.entry.key, "ANGEL_EYES.POWER");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        settings.set("angel_eyes", "power", "ON").unwrap();
        settings.set("BOARD", "POWER", "ON").unwrap();
        hooks.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
