//! Registry of open stores
//!
//! Opening the same path twice in one process must yield the same handle:
//! two `Store`s over one file would each keep their own index and clobber
//! each other's appends. The registry hands out shared `Arc<Store>`s keyed
//! by the canonical data file path.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::engine::Store;
use crate::error::{MapKvError, Result};

#[derive(Debug)]
enum Slot {
    Open(Arc<Store>),
    /// Closed through the registry while callers still held handles.
    /// Reopening the path hands the same store back.
    Detached(Weak<Store>),
}

impl Slot {
    fn open_store(&self) -> Option<&Arc<Store>> {
        match self {
            Slot::Open(store) => Some(store),
            Slot::Detached(_) => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct Registry {
    stores: Mutex<HashMap<PathBuf, Slot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::new)
    }

    /// Return the open store for `config.path`, opening it if needed
    ///
    /// An already-open store must be asked for with the same encryption key.
    pub fn open(&self, mut config: Config) -> Result<Arc<Store>> {
        config.validate()?;
        let path = canonical_path(&config.path)?;

        let mut stores = self.stores.lock();
        let existing = match stores.get(&path) {
            Some(Slot::Open(store)) => Some(Arc::clone(store)),
            Some(Slot::Detached(weak)) => weak.upgrade(),
            None => None,
        };
        if let Some(store) = existing {
            if !store.has_encryption_key(config.encryption_key.as_deref()) {
                return Err(MapKvError::Open(format!(
                    "{} is already open with a different encryption key",
                    path.display()
                )));
            }
            stores.insert(path, Slot::Open(Arc::clone(&store)));
            return Ok(store);
        }

        config.path = path.clone();
        let store = Arc::new(Store::open(config)?);
        stores.insert(path, Slot::Open(Arc::clone(&store)));
        Ok(store)
    }

    /// The open store for `path`, if any
    pub fn get(&self, path: impl AsRef<Path>) -> Option<Arc<Store>> {
        let path = canonical_path(path.as_ref()).ok()?;
        self.stores.lock().get(&path)?.open_store().cloned()
    }

    /// Forget the store at `path`. If no other handle is alive it is closed
    /// (flushed) now; otherwise it closes when the last handle drops, and
    /// opening the path again before then returns that same store.
    pub fn close(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = canonical_path(path.as_ref())?;
        let mut stores = self.stores.lock();
        let store = match stores.remove(&path) {
            Some(Slot::Open(store)) => store,
            Some(Slot::Detached(weak)) => {
                if weak.strong_count() > 0 {
                    stores.insert(path, Slot::Detached(weak));
                }
                return Ok(false);
            }
            None => return Ok(false),
        };
        match Arc::try_unwrap(store) {
            Ok(store) => store.close()?,
            Err(store) => {
                debug!(path = %path.display(), "store still referenced; closing on last drop");
                stores.insert(path, Slot::Detached(Arc::downgrade(&store)));
            }
        }
        Ok(true)
    }

    /// Close every registered store
    pub fn close_all(&self) {
        let mut stores = self.stores.lock();
        let slots: Vec<(PathBuf, Slot)> = stores.drain().collect();
        for (path, slot) in slots {
            let store = match slot {
                Slot::Open(store) => store,
                Slot::Detached(weak) => {
                    if weak.strong_count() > 0 {
                        stores.insert(path, Slot::Detached(weak));
                    }
                    continue;
                }
            };
            match Arc::try_unwrap(store) {
                Ok(store) => {
                    if let Err(e) = store.close() {
                        warn!(path = %path.display(), error = %e, "failed to close store");
                    }
                }
                Err(store) => {
                    stores.insert(path, Slot::Detached(Arc::downgrade(&store)));
                }
            }
        }
    }

    /// Number of stores currently registered as open
    pub fn len(&self) -> usize {
        self.stores
            .lock()
            .values()
            .filter(|slot| slot.open_store().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical parent directory joined with the file name. The data file
/// itself may not exist yet, so only the parent is canonicalized.
fn canonical_path(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| MapKvError::Config(format!("{} has no file name", path.display())))?;
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    Ok(fs::canonicalize(&parent)?.join(file_name))
}
