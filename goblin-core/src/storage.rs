// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! On-disk persistence of the goblin registry.
//!
//! The registry is written as one JSON document so separate CLI invocations
//! see the same goblins. Writes go to a temporary file that is renamed over
//! the old snapshot, so a reader never observes a half-written file.
//!
//! Updates hold an exclusive `flock` on `goblins.lock` and re-read the
//! snapshot before applying a change, so two processes updating different
//! goblins never drop each other's records.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::error::{GoblinError, GoblinResult};
use crate::registry::{Goblin, GoblinRegistry};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistrySnapshot {
    version: u32,
    goblins: Vec<Goblin>,
}

/// Exclusive `flock` on a lock file, released when dropped.
pub struct FileLock {
    path: PathBuf,
    _flock: Flock<File>,
}

impl FileLock {
    /// Block until the lock is held.
    pub fn acquire(path: &Path) -> GoblinResult<Self> {
        Self::lock(path, FlockArg::LockExclusive)?.ok_or_else(|| GoblinError::Io {
            context: "locking",
            path: path.to_path_buf(),
            source: std::io::Error::from(Errno::EWOULDBLOCK),
        })
    }

    /// Take the lock if nobody holds it. `Ok(None)` means it is taken.
    pub fn try_acquire(path: &Path) -> GoblinResult<Option<Self>> {
        Self::lock(path, FlockArg::LockExclusiveNonblock)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(path: &Path, arg: FlockArg) -> GoblinResult<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GoblinError::Io {
                context: "creating lock directory",
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| GoblinError::Io {
                context: "opening lock file",
                path: path.to_path_buf(),
                source: e,
            })?;

        match Flock::lock(file, arg) {
            Ok(flock) => Ok(Some(Self {
                path: path.to_path_buf(),
                _flock: flock,
            })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(GoblinError::Io {
                context: "locking",
                path: path.to_path_buf(),
                source: std::io::Error::from(errno),
            }),
        }
    }
}

impl fmt::Debug for FileLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLock").field("path", &self.path).finish()
    }
}

/// JSON file backing a [`GoblinRegistry`].
#[derive(Debug)]
pub struct RegistryStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RegistryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `goblins.lock` next to the snapshot.
    pub fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Read all persisted goblins. A missing file is an empty registry.
    pub fn load(&self) -> GoblinResult<Vec<Goblin>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(GoblinError::Io {
                    context: "reading registry",
                    path: self.path.clone(),
                    source: e,
                })
            }
        };

        let snapshot: RegistrySnapshot =
            serde_json::from_str(&content).map_err(|e| self.persistence_error(e))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(GoblinError::Persistence {
                path: self.path.clone(),
                message: format!("unsupported snapshot version {}", snapshot.version),
            });
        }

        tracing::debug!(
            path = %self.path.display(),
            goblins = snapshot.goblins.len(),
            "Registry loaded"
        );
        Ok(snapshot.goblins)
    }

    /// Load the snapshot into `registry`, replacing its content.
    pub fn load_into(&self, registry: &GoblinRegistry) -> GoblinResult<usize> {
        let goblins = self.load()?;
        let count = goblins.len();
        registry.restore_from_snapshot(goblins);
        Ok(count)
    }

    /// Bring `registry` up to date with the snapshot on disk.
    pub fn refresh(&self, registry: &GoblinRegistry) -> GoblinResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = FileLock::acquire(&self.lock_path())?;
        registry.merge_snapshot(self.load()?);
        Ok(())
    }

    /// Apply `update` to `registry` and persist the result.
    ///
    /// The registry lock is held from reading the current snapshot until the
    /// new one is renamed into place. Nothing is written if `update` fails.
    pub fn update<T>(
        &self,
        registry: &GoblinRegistry,
        update: impl FnOnce(&GoblinRegistry) -> GoblinResult<T>,
    ) -> GoblinResult<T> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = FileLock::acquire(&self.lock_path())?;
        registry.merge_snapshot(self.load()?);
        let value = update(registry)?;
        self.write(registry)?;
        Ok(value)
    }

    /// Atomically persist the current content of `registry`.
    pub fn save(&self, registry: &GoblinRegistry) -> GoblinResult<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let _lock = FileLock::acquire(&self.lock_path())?;
        self.write(registry)
    }

    fn write(&self, registry: &GoblinRegistry) -> GoblinResult<()> {
        let snapshot = RegistrySnapshot {
            version: SNAPSHOT_VERSION,
            goblins: registry.list(),
        };
        let json = serde_json::to_string_pretty(&snapshot).map_err(|e| self.persistence_error(e))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GoblinError::Io {
                context: "creating registry directory",
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| GoblinError::Io {
            context: "writing registry",
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| GoblinError::Io {
            context: "replacing registry",
            path: self.path.clone(),
            source: e,
        })?;

        tracing::debug!(
            path = %self.path.display(),
            goblins = snapshot.goblins.len(),
            "Registry saved"
        );
        Ok(())
    }

    fn persistence_error(&self, e: serde_json::Error) -> GoblinError {
        GoblinError::Persistence {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProcessId;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path().join("goblins.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path().join("nested").join("goblins.json"));

        let registry = GoblinRegistry::new();
        let goblin = registry
            .create(ProcessId::new(321).unwrap(), Some(vec!["sleep".into(), "60".into()]))
            .unwrap();
        store.save(&registry).unwrap();
        assert!(!store.path().with_extension("json.tmp").exists());

        let restored = GoblinRegistry::new();
        assert_eq!(store.load_into(&restored).unwrap(), 1);
        let loaded = restored.get(&goblin.id).unwrap();
        assert_eq!(loaded.pid, goblin.pid);
        assert_eq!(loaded.command, goblin.command);
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("goblins.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = RegistryStore::new(path);
        assert!(matches!(store.load(), Err(GoblinError::Persistence { .. })));
    }

    #[test]
    fn test_updates_from_stale_registries_merge() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path().join("goblins.json"));

        // Two registries loaded from the same (empty) snapshot.
        let first = GoblinRegistry::new();
        let second = GoblinRegistry::new();
        store.load_into(&first).unwrap();
        store.load_into(&second).unwrap();

        let a = store
            .update(&first, |r| r.create(ProcessId::new(100).unwrap(), None))
            .unwrap();
        let b = store
            .update(&second, |r| r.create(ProcessId::new(200).unwrap(), None))
            .unwrap();

        let ids: Vec<_> = store.load().unwrap().into_iter().map(|g| g.id).collect();
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
        assert!(second.contains(&a.id));
    }

    #[test]
    fn test_failed_update_writes_nothing() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = RegistryStore::new(dir.path().join("goblins.json"));
        let registry = GoblinRegistry::new();

        let missing = crate::types::GoblinId::new("missing").unwrap();
        let result = store.update(&registry, |r| r.get(&missing));
        assert!(matches!(result, Err(GoblinError::NotFound(_))));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_try_acquire_is_exclusive() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("gob").join(".transition.lock");

        let held = FileLock::try_acquire(&path).unwrap().unwrap();
        assert_eq!(held.path(), path.as_path());
        assert!(FileLock::try_acquire(&path).unwrap().is_none());

        drop(held);
        assert!(FileLock::try_acquire(&path).unwrap().is_some());
    }
}
