use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// Prefix of blobs that are still being written by a derivative install.
pub const TEMP_PREFIX: &str = ".tmp-";

/// Errors raised by the blob store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store directory {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Invalid blob name: {0:?}")]
    InvalidName(String),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Store I/O error on {name}: {source}")]
    Io { name: String, source: io::Error },
}

impl StoreError {
    fn io(name: &str, source: io::Error) -> Self {
        if source.kind() == ErrorKind::NotFound {
            Self::NotFound(name.to_string())
        } else {
            Self::Io {
                name: name.to_string(),
                source,
            }
        }
    }
}

/// Flat directory of named blobs.
///
/// Every blob lives directly under the root. Names are caller supplied, so
/// anything that could escape the root (separators, `.`/`..`) is rejected.
/// Mutations that must not interleave for the same base name are serialized
/// through [`Store::lock`].
#[derive(Debug)]
pub struct Store {
    root: PathBuf,
    locks: LockRegistry,
}

impl Store {
    /// Open the store, creating the root directory if needed.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|source| StoreError::Open {
            path: root.clone(),
            source,
        })?;

        let metadata = fs::metadata(&root).map_err(|source| StoreError::Open {
            path: root.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(StoreError::Open {
                path: root,
                source: io::Error::new(ErrorKind::Other, "not a directory"),
            });
        }

        info!(root = %root.display(), "Blob store opened");

        Ok(Self {
            root,
            locks: LockRegistry::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a blob name to its path under the root.
    pub fn blob_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    pub fn exists(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.blob_path(name)?.is_file())
    }

    /// Open a blob for reading.
    pub fn open_blob(&self, name: &str) -> Result<File, StoreError> {
        let path = self.blob_path(name)?;
        File::open(path).map_err(|e| StoreError::io(name, e))
    }

    /// Read a whole blob into memory.
    pub fn read(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.blob_path(name)?;
        fs::read(path).map_err(|e| StoreError::io(name, e))
    }

    /// Create (or truncate) a blob for writing.
    pub fn create(&self, name: &str) -> Result<File, StoreError> {
        let path = self.blob_path(name)?;
        File::create(path).map_err(|e| StoreError::io(name, e))
    }

    /// Remove a blob. Returns false if it did not exist.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.blob_path(name)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(name, e)),
        }
    }

    /// Atomically move blob `from` to `to`, replacing any existing `to`.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let source = self.blob_path(from)?;
        let target = self.blob_path(to)?;
        fs::rename(source, target).map_err(|e| StoreError::io(from, e))
    }

    /// Delete every blob whose name starts with `base`, including `base` itself.
    ///
    /// This is how derivatives (`<base>-<width>`) are invalidated when the
    /// canonical blob is replaced. Names that merely share the prefix are
    /// removed as well. In-flight temporary blobs ([`TEMP_PREFIX`]) are left
    /// alone. Callers should hold the lock for `base`.
    #[instrument(skip(self))]
    pub fn purge_prefix(&self, base: &str) -> Result<usize, StoreError> {
        validate_name(base)?;

        let entries = fs::read_dir(&self.root).map_err(|e| StoreError::io(base, e))?;
        let mut removed = 0;

        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(base, e))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !name.starts_with(base) || name.starts_with(TEMP_PREFIX) {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!(blob = %name, "Purged blob");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(name, e)),
            }
        }

        Ok(removed)
    }

    /// Purge `name` and its derivatives, then create it empty for writing.
    ///
    /// The lock for `name` is taken before the purge and handed back with the
    /// file. Keep the guard until the contents are complete so no derivative
    /// is computed from a partial blob.
    pub fn replace(&self, name: &str) -> Result<(File, KeyGuard<'_>), StoreError> {
        let path = self.blob_path(name)?;

        let guard = self.lock(name);
        let purged = self.purge_prefix(name)?;
        if purged > 0 {
            debug!(blob = %name, purged, "Removed previous versions before write");
        }

        let file = File::create(path).map_err(|e| StoreError::io(name, e))?;
        Ok((file, guard))
    }

    /// Acquire the exclusive lock for a base name.
    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        self.locks.lock(key)
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);

    if invalid {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Set of currently held keys; waiters block until the key is released.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

impl LockRegistry {
    pub fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mut held = self.held.lock();
        while held.contains(key) {
            self.released.wait(&mut held);
        }
        held.insert(key.to_string());

        KeyGuard {
            registry: self,
            key: key.to_string(),
        }
    }

    #[cfg(test)]
    fn is_locked(&self, key: &str) -> bool {
        self.held.lock().contains(key)
    }
}

/// Releases its key on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    registry: &'a LockRegistry,
    key: String,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.registry.held.lock().remove(&self.key);
        self.registry.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("blobs")).unwrap();
        (dir, store)
    }

    fn write_blob(store: &Store, name: &str, contents: &[u8]) {
        store.create(name).unwrap().write_all(contents).unwrap();
    }

    #[test]
    fn test_open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("nested").join("store");
        let store = Store::open(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(store.root(), root.as_path());
    }

    #[test]
    fn test_open_fails_on_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("occupied");
        fs::write(&file_path, b"x").unwrap();
        assert!(matches!(
            Store::open(&file_path),
            Err(StoreError::Open { .. })
        ));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let (_dir, store) = open_temp();
        for name in ["", ".", "..", "../escape", "a/b", "a\\b", "nul\0"] {
            assert!(
                matches!(store.blob_path(name), Err(StoreError::InvalidName(_))),
                "accepted {name:?}"
            );
        }
        assert!(store.blob_path("photo.jpg").is_ok());
        assert!(store.blob_path(".tmp-photo.jpg-100").is_ok());
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let (_dir, store) = open_temp();
        assert!(matches!(store.read("missing"), Err(StoreError::NotFound(_))));
        assert!(!store.exists("missing").unwrap());
    }

    #[test]
    fn test_replace_purges_prefixed_blobs() {
        let (_dir, store) = open_temp();
        write_blob(&store, "a.txt", b"old");
        write_blob(&store, "a.txt-100", b"derivative");
        write_blob(&store, "a.txtX", b"shares prefix");
        write_blob(&store, "b.txt", b"other");

        let (mut file, guard) = store.replace("a.txt").unwrap();
        assert!(store.locks.is_locked("a.txt"));
        file.write_all(b"new").unwrap();
        drop(file);
        drop(guard);

        assert_eq!(store.read("a.txt").unwrap(), b"new");
        assert!(!store.exists("a.txt-100").unwrap());
        assert!(!store.exists("a.txtX").unwrap());
        assert_eq!(store.read("b.txt").unwrap(), b"other");
        assert!(!store.locks.is_locked("a.txt"));
    }

    #[test]
    fn test_purge_keeps_temporary_blobs() {
        let (_dir, store) = open_temp();
        write_blob(&store, ".tmp-a.png-1", b"installing");
        write_blob(&store, ".tmp-a.png-10", b"other install");

        assert_eq!(store.purge_prefix(".tmp-a.png-1").unwrap(), 0);
        assert_eq!(store.read(".tmp-a.png-1").unwrap(), b"installing");
        assert!(store.exists(".tmp-a.png-10").unwrap());
    }

    #[test]
    fn test_rename_replaces_target() {
        let (_dir, store) = open_temp();
        write_blob(&store, ".tmp-x", b"fresh");
        write_blob(&store, "x", b"stale");
        store.rename(".tmp-x", "x").unwrap();
        assert_eq!(store.read("x").unwrap(), b"fresh");
        assert!(!store.exists(".tmp-x").unwrap());
    }

    #[test]
    fn test_remove_missing_is_false() {
        let (_dir, store) = open_temp();
        assert!(!store.remove("ghost").unwrap());
        write_blob(&store, "ghost", b"boo");
        assert!(store.remove("ghost").unwrap());
    }

    #[test]
    fn test_lock_is_exclusive_per_key() {
        let registry = LockRegistry::default();
        let inside = AtomicUsize::new(0);
        let max_inside = AtomicUsize::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let _guard = registry.lock("key");
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!registry.is_locked("key"));
    }

    #[test]
    fn test_distinct_keys_do_not_block() {
        let registry = LockRegistry::default();
        let _a = registry.lock("a");
        let _b = registry.lock("b");
        assert!(registry.is_locked("a"));
        assert!(registry.is_locked("b"));
    }
}
