//! Storage for example buffers that outlives a single run.
//!
//! A database is a multimap from opaque byte keys to sets of byte values.
//! Other processes may change it at any time, so implementations re-read
//! their backing store on every fetch instead of caching.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::{Arc, Mutex, PoisonError};

/// Key/value-set store used to persist interesting examples between runs.
pub trait ExampleDatabase: Send + Sync {
    /// Add `value` to the set stored under `key`
    fn save(&self, key: &[u8], value: &[u8]) -> io::Result<()>;

    /// Every value currently stored under `key`
    fn fetch(&self, key: &[u8]) -> io::Result<Vec<Vec<u8>>>;

    /// Remove `value` from the set under `key`. Missing values are ignored.
    fn delete(&self, key: &[u8], value: &[u8]) -> io::Result<()>;

    /// Move `value` from `src` to `dest`, saving it under `dest` even if it
    /// was not present under `src`
    fn move_value(&self, src: &[u8], dest: &[u8], value: &[u8]) -> io::Result<()> {
        if src == dest {
            return self.save(src, value);
        }
        self.delete(src, value)?;
        self.save(dest, value)
    }
}

/// Database held entirely in memory.
///
/// Clones share the same storage, so a test can hand one clone to a runner
/// and inspect or reuse the contents afterwards.
#[derive(Debug, Clone, Default)]
pub struct InMemoryExampleDatabase {
    data: Arc<Mutex<HashMap<Vec<u8>, BTreeSet<Vec<u8>>>>>,
}

impl InMemoryExampleDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with at least one value
    pub fn len(&self) -> usize {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|values| !values.is_empty())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExampleDatabase for InMemoryExampleDatabase {
    fn save(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        data.entry(key.to_vec()).or_default().insert(value.to_vec());
        Ok(())
    }

    fn fetch(&self, key: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(data
            .get(key)
            .map(|values| values.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn delete(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(values) = data.get_mut(key) {
            values.remove(value);
        }
        Ok(())
    }
}

#[cfg(feature = "persistence")]
pub use directory::DirectoryBasedExampleDatabase;

#[cfg(feature = "persistence")]
mod directory {
    use std::fs;
    use std::io::{self, ErrorKind};
    use std::path::{Path, PathBuf};

    use sha2::{Digest, Sha256};

    use super::ExampleDatabase;

    /// Database storing one file per value under one directory per key.
    ///
    /// File and directory names are the first 16 hex digits of the SHA-256
    /// of the key or value, so saving the same value twice is idempotent.
    #[derive(Debug, Clone)]
    pub struct DirectoryBasedExampleDatabase {
        path: PathBuf,
    }

    impl DirectoryBasedExampleDatabase {
        /// Open (creating if needed) a database rooted at `path`
        pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
            let path = path.as_ref().to_path_buf();
            fs::create_dir_all(&path)?;
            Ok(Self { path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub(crate) fn key_path(&self, key: &[u8]) -> PathBuf {
            self.path.join(hash_name(key))
        }

        pub(crate) fn value_path(&self, key: &[u8], value: &[u8]) -> PathBuf {
            self.key_path(key).join(hash_name(value))
        }
    }

    fn hash_name(bytes: &[u8]) -> String {
        Sha256::digest(bytes)[..8]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    impl ExampleDatabase for DirectoryBasedExampleDatabase {
        fn save(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
            let path = self.value_path(key, value);
            if path.exists() {
                return Ok(());
            }
            fs::create_dir_all(self.key_path(key))?;
            // Write under a temporary name so concurrent readers never see
            // a partial file
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, value)?;
            fs::rename(&tmp, &path)
        }

        fn fetch(&self, key: &[u8]) -> io::Result<Vec<Vec<u8>>> {
            let dir = self.key_path(key);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let mut values = Vec::new();
            for entry in entries {
                let path = entry?.path();
                if path.extension().is_some() {
                    continue;
                }
                match fs::read(&path) {
                    Ok(value) => values.push(value),
                    // Deleted by someone else since we listed the directory
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e),
                }
            }
            Ok(values)
        }

        fn delete(&self, key: &[u8], value: &[u8]) -> io::Result<()> {
            match fs::remove_file(self.value_path(key, value)) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        }

        fn move_value(&self, src: &[u8], dest: &[u8], value: &[u8]) -> io::Result<()> {
            if src == dest {
                return self.save(src, value);
            }
            fs::create_dir_all(self.key_path(dest))?;
            match fs::rename(self.value_path(src, value), self.value_path(dest, value)) {
                Ok(()) => Ok(()),
                Err(_) => {
                    self.delete(src, value)?;
                    self.save(dest, value)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut values: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        values.sort();
        values
    }

    fn check_database_behaviour(db: &dyn ExampleDatabase) {
        assert!(db.fetch(b"k").unwrap().is_empty());

        db.save(b"k", b"one").unwrap();
        db.save(b"k", b"two").unwrap();
        db.save(b"k", b"two").unwrap();
        db.save(b"other", b"three").unwrap();
        assert_eq!(sorted(db.fetch(b"k").unwrap()), vec![b"one".to_vec(), b"two".to_vec()]);

        db.delete(b"k", b"one").unwrap();
        db.delete(b"k", b"missing").unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), vec![b"two".to_vec()]);

        db.move_value(b"k", b"other", b"two").unwrap();
        assert!(db.fetch(b"k").unwrap().is_empty());
        assert_eq!(
            sorted(db.fetch(b"other").unwrap()),
            vec![b"three".to_vec(), b"two".to_vec()]
        );

        db.move_value(b"nowhere", b"k", b"four").unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), vec![b"four".to_vec()]);

        db.save(b"k", b"").unwrap();
        assert_eq!(sorted(db.fetch(b"k").unwrap()), vec![b"".to_vec(), b"four".to_vec()]);
    }

    #[test]
    fn test_in_memory_database() {
        let db = InMemoryExampleDatabase::new();
        check_database_behaviour(&db);
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn test_in_memory_clones_share_storage() {
        let db = InMemoryExampleDatabase::new();
        let clone = db.clone();
        clone.save(b"k", b"v").unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), vec![b"v".to_vec()]);
    }

    #[cfg(feature = "persistence")]
    mod directory_tests {
        use super::*;
        use tempfile::TempDir;

        #[test]
        fn test_directory_database() {
            let temp_dir = TempDir::new().unwrap();
            let db = DirectoryBasedExampleDatabase::new(temp_dir.path()).unwrap();
            check_database_behaviour(&db);
        }

        #[test]
        fn test_directory_database_sees_external_changes() {
            let temp_dir = TempDir::new().unwrap();
            let first = DirectoryBasedExampleDatabase::new(temp_dir.path()).unwrap();
            let second = DirectoryBasedExampleDatabase::new(temp_dir.path()).unwrap();

            first.save(b"key", b"value").unwrap();
            assert_eq!(second.fetch(b"key").unwrap(), vec![b"value".to_vec()]);

            second.delete(b"key", b"value").unwrap();
            assert!(first.fetch(b"key").unwrap().is_empty());
        }

        #[test]
        fn test_directory_database_skips_temporary_files() {
            let temp_dir = TempDir::new().unwrap();
            let db = DirectoryBasedExampleDatabase::new(temp_dir.path()).unwrap();
            db.save(b"key", b"value").unwrap();
            let stray = db.value_path(b"key", b"other").with_extension("tmp");
            std::fs::write(stray, b"partial").unwrap();
            assert_eq!(db.fetch(b"key").unwrap(), vec![b"value".to_vec()]);
        }
    }
}
