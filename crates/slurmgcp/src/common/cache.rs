use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Key/value store for data that does not change during the lifetime of a key
/// (e.g. instance templates, which are immutable).
pub trait Cache {
    fn get_raw(&self, key: &str) -> Option<Vec<u8>>;
    fn set_raw(&self, key: &str, data: &[u8]);
}

impl dyn Cache {
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.get_raw(key)?;
        match serde_json::from_slice(&data) {
            Ok(value) => Some(value),
            Err(error) => {
                log::warn!("Failed to decode cached value {key}: {error}");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_vec(value) {
            Ok(data) => self.set_raw(key, &data),
            Err(error) => log::warn!("Failed to encode value {key} for cache: {error}"),
        }
    }
}

/// One file per key in a directory.
pub struct FileCache {
    path: PathBuf,
}

impl FileCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.path.join(key.replace('/', "_"))
    }

    fn write(&self, key: &str, data: &[u8]) -> std::io::Result<()> {
        let mut file = tempfile::NamedTempFile::new_in(&self.path)?;
        file.write_all(data)?;
        file.persist(self.key_path(key))?;
        Ok(())
    }
}

impl Cache for FileCache {
    fn get_raw(&self, key: &str) -> Option<Vec<u8>> {
        let path = self.key_path(key);
        if !path.exists() {
            return None;
        }
        match std::fs::read(&path) {
            Ok(data) => Some(data),
            Err(error) => {
                log::warn!("Failed to read cached value at {path:?}: {error}");
                None
            }
        }
    }

    fn set_raw(&self, key: &str, data: &[u8]) {
        if let Err(error) = self.write(key, data) {
            log::warn!(
                "Failed to write cached value at {:?}: {error}",
                self.key_path(key)
            );
        }
    }
}

pub struct NoCache;

impl Cache for NoCache {
    fn get_raw(&self, _key: &str) -> Option<Vec<u8>> {
        log::debug!("No cache used");
        None
    }

    fn set_raw(&self, _key: &str, _data: &[u8]) {
        log::debug!("No cache used");
    }
}

/// Opens the cache `name` inside `root`, falls back to [`NoCache`] when the
/// directory cannot be created.
pub fn open_cache(root: &Path, name: &str) -> Box<dyn Cache> {
    let path = root.join(name);
    match std::fs::create_dir_all(&path) {
        Ok(()) => Box::new(FileCache::new(path)),
        Err(error) => {
            log::warn!("Failed to create cache {path:?}, no cache is used: {error}");
            Box::new(NoCache)
        }
    }
}
