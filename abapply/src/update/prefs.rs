// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::HashMap,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tempfile::NamedTempFile;
use thiserror::Error;

pub const KEY_UPDATE_STATE_NEXT_OPERATION: &str = "update-state-next-operation";
pub const KEY_UPDATE_STATE_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
pub const KEY_UPDATE_STATE_NEXT_DATA_LENGTH: &str = "update-state-next-data-length";
pub const KEY_UPDATE_STATE_SHA_256_CONTEXT: &str = "update-state-sha-256-context";
pub const KEY_UPDATE_STATE_SIGNED_SHA_256_CONTEXT: &str = "update-state-signed-sha-256-context";
pub const KEY_UPDATE_STATE_SIGNATURE_BLOB: &str = "update-state-signature-blob";
pub const KEY_MANIFEST_METADATA_SIZE: &str = "manifest-metadata-size";
pub const KEY_UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";
pub const KEY_RESUMED_UPDATE_FAILURES: &str = "resumed-update-failures";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid key name: {0:?}")]
    InvalidKey(String),
    #[error("Value for {key:?} is not an integer: {value:?}")]
    NotAnInteger { key: String, value: String },
    #[error("Value for {0:?} is not valid UTF-8")]
    NotUtf8(String),
    #[error("Failed to read key: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to write key: {0:?}")]
    Write(PathBuf, #[source] io::Error),
    #[error("Failed to delete key: {0:?}")]
    Delete(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Persistent key/value storage for update progress. Each individual
/// operation must be atomic, but there is no atomicity across keys.
pub trait Prefs: Send + Sync {
    /// Returns [`None`] if the key does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Deleting a nonexistent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;
}

/// Typed accessors on top of [`Prefs`]. Integers are stored as decimal text.
pub trait PrefsExt {
    fn get_i64(&self, key: &str) -> Result<Option<i64>>;

    fn set_i64(&self, key: &str, value: i64) -> Result<()>;

    fn get_string(&self, key: &str) -> Result<Option<String>>;

    fn set_string(&self, key: &str, value: &str) -> Result<()>;
}

impl<P: ?Sized + Prefs> PrefsExt for P {
    fn get_i64(&self, key: &str) -> Result<Option<i64>> {
        let Some(value) = self.get_string(key)? else {
            return Ok(None);
        };

        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::NotAnInteger {
                key: key.to_owned(),
                value,
            })
    }

    fn set_i64(&self, key: &str, value: i64) -> Result<()> {
        self.set(key, value.to_string().as_bytes())
    }

    fn get_string(&self, key: &str) -> Result<Option<String>> {
        self.get(key)?
            .map(|v| String::from_utf8(v).map_err(|_| Error::NotUtf8(key.to_owned())))
            .transpose()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<()> {
        self.set(key, value.as_bytes())
    }
}

/// Non-persistent storage, primarily for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryPrefs(Mutex<HashMap<String, Vec<u8>>>);

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prefs for MemoryPrefs {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.0.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
        Ok(())
    }
}

/// Storage backed by a directory containing one file per key. Writes go to a
/// temporary file that is renamed over the old value.
#[derive(Debug)]
pub struct FilePrefs {
    dir: PathBuf,
}

impl FilePrefs {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| Error::Write(dir.clone(), e))?;

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(Error::InvalidKey(key.to_owned()));
        }

        Ok(self.dir.join(key))
    }
}

impl Prefs for FilePrefs {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.key_path(key)?;

        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Read(path, e)),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key)?;

        let mut file = NamedTempFile::new_in(&self.dir).map_err(|e| Error::Write(path.clone(), e))?;
        file.write_all(value)
            .and_then(|()| file.as_file().sync_all())
            .map_err(|e| Error::Write(path.clone(), e))?;
        file.persist(&path)
            .map_err(|e| Error::Write(path.clone(), e.error))?;

        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;

        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Delete(path, e)),
        }
    }
}
