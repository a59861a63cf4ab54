pub mod status;
pub mod warnings;

pub use status::{RetrievalStatus, RetrievalStatusLedger, RunResult, StatusUpdate};
pub use warnings::{InputWarning, InputWarningLedger, InputWarnings};

use crate::sync::FileLock;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, error, warn};

/// A JSON document on disk, only ever rewritten while holding its lock file
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
    lock: FileLock,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let lock = FileLock::for_resource(&path, lock_timeout);

        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document without locking.
    /// Missing, partially written or malformed files read as the empty document.
    fn read<T: DeserializeOwned + Default>(&self) -> T {
        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = ?self.path, "Treating malformed store as empty: {e}");
                    T::default()
                }
            },
            Err(e) if e.kind() == ErrorKind::NotFound => T::default(),
            Err(e) => {
                warn!(path = ?self.path, "Treating unreadable store as empty: {e}");
                T::default()
            }
        }
    }

    /// write through a temporary file, rename is atomic for readers outside the lock
    fn write<T: Serialize>(&self, value: &T) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(format!(".{}.tmp", std::process::id()));
        let tmp = PathBuf::from(tmp);

        let content = serde_json::to_string_pretty(value)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)
    }

    /// Snapshot of the document, read under the lock if it can be had in time and as a
    /// possibly stale snapshot otherwise.
    pub fn load<T: DeserializeOwned + Default>(&self) -> T {
        match self.lock.with_lock(|| self.read()) {
            Some(value) => value,
            None => {
                debug!(path = ?self.path, "Reading store without lock");
                self.read()
            }
        }
    }

    /// Read-modify-write under the lock. `modify` returns whether the document changed,
    /// unchanged documents are not rewritten. `None` means the operation was skipped.
    pub fn modify<T, F>(&self, modify: F) -> Option<bool>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> bool,
    {
        self.lock
            .with_lock(|| {
                let mut value = self.read();

                if !modify(&mut value) {
                    return Some(false);
                }

                match self.write(&value) {
                    Ok(()) => Some(true),
                    Err(e) => {
                        error!(path = ?self.path, "Failed to write store: {e}");
                        None
                    }
                }
            })
            .flatten()
    }

    /// overwrite the whole document under the lock
    pub fn replace<T: Serialize>(&self, value: &T) -> Option<()> {
        self.lock
            .with_lock(|| match self.write(value) {
                Ok(()) => Some(()),
                Err(e) => {
                    error!(path = ?self.path, "Failed to write store: {e}");
                    None
                }
            })
            .flatten()
    }
}
