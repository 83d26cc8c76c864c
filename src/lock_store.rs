//! JSON state files shared between independent launches of the program.
//!
//! Every file is read in full and rewritten in full. There is no OS-level
//! locking: two processes doing read-modify-write at the same moment can lose
//! an update, and a crash mid-write can leave a truncated file behind. Readers
//! tolerate both (a truncated file parses as corrupt and falls back to the
//! default), and the port coordinator treats write failures as a sign that a
//! sibling is racing for the same file.

use std::fs;
use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Seconds since the Unix epoch, the unit used in every state file.
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A typed handle on one JSON state file.
#[derive(Debug, Clone)]
pub struct JsonStateFile<T> {
    path: PathBuf,
    _state: PhantomData<fn() -> T>,
}

impl<T> JsonStateFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _state: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, falling back to the default on any failure.
    ///
    /// Corrupt content is logged as a warning and never propagated.
    pub fn load(&self) -> T {
        match self.load_strict() {
            Ok(state) => state,
            Err(StoreError::Json(e)) => {
                warn!(path = %self.path.display(), "State file contains invalid JSON: {}", e);
                T::default()
            }
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to load state file: {}", e);
                T::default()
            }
        }
    }

    /// Load the state, surfacing unreadable or malformed content as an error.
    ///
    /// A missing file and a blank file both count as the default state.
    pub fn load_strict(&self) -> Result<T, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => return Err(e.into()),
        };
        let content = content.trim();
        if content.is_empty() {
            return Ok(T::default());
        }
        Ok(serde_json::from_str(content)?)
    }

    /// Write the full state, creating parent directories as needed.
    pub fn save(&self, state: &T) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, json)?;
        debug!(path = %self.path.display(), "Saved state file");
        Ok(())
    }

    /// Delete the state file. A missing file is not an error.
    pub fn remove(&self) -> Result<(), StoreError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
