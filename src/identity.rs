//! Durable local identity used to recognize our own signaling records.

use crate::error::{CallError, Result};
use crate::utils::random_id;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

pub trait IdentityStore: Send + Sync {
    /// Returns the stored token, generating and saving one on first use.
    fn get_or_create(&self) -> Result<String>;
}

/// Keeps the token in a single-line file.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_existing(&self) -> Result<Option<String>> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CallError::Identity(format!(
                "failed to read {}: {e}",
                self.path.display()
            ))),
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn get_or_create(&self) -> Result<String> {
        let mut cached = self.cached.lock();
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let token = match self.read_existing()? {
            Some(token) => token,
            None => {
                let token = random_id();
                if let Some(parent) = self.path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&self.path, &token).map_err(|e| {
                    CallError::Identity(format!("failed to write {}: {e}", self.path.display()))
                })?;
                tracing::debug!(path = %self.path.display(), "generated local initiator id");
                token
            }
        };
        *cached = Some(token.clone());
        Ok(token)
    }
}

/// Token that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    token: Mutex<Option<String>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get_or_create(&self) -> Result<String> {
        Ok(self.token.lock().get_or_insert_with(random_id).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_token_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("initiator");

        let first = FileIdentityStore::new(&path).get_or_create().unwrap();
        let second = FileIdentityStore::new(&path).get_or_create().unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn blank_file_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("initiator");
        fs::write(&path, "  \n").unwrap();

        let token = FileIdentityStore::new(&path).get_or_create().unwrap();
        assert_eq!(token.len(), 16);
    }

    #[test]
    fn memory_token_is_stable() {
        let store = MemoryIdentityStore::new();
        assert_eq!(store.get_or_create().unwrap(), store.get_or_create().unwrap());
        assert_eq!(
            MemoryIdentityStore::with_token("a").get_or_create().unwrap(),
            "a"
        );
    }
}
