//! Local state of a database: which manifest it was created from and its latest heads.
//!
//! Stored as JSON at `<directory>/<manifest id>/<name>.orbitdb`. A sibling `.lock` file is
//! held for as long as a database is open.

use std::{
    fs::OpenOptions,
    io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use orbit_base::Hash;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::address::Address;

/// Contents of the state file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalState {
    /// Content id of the manifest.
    pub manifest: Hash,
    pub heads: Vec<Hash>,
    #[serde(default)]
    pub access_heads: Vec<Hash>,
}

/// Location of the state of one database.
#[derive(Debug, Clone)]
pub struct StatePath {
    path: PathBuf,
}

impl StatePath {
    pub fn new(directory: impl AsRef<Path>, address: &Address) -> Self {
        let path = directory
            .as_ref()
            .join(address.root().to_string())
            .join(format!("{}.orbitdb", address.path()));
        StatePath { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("orbitdb.lock")
    }

    pub async fn exists(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(&self.path).await?)
    }

    /// Read the state, `None` if there is none.
    pub async fn load(&self) -> Result<Option<LocalState>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).context("failed to read local state"),
        };
        let state = serde_json::from_slice(&data).context("invalid local state")?;
        Ok(Some(state))
    }

    /// Replace the state atomically.
    pub async fn save(&self, state: &LocalState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let data = serde_json::to_vec(state)?;
        let tmp = self.path.with_extension("orbitdb.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("failed to replace local state")?;
        debug!(path = %self.path.display(), heads = state.heads.len(), "saved local state");
        Ok(())
    }

    /// Remove the state.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Take the lock on this database, failing if it is held elsewhere.
    pub fn lock(&self) -> Result<LockGuard> {
        let path = self.lock_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("database is locked: {}", path.display()))?;
        Ok(LockGuard { path })
    }
}

/// Releases the lock file on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), ?err, "failed to release lock");
        }
    }
}
