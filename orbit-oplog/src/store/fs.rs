//! Content store keeping one file per blob.

use std::{
    io,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use futures_util::{FutureExt, future::BoxFuture};
use orbit_base::Hash;
use tracing::trace;

use super::{ContentStore, StoreError};

/// Blobs stored as `<dir>/<hash>` files.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Open or create a store rooted at `dir`.
    pub async fn persistent(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Store { dir })
    }

    fn path(&self, hash: &Hash) -> PathBuf {
        self.dir.join(hash.to_string())
    }

    async fn put0(&self, bytes: Bytes) -> Result<Hash, StoreError> {
        let hash = Hash::new(&bytes);
        let path = self.path(&hash);
        if tokio::fs::try_exists(&path).await? {
            return Ok(hash);
        }
        // write to a temp file first so readers never see a partial blob
        let tmp = self.dir.join(format!("{hash}.tmp"));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        trace!(hash = %hash.fmt_short(), len = bytes.len(), "stored blob");
        Ok(hash)
    }

    async fn get0(&self, hash: Hash) -> Result<Bytes, StoreError> {
        match tokio::fs::read(self.path(&hash)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound(hash)),
            Err(err) => Err(err.into()),
        }
    }
}

impl ContentStore for Store {
    fn put(&self, bytes: Bytes) -> BoxFuture<'_, Result<Hash, StoreError>> {
        self.put0(bytes).boxed()
    }

    fn get(&self, hash: Hash) -> BoxFuture<'_, Result<Bytes, StoreError>> {
        self.get0(hash).boxed()
    }
}
