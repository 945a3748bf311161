//! In memory content store.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use futures_util::{FutureExt, future::BoxFuture};
use orbit_base::Hash;
use parking_lot::RwLock;

use super::{ContentStore, StoreError};

/// Blobs kept in a shared map.
///
/// Clones share the same map, so handing clones to several databases in one process behaves
/// like a shared content network.
#[derive(Debug, Clone, Default)]
pub struct Store {
    blobs: Arc<RwLock<HashMap<Hash, Bytes>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Insert `bytes` under an arbitrary id, bypassing the content check.
    ///
    /// Only useful to simulate misbehaving peers.
    pub fn insert_unchecked(&self, hash: Hash, bytes: Bytes) {
        self.blobs.write().insert(hash, bytes);
    }

    /// Remove a blob.
    pub fn remove(&self, hash: &Hash) -> Option<Bytes> {
        self.blobs.write().remove(hash)
    }
}

impl ContentStore for Store {
    fn put(&self, bytes: Bytes) -> BoxFuture<'_, Result<Hash, StoreError>> {
        let hash = Hash::new(&bytes);
        self.blobs.write().insert(hash, bytes);
        futures_util::future::ready(Ok(hash)).boxed()
    }

    fn get(&self, hash: Hash) -> BoxFuture<'_, Result<Bytes, StoreError>> {
        let res = self
            .blobs
            .read()
            .get(&hash)
            .cloned()
            .ok_or(StoreError::NotFound(hash));
        futures_util::future::ready(res).boxed()
    }
}
