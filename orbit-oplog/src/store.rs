//! Content-addressed storage for entries and manifests.
//!
//! Every blob is identified by the blake3 [`Hash`] of its bytes. The log only ever asks a store
//! for blobs by id, so a store may be local, remote or a mix of both.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use orbit_base::Hash;

pub mod fs;
pub mod mem;

/// Error returned from a [`ContentStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The blob is not available.
    #[error("blob {0} not found")]
    NotFound(Hash),
    /// IO failure in the backing storage.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Other failure.
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Storage of immutable blobs keyed by their content id.
pub trait ContentStore: fmt::Debug + Send + Sync + 'static {
    /// Store `bytes`, returning `Hash::new(&bytes)`.
    fn put(&self, bytes: Bytes) -> BoxFuture<'_, Result<Hash, StoreError>>;

    /// Retrieve the blob for `hash`, or [`StoreError::NotFound`].
    fn get(&self, hash: Hash) -> BoxFuture<'_, Result<Bytes, StoreError>>;
}

impl<T: ContentStore + ?Sized> ContentStore for Arc<T> {
    fn put(&self, bytes: Bytes) -> BoxFuture<'_, Result<Hash, StoreError>> {
        (**self).put(bytes)
    }

    fn get(&self, hash: Hash) -> BoxFuture<'_, Result<Bytes, StoreError>> {
        (**self).get(hash)
    }
}
