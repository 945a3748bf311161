//! Store types: the reducers that turn a log into queryable state, and the operations each
//! store type offers.

use std::fmt;

use orbit_base::Hash;
use orbit_oplog::{Reducer, SignedEntry};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::debug;

use crate::{address::StoreType, options::OpenOptions};

pub mod counter;
pub mod docstore;
pub mod eventlog;
pub mod feed;
pub mod keyvalue;

pub use self::{
    counter::CounterIndex, docstore::DocIndex, eventlog::EventIndex, feed::FeedIndex,
    keyvalue::KvIndex,
};

/// The index of one store type.
pub trait StoreIndex: Reducer + fmt::Debug {
    /// Store type this index belongs to.
    const TYPE: StoreType;

    /// Empty index for a database opened with `opts`.
    fn new(opts: &OpenOptions) -> Self;
}

/// A value in a sequence store together with the entry that added it.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub hash: Hash,
    pub value: Value,
}

/// Decode an entry payload, skipping entries that are not operations of this store.
pub(crate) fn decode<T: DeserializeOwned>(entry: &SignedEntry) -> Option<T> {
    match serde_json::from_slice(entry.payload()) {
        Ok(op) => Some(op),
        Err(err) => {
            debug!(hash = %entry.hash().fmt_short(), %err, "skipping undecodable operation");
            None
        }
    }
}

pub(crate) fn encode<T: Serialize>(op: &T) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(op)?)
}

/// The newest `limit` items, oldest first. All items if `limit` is `None`.
pub(crate) fn newest<'a>(
    items: impl DoubleEndedIterator<Item = &'a Item>,
    limit: Option<usize>,
) -> Vec<Item> {
    let mut out: Vec<Item> = items
        .rev()
        .take(limit.unwrap_or(usize::MAX))
        .cloned()
        .collect();
    out.reverse();
    out
}
