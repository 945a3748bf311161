//! Log of values that can be removed again.

use std::collections::{HashMap, HashSet};

use orbit_base::Hash;
use orbit_oplog::{Reducer, SignedEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Item, StoreIndex, decode, encode, newest};
use crate::{Database, address::StoreType, error::Result, options::OpenOptions};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
enum FeedOp {
    Add { value: Value },
    Del { key: Hash },
}

/// Added values minus removed ones.
///
/// Removals are tombstones by entry hash, so a removal replayed before the addition it refers
/// to still hides it.
#[derive(Debug, Clone, Default)]
pub struct FeedIndex {
    items: Vec<Item>,
    by_hash: HashMap<Hash, usize>,
    removed: HashSet<Hash>,
}

impl FeedIndex {
    pub fn get(&self, hash: &Hash) -> Option<&Item> {
        if self.removed.contains(hash) {
            return None;
        }
        self.by_hash.get(hash).map(|i| &self.items[*i])
    }

    /// Live items in log order.
    pub fn items(&self) -> impl DoubleEndedIterator<Item = &Item> {
        self.items
            .iter()
            .filter(|item| !self.removed.contains(&item.hash))
    }
}

impl Reducer for FeedIndex {
    fn apply(&mut self, entry: &SignedEntry) {
        match decode(entry) {
            Some(FeedOp::Add { value }) => {
                self.by_hash.insert(entry.hash(), self.items.len());
                self.items.push(Item {
                    hash: entry.hash(),
                    value,
                });
            }
            Some(FeedOp::Del { key }) => {
                self.removed.insert(key);
            }
            None => {}
        }
    }
}

impl StoreIndex for FeedIndex {
    const TYPE: StoreType = StoreType::Feed;

    fn new(_opts: &OpenOptions) -> Self {
        Self::default()
    }
}

/// A log of JSON values with removal.
pub type Feed = Database<FeedIndex>;

impl Database<FeedIndex> {
    /// Append `value`, returning the content id of the new entry.
    pub async fn add(&self, value: impl Serialize) -> Result<Hash> {
        let op = FeedOp::Add {
            value: serde_json::to_value(value).map_err(anyhow::Error::from)?,
        };
        Ok(self.append(encode(&op)?).await?.hash())
    }

    /// Remove the value added by entry `hash`.
    pub async fn remove(&self, hash: Hash) -> Result<Hash> {
        Ok(self.append(encode(&FeedOp::Del { key: hash })?).await?.hash())
    }

    pub fn get(&self, hash: &Hash) -> Option<Item> {
        self.with_index(|index| index.get(hash).cloned())
    }

    /// The newest `limit` live values, oldest first. All values if `limit` is `None`.
    pub fn iterator(&self, limit: Option<usize>) -> Vec<Item> {
        self.with_index(|index| newest(index.items(), limit))
    }
}
