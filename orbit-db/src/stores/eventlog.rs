//! Append-only log of values.

use std::collections::HashMap;

use orbit_base::Hash;
use orbit_oplog::{Reducer, SignedEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Item, StoreIndex, decode, encode, newest};
use crate::{Database, address::StoreType, error::Result, options::OpenOptions};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
enum EventOp {
    Add { value: Value },
}

/// Every added value in log order.
#[derive(Debug, Clone, Default)]
pub struct EventIndex {
    items: Vec<Item>,
    by_hash: HashMap<Hash, usize>,
}

impl EventIndex {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, hash: &Hash) -> Option<&Item> {
        self.by_hash.get(hash).map(|i| &self.items[*i])
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }
}

impl Reducer for EventIndex {
    fn apply(&mut self, entry: &SignedEntry) {
        if let Some(EventOp::Add { value }) = decode(entry) {
            self.by_hash.insert(entry.hash(), self.items.len());
            self.items.push(Item {
                hash: entry.hash(),
                value,
            });
        }
    }
}

impl StoreIndex for EventIndex {
    const TYPE: StoreType = StoreType::EventLog;

    fn new(_opts: &OpenOptions) -> Self {
        Self::default()
    }
}

/// An append-only log of JSON values.
pub type EventLog = Database<EventIndex>;

impl Database<EventIndex> {
    /// Append `value`, returning the content id of the new entry.
    pub async fn add(&self, value: impl Serialize) -> Result<Hash> {
        let op = EventOp::Add {
            value: serde_json::to_value(value).map_err(anyhow::Error::from)?,
        };
        let entry = self.append(encode(&op)?).await?;
        Ok(entry.hash())
    }

    /// The value added by entry `hash`.
    pub fn get(&self, hash: &Hash) -> Option<Item> {
        self.with_index(|index| index.get(hash).cloned())
    }

    /// The newest `limit` values, oldest first. All values if `limit` is `None`.
    pub fn iterator(&self, limit: Option<usize>) -> Vec<Item> {
        self.with_index(|index| newest(index.items.iter(), limit))
    }
}
