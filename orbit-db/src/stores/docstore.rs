//! JSON documents keyed by one of their fields.

use std::collections::BTreeMap;

use anyhow::anyhow;
use orbit_oplog::{Reducer, SignedEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{StoreIndex, decode, encode};
use crate::{
    Database,
    address::StoreType,
    error::{Error, Result},
    options::OpenOptions,
};

/// Field used as the document key unless configured otherwise.
pub const DEFAULT_INDEX_BY: &str = "_id";

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
enum DocOp {
    Put { key: String, value: Value },
    Del { key: String },
}

/// Documents by key.
#[derive(Debug, Clone)]
pub struct DocIndex {
    index_by: String,
    docs: BTreeMap<String, Value>,
}

impl DocIndex {
    pub fn new(index_by: impl Into<String>) -> Self {
        DocIndex {
            index_by: index_by.into(),
            docs: BTreeMap::new(),
        }
    }

    /// Name of the key field.
    pub fn index_by(&self) -> &str {
        &self.index_by
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.docs.get(key)
    }

    pub fn docs(&self) -> impl Iterator<Item = &Value> {
        self.docs.values()
    }

    /// The key of `doc`. Strings are used as is, other scalars in their JSON form.
    fn key_of(&self, doc: &Value) -> Option<String> {
        match doc.get(&self.index_by)? {
            Value::String(s) => Some(s.clone()),
            v @ (Value::Number(_) | Value::Bool(_)) => Some(v.to_string()),
            _ => None,
        }
    }
}

impl Reducer for DocIndex {
    fn apply(&mut self, entry: &SignedEntry) {
        match decode(entry) {
            Some(DocOp::Put { key, value }) => {
                self.docs.insert(key, value);
            }
            Some(DocOp::Del { key }) => {
                self.docs.remove(&key);
            }
            None => {}
        }
    }
}

impl StoreIndex for DocIndex {
    const TYPE: StoreType = StoreType::DocStore;

    fn new(opts: &OpenOptions) -> Self {
        DocIndex::new(opts.index_by.as_deref().unwrap_or(DEFAULT_INDEX_BY))
    }
}

/// A store of JSON documents.
pub type DocStore = Database<DocIndex>;

impl Database<DocIndex> {
    /// Insert or replace `doc`, which must carry the key field.
    pub async fn put(&self, doc: impl Serialize) -> Result<String> {
        let value = serde_json::to_value(doc).map_err(anyhow::Error::from)?;
        let key = self.with_index(|index| {
            index.key_of(&value).ok_or_else(|| {
                anyhow!(
                    "The provided document doesn't contain field '{}'",
                    index.index_by()
                )
            })
        })?;
        let op = DocOp::Put {
            key: key.clone(),
            value,
        };
        self.append(encode(&op)?).await?;
        Ok(key)
    }

    /// Delete the document with key `key`.
    pub async fn del(&self, key: &str) -> Result<()> {
        if self.with_index(|index| index.get(key).is_none()) {
            return Err(Error::Other(anyhow!(
                "No entry with key '{key}' in the database"
            )));
        }
        let op = DocOp::Del {
            key: key.to_string(),
        };
        self.append(encode(&op)?).await?;
        debug!(db = %self.address().fmt_short(), key, "deleted document");
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.with_index(|index| index.get(key).cloned())
    }

    /// Every document matching `predicate`, in key order.
    pub fn query(&self, mut predicate: impl FnMut(&Value) -> bool) -> Vec<Value> {
        self.with_index(|index| index.docs().filter(|doc| predicate(doc)).cloned().collect())
    }
}
