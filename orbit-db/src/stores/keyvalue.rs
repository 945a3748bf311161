//! Map from keys to values.

use std::collections::BTreeMap;

use orbit_oplog::{Reducer, SignedEntry};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{StoreIndex, decode, encode};
use crate::{Database, address::StoreType, error::Result, options::OpenOptions};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
enum KvOp {
    Put { key: String, value: Value },
    Del { key: String },
}

/// Latest value per key. The operation replayed last wins.
#[derive(Debug, Clone, Default)]
pub struct KvIndex {
    values: BTreeMap<String, Value>,
}

impl KvIndex {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn all(&self) -> &BTreeMap<String, Value> {
        &self.values
    }
}

impl Reducer for KvIndex {
    fn apply(&mut self, entry: &SignedEntry) {
        match decode(entry) {
            Some(KvOp::Put { key, value }) => {
                self.values.insert(key, value);
            }
            Some(KvOp::Del { key }) => {
                self.values.remove(&key);
            }
            None => {}
        }
    }
}

impl StoreIndex for KvIndex {
    const TYPE: StoreType = StoreType::KeyValue;

    fn new(_opts: &OpenOptions) -> Self {
        Self::default()
    }
}

/// A key-value store of JSON values.
pub type KeyValue = Database<KvIndex>;

impl Database<KvIndex> {
    /// Set `key` to `value`.
    pub async fn put(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        let op = KvOp::Put {
            key: key.into(),
            value: serde_json::to_value(value).map_err(anyhow::Error::from)?,
        };
        self.append(encode(&op)?).await?;
        Ok(())
    }

    /// Alias for [`Self::put`].
    pub async fn set(&self, key: impl Into<String>, value: impl Serialize) -> Result<()> {
        self.put(key, value).await
    }

    /// Remove `key`.
    pub async fn del(&self, key: impl Into<String>) -> Result<()> {
        self.append(encode(&KvOp::Del { key: key.into() })?).await?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.with_index(|index| index.get(key).cloned())
    }

    /// All keys and their values.
    pub fn all(&self) -> BTreeMap<String, Value> {
        self.with_index(|index| index.all().clone())
    }
}

#[cfg(test)]
mod tests {
    use orbit_base::Identity;
    use orbit_oplog::{Clock, Entry};

    use super::*;

    fn entry(writer: &Identity, time: u64, op: &KvOp) -> SignedEntry {
        let clock = Clock {
            id: writer.id(),
            time,
        };
        Entry::new(encode(op).unwrap().into(), clock, [])
            .sign(writer)
            .unwrap()
    }

    #[test]
    fn later_operation_wins() {
        let alice = Identity::new(&mut orbit_test::test_rng(b"alice"));
        let mut index = KvIndex::default();
        let put = |value: &str| KvOp::Put {
            key: "k".into(),
            value: value.into(),
        };
        index.apply(&entry(&alice, 1, &put("a")));
        index.apply(&entry(&alice, 2, &put("b")));
        assert_eq!(index.get("k"), Some(&Value::from("b")));
        index.apply(&entry(&alice, 3, &KvOp::Del { key: "k".into() }));
        assert_eq!(index.get("k"), None);

        // payloads of other store types are skipped
        let clock = Clock {
            id: alice.id(),
            time: 4,
        };
        let other = Entry::new(r#"{"op":"ADD","value":1}"#.into(), clock, [])
            .sign(&alice)
            .unwrap();
        index.apply(&other);
        assert!(index.all().is_empty());
    }
}
