//! Counter that only grows.

use std::collections::BTreeMap;

use orbit_base::IdentityId;
use orbit_oplog::{Reducer, SignedEntry};
use serde::{Deserialize, Serialize};

use super::{StoreIndex, decode, encode};
use crate::{Database, address::StoreType, error::Result, options::OpenOptions};

/// Each operation carries the writer's running total, so replay order doesn't matter and
/// concurrent increments by different writers all count.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
enum CounterOp {
    Counter { value: u64 },
}

/// Highest total seen per writer.
#[derive(Debug, Clone, Default)]
pub struct CounterIndex {
    totals: BTreeMap<IdentityId, u64>,
}

impl CounterIndex {
    pub fn value(&self) -> u64 {
        self.totals.values().sum()
    }

    /// Total contributed by `writer`.
    pub fn total(&self, writer: &IdentityId) -> u64 {
        self.totals.get(writer).copied().unwrap_or(0)
    }
}

impl Reducer for CounterIndex {
    fn apply(&mut self, entry: &SignedEntry) {
        if let Some(CounterOp::Counter { value }) = decode(entry) {
            let total = self.totals.entry(*entry.identity()).or_default();
            *total = (*total).max(value);
        }
    }
}

impl StoreIndex for CounterIndex {
    const TYPE: StoreType = StoreType::Counter;

    fn new(_opts: &OpenOptions) -> Self {
        Self::default()
    }
}

/// A counter.
pub type Counter = Database<CounterIndex>;

impl Database<CounterIndex> {
    /// Increase the counter by `amount`.
    pub async fn inc(&self, amount: u64) -> Result<u64> {
        let me = self.identity().id();
        // the whole append runs under the write lock so two increments can't reuse a total
        let _guard = self.write_lock().await;
        let value = self.with_index(|index| index.total(&me)).saturating_add(amount);
        self.append_locked(encode(&CounterOp::Counter { value })?)
            .await?;
        Ok(self.value())
    }

    pub fn value(&self) -> u64 {
        self.with_index(|index| index.value())
    }
}
