//! The operation log: a grow-only set of signed entries linked into a DAG.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    fmt,
    ops::Bound,
    sync::Arc,
};

use bytes::Bytes;
use futures_util::{StreamExt, stream::FuturesUnordered};
use orbit_base::{Hash, IdentityId, Signer, SigningError};
use parking_lot::{RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    access::CanAppend,
    entry::{Clock, Entry, Key, SignedEntry, VerifyError},
    store::{ContentStore, StoreError},
};

/// Default number of concurrent content store fetches during a join.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;

/// Error returned from [`OpLog::append`].
#[derive(Debug, thiserror::Error)]
pub enum AppendError {
    /// The identity may not write to this log.
    #[error("identity {0} is not allowed to append")]
    AccessDenied(IdentityId),
    /// The identity cannot sign.
    #[error(transparent)]
    Signing(#[from] SigningError),
    /// Storing the entry failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why an entry offered in a join was not merged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    /// Content id, encoding or signature do not check out.
    #[error("corrupt entry: {0}")]
    Corrupt(String),
    /// The writer is not allowed to append.
    #[error("writer {0} is not allowed to append")]
    AccessDenied(IdentityId),
}

/// Progress of loading the log from the content store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
}

/// Options for [`OpLog::join`].
#[derive(Debug, Clone, Default)]
pub struct JoinOptions {
    /// Fetch at most this many entries.
    pub load_depth: Option<usize>,
    /// Stops fetching once cancelled. Entries fetched so far are still merged.
    pub cancel: Option<CancellationToken>,
}

impl JoinOptions {
    pub fn with_load_depth(mut self, load_depth: Option<usize>) -> Self {
        self.load_depth = load_depth;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Result of a join.
///
/// Rejected entries are reported here, they never fail the join.
#[derive(Debug, Default)]
pub struct JoinOutcome {
    /// Newly merged entries, oldest first.
    pub added: Vec<SignedEntry>,
    /// Entries that were fetched but discarded.
    pub rejected: Vec<(Hash, Rejection)>,
    /// Number of blobs fetched from the content store.
    pub fetched: usize,
    /// Whether the fetch was cut short by cancellation.
    pub cancelled: bool,
}

impl JoinOutcome {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
    }
}

#[derive(Debug, Default)]
struct LogState {
    entries: HashMap<Hash, SignedEntry>,
    order: BTreeSet<Key>,
    heads: BTreeSet<Hash>,
    /// Every id referenced by some entry's `next`.
    referenced: HashSet<Hash>,
    /// Ids wanted but not present: unresolved predecessors and unfinished fetches.
    missing: BTreeSet<Hash>,
    /// Ids whose blobs failed verification. Never fetched again.
    corrupt: HashSet<Hash>,
    load: LoadState,
}

impl LogState {
    fn is_known(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash) || self.corrupt.contains(hash)
    }

    fn insert(&mut self, entry: SignedEntry) -> bool {
        let hash = entry.hash();
        if self.entries.contains_key(&hash) {
            return false;
        }
        for next in entry.next() {
            self.heads.remove(next);
            self.referenced.insert(*next);
            if !self.is_known(next) {
                self.missing.insert(*next);
            }
        }
        if !self.referenced.contains(&hash) {
            self.heads.insert(hash);
        }
        self.missing.remove(&hash);
        self.order.insert(entry.key());
        self.entries.insert(hash, entry);
        true
    }
}

/// A signed, content addressed operation log.
///
/// Mutations fetch from the content store without holding any lock and apply their result
/// atomically, so concurrent readers observe the log either before or after a join.
pub struct OpLog {
    id: String,
    store: Arc<dyn ContentStore>,
    state: RwLock<LogState>,
    max_in_flight: usize,
}

impl fmt::Debug for OpLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("OpLog")
            .field("id", &self.id)
            .field("len", &state.entries.len())
            .field("heads", &state.heads)
            .field("load", &state.load)
            .finish()
    }
}

impl OpLog {
    /// Create an empty log backed by `store`.
    pub fn new(id: impl Into<String>, store: Arc<dyn ContentStore>) -> Self {
        OpLog {
            id: id.into(),
            store,
            state: Default::default(),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }

    /// Limit the number of concurrent fetches during a join.
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    /// Lock the log for reading.
    pub fn read(&self) -> LogView<'_> {
        LogView(self.state.read())
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.state.read().entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<SignedEntry> {
        self.state.read().entries.get(hash).cloned()
    }

    /// Entries referenced by no other entry, sorted by content id.
    pub fn heads(&self) -> Vec<Hash> {
        self.state.read().heads.iter().copied().collect()
    }

    /// Present entries with predecessors that are not loaded.
    pub fn tails(&self) -> Vec<Hash> {
        self.read().tails()
    }

    /// Ids a later [`OpLog::load_more`] would resume from.
    pub fn missing(&self) -> Vec<Hash> {
        self.state.read().missing.iter().copied().collect()
    }

    pub fn load_state(&self) -> LoadState {
        self.state.read().load
    }

    /// All entries, oldest first.
    pub fn values(&self) -> Vec<SignedEntry> {
        self.read().values().cloned().collect()
    }

    /// Walk the log newest first.
    ///
    /// The order is fixed when the iterator is created. Entries merged afterwards are not
    /// visited, so holding it across a join still yields the order from before the join.
    pub fn iter(&self) -> Iter<'_> {
        let keys: Vec<Key> = self.state.read().order.iter().copied().collect();
        Iter {
            log: self,
            keys: keys.into_iter().rev(),
            remaining: None,
        }
    }

    /// Append a new entry on top of the current heads.
    ///
    /// Fails with [`AppendError::AccessDenied`] without touching the log if `access` does not
    /// allow `signer` to write.
    pub async fn append(
        &self,
        signer: &dyn Signer,
        access: &dyn CanAppend,
        payload: impl Into<Bytes>,
    ) -> Result<SignedEntry, AppendError> {
        let id = signer.id();
        if !access.can_append(&id) {
            return Err(AppendError::AccessDenied(id));
        }
        let (next, clock) = {
            let state = self.state.read();
            let next: Vec<Hash> = state.heads.iter().copied().collect();
            let clock = Clock::tick(
                id,
                next.iter().filter_map(|h| state.entries.get(h)).map(|e| e.clock()),
            );
            (next, clock)
        };
        let entry = Entry::new(payload.into(), clock, next).sign(signer)?;
        let hash = self.store.put(entry.encode().into()).await?;
        debug_assert_eq!(hash, entry.hash());
        self.state.write().insert(entry.clone());
        trace!(log = %self.id, hash = %hash.fmt_short(), time = clock.time, "appended");
        Ok(entry)
    }

    /// Merge the entries reachable from `heads` into this log.
    ///
    /// Unknown heads and their ancestors are fetched breadth first until every path ends in a
    /// known entry, or `load_depth` entries were fetched. Whatever stays unresolved is kept in
    /// [`OpLog::missing`]. Each fetched entry is verified and checked against `access` on its
    /// own; a bad entry is discarded and reported in the outcome.
    pub async fn join(
        &self,
        heads: impl IntoIterator<Item = Hash>,
        access: &dyn CanAppend,
        opts: JoinOptions,
    ) -> JoinOutcome {
        let start: Vec<Hash> = {
            let state = self.state.read();
            let mut start: Vec<Hash> = heads.into_iter().filter(|h| !state.is_known(h)).collect();
            start.sort();
            start.dedup();
            start
        };
        if start.is_empty() {
            return JoinOutcome::default();
        }
        self.state.write().load = LoadState::Loading;

        let fetch = self.fetch(start, &opts).await;
        let outcome = self.apply(fetch, access);
        self.state.write().load = LoadState::Loaded;
        debug!(
            log = %self.id,
            added = outcome.added.len(),
            rejected = outcome.rejected.len(),
            fetched = outcome.fetched,
            cancelled = outcome.cancelled,
            "joined"
        );
        outcome
    }

    /// Load the log from a set of persisted heads, fetching at most `amount` entries.
    pub async fn load(
        &self,
        heads: impl IntoIterator<Item = Hash>,
        access: &dyn CanAppend,
        amount: Option<usize>,
    ) -> JoinOutcome {
        let outcome = self
            .join(heads, access, JoinOptions::default().with_load_depth(amount))
            .await;
        // an empty or fully present set of heads still counts as loaded
        self.state.write().load = LoadState::Loaded;
        outcome
    }

    /// Continue loading from the unresolved predecessors, fetching at most `amount` entries.
    pub async fn load_more(&self, access: &dyn CanAppend, amount: Option<usize>) -> JoinOutcome {
        let missing = self.missing();
        self.load(missing, access, amount).await
    }

    async fn fetch(&self, start: Vec<Hash>, opts: &JoinOptions) -> Fetched {
        let store = &self.store;
        let cancel = opts.cancel.clone().unwrap_or_default();
        let mut budget = opts.load_depth.unwrap_or(usize::MAX);
        let mut queued: HashSet<Hash> = start.iter().copied().collect();
        let mut queue: VecDeque<Hash> = start.into();
        let mut in_flight = FuturesUnordered::new();
        let mut out = Fetched::default();

        loop {
            while in_flight.len() < self.max_in_flight && budget > 0 {
                let Some(hash) = queue.pop_front() else {
                    break;
                };
                budget -= 1;
                in_flight.push(async move { (hash, store.get(hash).await) });
            }
            if in_flight.is_empty() {
                break;
            }
            let (hash, res) = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    out.cancelled = true;
                    break;
                }
                Some(next) = in_flight.next() => next,
            };
            match res {
                Ok(bytes) => {
                    out.fetched += 1;
                    let decoded = SignedEntry::decode(hash, &bytes);
                    if let Ok(entry) = &decoded {
                        let state = self.state.read();
                        for next in entry.next() {
                            if !state.is_known(next) && queued.insert(*next) {
                                queue.push_back(*next);
                            }
                        }
                    }
                    out.entries.push((hash, decoded));
                }
                Err(StoreError::NotFound(_)) => {
                    trace!(log = %self.id, hash = %hash.fmt_short(), "not found");
                    out.unresolved.push(hash);
                }
                Err(err) => {
                    warn!(log = %self.id, hash = %hash.fmt_short(), ?err, "fetch failed");
                    out.unresolved.push(hash);
                }
            }
        }
        // whatever was not fetched stays wanted
        out.unresolved.extend(queue);
        out
    }

    fn apply(&self, fetch: Fetched, access: &dyn CanAppend) -> JoinOutcome {
        let Fetched {
            entries,
            unresolved,
            fetched,
            cancelled,
        } = fetch;
        let mut accepted = Vec::with_capacity(entries.len());
        let mut rejected = Vec::new();
        for (hash, decoded) in entries {
            let checked = decoded.and_then(|entry| entry.verify().map(|_| entry));
            match checked {
                Err(err) => {
                    warn!(log = %self.id, hash = %hash.fmt_short(), %err, "rejected corrupt entry");
                    rejected.push((hash, Rejection::Corrupt(err.to_string())));
                }
                Ok(entry) if !access.can_append(entry.identity()) => {
                    warn!(
                        log = %self.id,
                        hash = %hash.fmt_short(),
                        writer = %entry.identity().fmt_short(),
                        "rejected unauthorized entry"
                    );
                    rejected.push((hash, Rejection::AccessDenied(*entry.identity())));
                }
                Ok(entry) => accepted.push(entry),
            }
        }

        let mut added = Vec::with_capacity(accepted.len());
        {
            let mut state = self.state.write();
            for (hash, rejection) in &rejected {
                if matches!(rejection, Rejection::Corrupt(_)) {
                    state.corrupt.insert(*hash);
                    state.missing.remove(hash);
                }
            }
            for entry in accepted {
                if state.insert(entry.clone()) {
                    added.push(entry);
                }
            }
            for hash in unresolved {
                if !state.is_known(&hash) {
                    state.missing.insert(hash);
                }
            }
        }
        added.sort_by_key(|e| e.key());
        JoinOutcome {
            added,
            rejected,
            fetched,
            cancelled,
        }
    }
}

#[derive(Default)]
struct Fetched {
    entries: Vec<(Hash, Result<SignedEntry, VerifyError>)>,
    unresolved: Vec<Hash>,
    fetched: usize,
    cancelled: bool,
}

/// A read locked view of an [`OpLog`].
#[derive(Debug)]
pub struct LogView<'a>(RwLockReadGuard<'a, LogState>);

impl LogView<'_> {
    pub fn len(&self) -> usize {
        self.0.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.entries.is_empty()
    }

    pub fn get(&self, hash: &Hash) -> Option<&SignedEntry> {
        self.0.entries.get(hash)
    }

    pub fn heads(&self) -> impl Iterator<Item = &Hash> {
        self.0.heads.iter()
    }

    pub fn tails(&self) -> Vec<Hash> {
        let mut tails: Vec<Hash> = self
            .0
            .entries
            .values()
            .filter(|e| e.next().iter().any(|n| self.0.missing.contains(n)))
            .map(|e| e.hash())
            .collect();
        tails.sort();
        tails
    }

    /// Key of the newest entry.
    pub fn last_key(&self) -> Option<Key> {
        self.0.order.last().copied()
    }

    /// All entries, oldest first.
    pub fn values(&self) -> impl DoubleEndedIterator<Item = &SignedEntry> {
        self.after(None)
    }

    /// Entries sorting strictly after `key`, oldest first.
    pub fn after(&self, key: Option<&Key>) -> impl DoubleEndedIterator<Item = &SignedEntry> {
        let lower = match key {
            Some(key) => Bound::Excluded(*key),
            None => Bound::Unbounded,
        };
        self.0
            .order
            .range((lower, Bound::Unbounded))
            .filter_map(|k| self.0.entries.get(&k.hash))
    }
}

/// Iterator over an [`OpLog`], newest entry first.
#[derive(Debug)]
pub struct Iter<'a> {
    log: &'a OpLog,
    keys: std::iter::Rev<std::vec::IntoIter<Key>>,
    remaining: Option<usize>,
}

impl Iter<'_> {
    /// Stop after `limit` entries.
    pub fn limit(mut self, limit: usize) -> Self {
        self.remaining = Some(limit);
        self
    }
}

impl Iterator for Iter<'_> {
    type Item = SignedEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        let key = self.keys.next()?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        // entries are never removed
        self.log.get(&key.hash)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use orbit_base::Identity;
    use proptest::prelude::*;
    use rand::SeedableRng;

    use super::*;
    use crate::{access::Grants, store::mem};

    fn identity(seed: u64) -> Identity {
        Identity::new(&mut rand_chacha::ChaCha12Rng::seed_from_u64(seed))
    }

    fn open() -> Grants {
        Grants::open()
    }

    fn payloads(log: &OpLog) -> Vec<Bytes> {
        log.values().iter().map(|e| e.payload().clone()).collect()
    }

    #[tokio::test]
    async fn append_links_heads() {
        let alice = identity(1);
        let log = OpLog::new("test", Arc::new(mem::Store::new()));
        let first = log.append(&alice, &open(), "a").await.unwrap();
        let second = log.append(&alice, &open(), "b").await.unwrap();
        assert_eq!(second.next(), &[first.hash()]);
        assert_eq!(second.clock().time, 2);
        assert_eq!(log.heads(), vec![second.hash()]);
        assert_eq!(payloads(&log), vec![Bytes::from("a"), Bytes::from("b")]);
        let newest: Vec<_> = log.iter().limit(1).map(|e| e.hash()).collect();
        assert_eq!(newest, vec![second.hash()]);
    }

    #[tokio::test]
    async fn append_denied_keeps_heads() {
        let alice = identity(1);
        let bob = identity(2);
        let log = OpLog::new("test", Arc::new(mem::Store::new()));
        let grants = Grants::for_creator(alice.id(), []);
        log.append(&alice, &grants, "a").await.unwrap();
        let heads = log.heads();
        let res = log.append(&bob, &grants, "b").await;
        assert!(matches!(res, Err(AppendError::AccessDenied(id)) if id == bob.id()));
        assert_eq!(log.heads(), heads);
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn iter_keeps_order_across_join() {
        let store = Arc::new(mem::Store::new());
        let alice = identity(1);
        let bob = identity(2);
        let a = OpLog::new("a", store.clone());
        let b = OpLog::new("b", store.clone());
        for i in 0..3 {
            a.append(&alice, &open(), format!("a{i}")).await.unwrap();
        }
        // bob's entries sort both before and after alice's
        for i in 0..5 {
            b.append(&bob, &open(), format!("b{i}")).await.unwrap();
        }
        let before: Vec<Hash> = a.iter().map(|e| e.hash()).collect();

        let mut iter = a.iter();
        let first = iter.next().unwrap();
        assert_eq!(first.hash(), before[0]);
        a.join(b.heads(), &open(), Default::default()).await;
        assert_eq!(a.len(), 8);
        let rest: Vec<Hash> = iter.map(|e| e.hash()).collect();
        assert_eq!(rest, before[1..]);

        // a fresh iterator sees the merged order
        let after: Vec<Bytes> = a.iter().map(|e| e.payload().clone()).collect();
        assert_eq!(after.len(), 8);
        assert_eq!(after[0], Bytes::from("b4"));
    }

    #[tokio::test]
    async fn join_merges_concurrent_writers() {
        let store = Arc::new(mem::Store::new());
        let alice = identity(1);
        let bob = identity(2);
        let a = OpLog::new("a", store.clone());
        let b = OpLog::new("b", store.clone());
        for i in 0..3 {
            a.append(&alice, &open(), format!("a{i}")).await.unwrap();
            b.append(&bob, &open(), format!("b{i}")).await.unwrap();
        }
        let outcome = a.join(b.heads(), &open(), Default::default()).await;
        assert_eq!(outcome.added.len(), 3);
        b.join(a.heads(), &open(), Default::default()).await;
        assert_eq!(a.heads().len(), 2);
        assert_eq!(a.heads(), b.heads());
        assert_eq!(payloads(&a), payloads(&b));

        // a write on top of both heads resolves them into one
        let merged = a.append(&alice, &open(), "merge").await.unwrap();
        assert_eq!(merged.next().len(), 2);
        assert_eq!(merged.clock().time, 4);
        assert_eq!(a.heads(), vec![merged.hash()]);
    }

    /// Store `entry` signed by `signer` instead of its writer.
    async fn forge(store: &mem::Store, signer: &Identity, entry: &Entry) -> Hash {
        #[derive(serde::Serialize)]
        struct Wire<'a> {
            entry: &'a Entry,
            signature: &'a ed25519_dalek::Signature,
        }
        let signature = Signer::sign(signer, &entry.to_vec()).unwrap();
        let bytes = postcard::to_stdvec(&Wire {
            entry,
            signature: &signature,
        })
        .unwrap();
        store.put(bytes.into()).await.unwrap()
    }

    #[tokio::test]
    async fn join_rejects_forged_entry() {
        let _guard = orbit_test::logging::setup();
        let store = Arc::new(mem::Store::new());
        let alice = identity(1);
        let mallory = identity(3);
        let a = OpLog::new("a", store.clone());
        let b = OpLog::new("b", store.clone());
        a.append(&alice, &open(), "legit").await.unwrap();

        // an entry claiming to be by alice, signed by mallory
        let clock = Clock::tick(alice.id(), []);
        let forged_entry = Entry::new(Bytes::from("forged"), clock, []);
        let forged = forge(&store, &mallory, &forged_entry).await;

        let mut heads = a.heads();
        heads.push(forged);
        let outcome = b.join(heads, &open(), Default::default()).await;
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].0, forged);
        assert!(matches!(outcome.rejected[0].1, Rejection::Corrupt(_)));
        assert!(!b.contains(&forged));
        assert_eq!(payloads(&b), vec![Bytes::from("legit")]);

        // corrupt ids are never fetched again
        let outcome = b.join([forged], &open(), Default::default()).await;
        assert_eq!(outcome.fetched, 0);
    }

    #[tokio::test]
    async fn forged_entry_inside_chain() {
        let store = Arc::new(mem::Store::new());
        let alice = identity(1);
        let mallory = identity(3);
        let a = OpLog::new("a", store.clone());
        let root = a.append(&alice, &open(), "root").await.unwrap();

        // root <- forged <- top, where only the middle entry has a bad signature
        let forged_clock = Clock::tick(alice.id(), [root.clock()]);
        let forged_entry = Entry::new(Bytes::from("forged"), forged_clock, [root.hash()]);
        let forged = forge(&store, &mallory, &forged_entry).await;
        let top = Entry::new(
            Bytes::from("top"),
            Clock::tick(alice.id(), [&forged_clock]),
            [forged],
        )
        .sign(&alice)
        .unwrap();
        store.put(top.encode().into()).await.unwrap();

        let b = OpLog::new("b", store.clone());
        let outcome = b.join([top.hash()], &open(), Default::default()).await;
        assert_eq!(outcome.added.len(), 2);
        assert!(matches!(
            outcome.rejected.as_slice(),
            [(hash, Rejection::Corrupt(_))] if *hash == forged
        ));
        assert!(!b.contains(&forged));
        assert_eq!(payloads(&b), vec![Bytes::from("root"), Bytes::from("top")]);
        // the rejected link is neither wanted nor a gap
        assert!(b.missing().is_empty());
        assert!(b.tails().is_empty());
        assert!(b.heads().contains(&top.hash()));
    }

    #[tokio::test]
    async fn join_rejects_unauthorized_but_keeps_ancestors() {
        let store = Arc::new(mem::Store::new());
        let alice = identity(1);
        let bob = identity(2);
        let a = OpLog::new("a", store.clone());
        a.append(&alice, &open(), "alice").await.unwrap();
        a.append(&bob, &open(), "bob").await.unwrap();

        let b = OpLog::new("b", store.clone());
        let grants = Grants::for_creator(alice.id(), []);
        let outcome = b.join(a.heads(), &grants, Default::default()).await;
        assert_eq!(outcome.added.len(), 1);
        assert!(matches!(
            outcome.rejected.as_slice(),
            [(_, Rejection::AccessDenied(id))] if *id == bob.id()
        ));
        assert_eq!(payloads(&b), vec![Bytes::from("alice")]);
    }

    #[tokio::test]
    async fn load_depth_leaves_tails() {
        let store = Arc::new(mem::Store::new());
        let alice = identity(1);
        let a = OpLog::new("a", store.clone());
        for i in 0..10 {
            a.append(&alice, &open(), format!("{i}")).await.unwrap();
        }

        let b = OpLog::new("b", store.clone());
        assert_eq!(b.load_state(), LoadState::Unloaded);
        let outcome = b.load(a.heads(), &open(), Some(4)).await;
        assert_eq!(outcome.added.len(), 4);
        assert_eq!(b.load_state(), LoadState::Loaded);
        assert_eq!(b.tails().len(), 1);
        assert_eq!(b.missing().len(), 1);
        let newest: Vec<Bytes> = b.values().iter().map(|e| e.payload().clone()).collect();
        assert_eq!(newest.first(), Some(&Bytes::from("6")));

        let outcome = b.load_more(&open(), None).await;
        assert_eq!(outcome.added.len(), 6);
        assert!(b.tails().is_empty());
        assert!(b.missing().is_empty());
        assert_eq!(payloads(&a), payloads(&b));
    }

    #[tokio::test]
    async fn missing_blob_becomes_tail() {
        let store = Arc::new(mem::Store::new());
        let alice = identity(1);
        let a = OpLog::new("a", store.clone());
        let first = a.append(&alice, &open(), "1").await.unwrap();
        a.append(&alice, &open(), "2").await.unwrap();
        store.remove(&first.hash());

        let b = OpLog::new("b", store.clone());
        let outcome = b.join(a.heads(), &open(), Default::default()).await;
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(b.missing(), vec![first.hash()]);
        assert_eq!(b.tails(), a.heads());
    }

    /// Content store that never answers for one id.
    #[derive(Debug)]
    struct Stall {
        inner: mem::Store,
        stalled: Hash,
    }

    impl ContentStore for Stall {
        fn put(&self, bytes: Bytes) -> futures_util::future::BoxFuture<'_, Result<Hash, StoreError>> {
            self.inner.put(bytes)
        }

        fn get(&self, hash: Hash) -> futures_util::future::BoxFuture<'_, Result<Bytes, StoreError>> {
            use futures_util::FutureExt;
            if hash == self.stalled {
                futures_util::future::pending().boxed()
            } else {
                self.inner.get(hash)
            }
        }
    }

    #[tokio::test]
    async fn cancelled_join_keeps_progress() {
        let inner = mem::Store::new();
        let alice = identity(1);
        let a = OpLog::new("a", Arc::new(inner.clone()));
        let root = a.append(&alice, &open(), "1").await.unwrap();
        a.append(&alice, &open(), "2").await.unwrap();
        a.append(&alice, &open(), "3").await.unwrap();

        let b = OpLog::new(
            "b",
            Arc::new(Stall {
                inner: inner.clone(),
                stalled: root.hash(),
            }),
        );
        let cancel = CancellationToken::new();
        let grants = open();
        let join = b.join(
            a.heads(),
            &grants,
            JoinOptions::default().with_cancel(cancel.clone()),
        );
        let canceller = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        };
        let (outcome, ()) = tokio::join!(join, canceller);
        assert!(outcome.cancelled);
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(b.missing(), vec![root.hash()]);

        // resume against a store that has everything
        let c = OpLog::new("c", Arc::new(inner));
        c.join(b.heads(), &open(), Default::default()).await;
        assert_eq!(payloads(&c), payloads(&a));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Append(usize, u8),
        Sync(usize, usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..3usize, any::<u8>()).prop_map(|(log, v)| Op::Append(log, v)),
            (0..3usize, 0..3usize).prop_map(|(a, b)| Op::Sync(a, b)),
        ]
    }

    fn run(ops: Vec<Op>) -> (Arc<mem::Store>, Vec<OpLog>) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        let store = Arc::new(mem::Store::new());
        let writers: Vec<Identity> = (0..3).map(identity).collect();
        let logs: Vec<OpLog> = (0..3)
            .map(|i| OpLog::new(format!("{i}"), store.clone()))
            .collect();
        rt.block_on(async {
            for op in ops {
                match op {
                    Op::Append(i, v) => {
                        logs[i].append(&writers[i], &open(), vec![v]).await.unwrap();
                    }
                    Op::Sync(from, to) => {
                        let heads = logs[from].heads();
                        logs[to].join(heads, &open(), Default::default()).await;
                    }
                }
            }
        });
        (store, logs)
    }

    fn snapshot(log: &OpLog) -> (Vec<Hash>, Vec<Hash>) {
        (
            log.values().iter().map(|e| e.hash()).collect(),
            log.heads(),
        )
    }

    fn join_into(rt: &tokio::runtime::Runtime, target: &OpLog, heads: Vec<Hash>) {
        rt.block_on(target.join(heads, &open(), Default::default()));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn join_is_commutative_associative_idempotent(ops in prop::collection::vec(op(), 1..24)) {
            let (store, logs) = run(ops);
            let rt = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
            let fresh = |name: &str| OpLog::new(name, store.clone());

            // a + b == b + a
            let ab = fresh("ab");
            join_into(&rt, &ab, logs[0].heads());
            join_into(&rt, &ab, logs[1].heads());
            let ba = fresh("ba");
            join_into(&rt, &ba, logs[1].heads());
            join_into(&rt, &ba, logs[0].heads());
            prop_assert_eq!(snapshot(&ab), snapshot(&ba));

            // (a + b) + c == a + (b + c)
            join_into(&rt, &ab, logs[2].heads());
            let bc = fresh("bc");
            join_into(&rt, &bc, logs[1].heads());
            join_into(&rt, &bc, logs[2].heads());
            let a_bc = fresh("a_bc");
            join_into(&rt, &a_bc, logs[0].heads());
            join_into(&rt, &a_bc, bc.heads());
            prop_assert_eq!(snapshot(&ab), snapshot(&a_bc));

            // a + a == a
            let before = snapshot(&ab);
            join_into(&rt, &ab, ab.heads());
            join_into(&rt, &ab, logs[0].heads());
            prop_assert_eq!(snapshot(&ab), before);
        }

        #[test]
        fn same_entries_same_order(ops in prop::collection::vec(op(), 1..24)) {
            let (store, logs) = run(ops);
            let rt = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
            let all: Vec<Hash> = logs.iter().flat_map(|l| l.heads()).collect();
            let x = OpLog::new("x", store.clone());
            let y = OpLog::new("y", store.clone());
            join_into(&rt, &x, all.clone());
            let mut reversed = all;
            reversed.reverse();
            for head in reversed {
                join_into(&rt, &y, vec![head]);
            }
            prop_assert_eq!(snapshot(&x), snapshot(&y));
            // the lazy walk is the exact reverse of values
            let mut walked: Vec<Hash> = x.iter().map(|e| e.hash()).collect();
            walked.reverse();
            prop_assert_eq!(walked, snapshot(&x).0);
            // every entry comes after its predecessors
            let values = x.values();
            for (i, entry) in values.iter().enumerate() {
                for next in entry.next() {
                    let pos = values.iter().position(|e| e.hash() == *next);
                    prop_assert!(pos.is_some_and(|p| p < i));
                }
            }
        }
    }
}
