//! Handles to open databases.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::Result as AnyResult;
use futures_util::{FutureExt, future::BoxFuture};
use orbit_base::{Hash, Signer};
use orbit_oplog::{AccessControl, Grantee, Index, JoinOptions, OpLog, Role, SignedEntry};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{MutexGuard, broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::{
    address::{Address, Manifest, StoreType},
    error::{Error, Result},
    replicator::{Announcement, Replica, ReplicationState, ReplicatorHandle},
    state::{LocalState, LockGuard, StatePath},
    stores::StoreIndex,
};

/// Something that happened to a database.
#[derive(Debug, Clone)]
pub enum Event {
    /// [`Database::load`] finished.
    Ready,
    /// An entry was appended locally.
    Write {
        entry: SignedEntry,
        heads: Vec<Hash>,
    },
    /// The first message from a peer on the database's topic arrived.
    Peer { peer: crate::pubsub::PeerId },
    /// Entries from peers were merged.
    Replicated { count: usize },
    /// Entries were loaded from the content store.
    Load { loaded: usize },
}

/// An [`Event`] together with the database it happened to.
#[derive(Debug, Clone)]
pub struct Notification {
    pub address: Address,
    pub event: Event,
}

/// State shared by every store type.
pub(crate) struct Core {
    pub(crate) address: Address,
    pub(crate) manifest: Manifest,
    pub(crate) identity: Arc<dyn Signer>,
    pub(crate) access: AccessControl,
    pub(crate) log: OpLog,
    pub(crate) state: StatePath,
    pub(crate) load_depth: Option<usize>,
    pub(crate) events: broadcast::Sender<Notification>,
    pub(crate) replication: watch::Receiver<ReplicationState>,
    /// Serializes appends, joins and index updates.
    pub(crate) mutation: tokio::sync::Mutex<()>,
    pub(crate) lock: Mutex<Option<LockGuard>>,
    pub(crate) replicator: Mutex<Option<ReplicatorHandle>>,
    pub(crate) closed: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

impl Core {
    fn emit(&self, event: Event) {
        // no receivers is fine
        self.events
            .send(Notification {
                address: self.address.clone(),
                event,
            })
            .ok();
    }

    fn announce(&self) {
        if let Some(replicator) = &*self.replicator.lock() {
            replicator.announce();
        }
    }

    async fn persist(&self) -> Result<()> {
        let state = LocalState {
            manifest: self.address.root(),
            heads: self.log.heads(),
            access_heads: self.access.heads(),
        };
        self.state.save(&state).await.map_err(Error::State)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed(self.address.clone()));
        }
        Ok(())
    }
}

pub(crate) struct Inner<R> {
    pub(crate) core: Core,
    index: RwLock<Index<R>>,
}

impl<R: StoreIndex> Inner<R> {
    pub(crate) fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    async fn merge_heads(
        &self,
        announcement: Announcement,
        cancel: CancellationToken,
    ) -> AnyResult<usize> {
        let _guard = self.core.mutation.lock().await;
        if self.core.is_closed() {
            return Ok(0);
        }
        let opts = JoinOptions::default()
            .with_load_depth(self.core.load_depth)
            .with_cancel(cancel);
        let acl = self
            .core
            .access
            .join(announcement.access_heads, opts.clone())
            .await;
        let outcome = self
            .core
            .log
            .join(announcement.heads, &self.core.access, opts)
            .await;
        if outcome.is_empty() && acl.is_empty() {
            return Ok(0);
        }
        let update = self.index.write().update(&self.core.log);
        trace!(?update, "index updated after merge");
        self.core.persist().await?;
        Ok(outcome.added.len())
    }
}

impl<R: StoreIndex> Replica for Inner<R> {
    fn announcement(&self) -> Announcement {
        Announcement {
            heads: self.core.log.heads(),
            access_heads: self.core.access.heads(),
        }
    }

    fn knows(&self, announcement: &Announcement) -> bool {
        let access_log = match &self.core.access {
            AccessControl::Log(access) => Some(access.log()),
            AccessControl::Static(_) => None,
        };
        announcement.heads.iter().all(|h| self.core.log.contains(h))
            && announcement
                .access_heads
                .iter()
                .all(|h| access_log.is_none_or(|log| log.contains(h)))
    }

    fn merge(
        &self,
        announcement: Announcement,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, AnyResult<usize>> {
        self.merge_heads(announcement, cancel).boxed()
    }

    fn notify(&self, event: Event) {
        self.core.emit(event);
    }
}

/// Handle to an open database of store type `R`.
///
/// Cheap to clone. All clones share the same state; the database stays open until
/// [`Database::close`] is called or the last clone is dropped.
pub struct Database<R> {
    pub(crate) inner: Arc<Inner<R>>,
}

impl<R> Clone for Database<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: StoreIndex> fmt::Debug for Database<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("address", &self.inner.core.address)
            .field("type", &R::TYPE)
            .field("entries", &self.inner.core.log.len())
            .finish_non_exhaustive()
    }
}

impl<R: StoreIndex> Database<R> {
    pub(crate) fn new(core: Core, index: R) -> Self {
        Database {
            inner: Arc::new(Inner {
                core,
                index: RwLock::new(Index::new(index)),
            }),
        }
    }

    /// Start replicating through `handle`'s actor.
    pub(crate) fn set_replicator(&self, handle: ReplicatorHandle) {
        *self.inner.core.replicator.lock() = Some(handle);
    }

    pub fn address(&self) -> &Address {
        &self.inner.core.address
    }

    pub fn manifest(&self) -> &Manifest {
        &self.inner.core.manifest
    }

    pub fn kind(&self) -> StoreType {
        R::TYPE
    }

    /// The identity entries are written as.
    pub fn identity(&self) -> &Arc<dyn Signer> {
        &self.inner.core.identity
    }

    pub fn access(&self) -> &AccessControl {
        &self.inner.core.access
    }

    pub fn log(&self) -> &OpLog {
        &self.inner.core.log
    }

    pub fn heads(&self) -> Vec<Hash> {
        self.inner.core.log.heads()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.core.is_closed()
    }

    /// Receive notifications for this database.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.inner.core.events.subscribe()
    }

    /// Notifications for this database as a stream.
    pub fn events(&self) -> BroadcastStream<Notification> {
        BroadcastStream::new(self.subscribe())
    }

    /// Replication progress. Stays [`ReplicationState::Idle`] if the database was opened
    /// without `sync`.
    pub fn replication_state(&self) -> watch::Receiver<ReplicationState> {
        self.inner.core.replication.clone()
    }

    /// Load the log from the persisted heads, fetching at most `amount` entries.
    ///
    /// Emits [`Event::Load`] and then [`Event::Ready`]. Returns the number of loaded entries.
    pub async fn load(&self, amount: Option<usize>) -> Result<usize> {
        let core = &self.inner.core;
        let _guard = self.write_lock().await;
        core.ensure_open()?;
        let (heads, access_heads) = match core.state.load().await.map_err(Error::State)? {
            Some(state) => (state.heads, state.access_heads),
            None => Default::default(),
        };
        let amount = amount.or(core.load_depth);
        core.access.load(access_heads, None).await;
        let outcome = core.log.load(heads, &core.access, amount).await;
        self.inner.index.write().update(&core.log);
        let loaded = outcome.added.len();
        debug!(db = %core.address.fmt_short(), loaded, missing = core.log.missing().len(), "loaded");
        core.emit(Event::Load { loaded });
        core.emit(Event::Ready);
        Ok(loaded)
    }

    /// Continue loading past the entries [`Database::load`] stopped at.
    pub async fn load_more(&self, amount: Option<usize>) -> Result<usize> {
        let core = &self.inner.core;
        let _guard = self.write_lock().await;
        core.ensure_open()?;
        let outcome = core.log.load_more(&core.access, amount).await;
        self.inner.index.write().update(&core.log);
        let loaded = outcome.added.len();
        core.emit(Event::Load { loaded });
        Ok(loaded)
    }

    /// Give `grantee` the `role` in a log backed access controller.
    pub async fn grant(&self, role: Role, grantee: Grantee) -> Result<()> {
        let core = &self.inner.core;
        let _guard = self.write_lock().await;
        core.ensure_open()?;
        core.access.grant(&*core.identity, role, grantee).await?;
        core.persist().await?;
        core.announce();
        Ok(())
    }

    /// Take the `role` from `grantee` in a log backed access controller.
    pub async fn revoke(&self, role: Role, grantee: Grantee) -> Result<()> {
        let core = &self.inner.core;
        let _guard = self.write_lock().await;
        core.ensure_open()?;
        core.access.revoke(&*core.identity, role, grantee).await?;
        core.persist().await?;
        core.announce();
        Ok(())
    }

    /// Stop replicating, persist the heads and release the database.
    ///
    /// Reads keep working on a closed handle; writes fail with [`Error::Closed`].
    pub async fn close(&self) -> Result<()> {
        let core = &self.inner.core;
        if core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        core.cancel.cancel();
        let replicator = core.replicator.lock().take();
        if let Some(replicator) = replicator {
            replicator.shutdown().await;
        }
        let _guard = core.mutation.lock().await;
        core.persist().await?;
        core.lock.lock().take();
        debug!(db = %core.address.fmt_short(), "closed");
        Ok(())
    }

    /// Close the database and delete its local state.
    pub async fn drop(&self) -> Result<()> {
        self.close().await?;
        self.inner.core.state.remove().await.map_err(Error::State)?;
        debug!(db = %self.address().fmt_short(), "dropped");
        Ok(())
    }

    pub(crate) async fn persist(&self) -> Result<()> {
        self.inner.core.persist().await
    }

    /// Read the index.
    pub(crate) fn with_index<T>(&self, f: impl FnOnce(&R) -> T) -> T {
        f(self.inner.index.read().get())
    }

    pub(crate) async fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.inner.core.mutation.lock().await
    }

    /// Append an operation and apply it to the index.
    pub(crate) async fn append(&self, payload: Vec<u8>) -> Result<SignedEntry> {
        let _guard = self.write_lock().await;
        self.append_locked(payload).await
    }

    /// Like [`Database::append`], for callers already holding [`Database::write_lock`].
    pub(crate) async fn append_locked(&self, payload: Vec<u8>) -> Result<SignedEntry> {
        let core = &self.inner.core;
        core.ensure_open()?;
        let entry = core
            .log
            .append(&*core.identity, &core.access, payload)
            .await?;
        self.inner.index.write().update(&core.log);
        core.persist().await?;
        trace!(db = %core.address.fmt_short(), hash = %entry.hash().fmt_short(), "write");
        core.emit(Event::Write {
            entry: entry.clone(),
            heads: core.log.heads(),
        });
        core.announce();
        Ok(entry)
    }
}
