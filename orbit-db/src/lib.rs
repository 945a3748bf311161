//! Peer-to-peer databases on top of signed operation logs.
//!
//! An [`OrbitDb`] opens databases by name or by [`Address`]. Each database is an
//! [`orbit_oplog::OpLog`] folded into the index of its store type: an [`EventLog`], [`Feed`],
//! [`KeyValue`], [`DocStore`] or [`Counter`]. Databases opened with `sync` exchange their heads
//! with other peers over a [`PubSub`] channel and converge to the same state.
#![deny(rustdoc::broken_intra_doc_links)]

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Weak, atomic::AtomicBool},
};

use orbit_base::{Hash, Signer};
use orbit_oplog::{
    AccessControl, ContentStore, Grants, OpLog,
    access::{AccessKind, AccessManifest, LogAccess},
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod address;
pub mod config;
pub mod database;
pub mod error;
pub mod options;
pub mod pubsub;
pub mod replicator;
pub mod state;
pub mod stores;

pub use self::{
    address::{Address, Manifest, StoreType},
    config::Config,
    database::{Database, Event, Notification},
    error::{Error, Result},
    options::OpenOptions,
    pubsub::{MemHub, MemPubSub, PubSub},
    replicator::ReplicationState,
    stores::{
        Item,
        counter::Counter,
        docstore::DocStore,
        eventlog::EventLog,
        feed::Feed,
        keyvalue::KeyValue,
    },
};
use self::{
    database::{Core, Inner},
    replicator::{Replica, ReplicatorHandle},
    state::StatePath,
    stores::{CounterIndex, DocIndex, EventIndex, FeedIndex, KvIndex, StoreIndex},
};

/// A database of any store type, as returned by [`OrbitDb::open`].
#[derive(Debug, Clone, derive_more::From)]
pub enum AnyStore {
    EventLog(EventLog),
    Feed(Feed),
    KeyValue(KeyValue),
    DocStore(DocStore),
    Counter(Counter),
}

macro_rules! each_store {
    ($self:expr, $db:ident => $body:expr) => {
        match $self {
            AnyStore::EventLog($db) => $body,
            AnyStore::Feed($db) => $body,
            AnyStore::KeyValue($db) => $body,
            AnyStore::DocStore($db) => $body,
            AnyStore::Counter($db) => $body,
        }
    };
}

impl AnyStore {
    pub fn address(&self) -> &Address {
        each_store!(self, db => db.address())
    }

    pub fn kind(&self) -> StoreType {
        each_store!(self, db => db.kind())
    }

    pub async fn load(&self, amount: Option<usize>) -> Result<usize> {
        each_store!(self, db => db.load(amount).await)
    }

    pub async fn close(&self) -> Result<()> {
        each_store!(self, db => db.close().await)
    }

    pub async fn drop(&self) -> Result<()> {
        each_store!(self, db => db.drop().await)
    }

    pub fn into_eventlog(self) -> Option<EventLog> {
        match self {
            AnyStore::EventLog(db) => Some(db),
            _ => None,
        }
    }

    pub fn into_feed(self) -> Option<Feed> {
        match self {
            AnyStore::Feed(db) => Some(db),
            _ => None,
        }
    }

    pub fn into_keyvalue(self) -> Option<KeyValue> {
        match self {
            AnyStore::KeyValue(db) => Some(db),
            _ => None,
        }
    }

    pub fn into_docstore(self) -> Option<DocStore> {
        match self {
            AnyStore::DocStore(db) => Some(db),
            _ => None,
        }
    }

    pub fn into_counter(self) -> Option<Counter> {
        match self {
            AnyStore::Counter(db) => Some(db),
            _ => None,
        }
    }
}

type OpenHandles = HashMap<Address, Weak<dyn Any + Send + Sync>>;

/// A manifest ready to be opened.
struct Resolved {
    address: Address,
    manifest: Manifest,
    /// Created just now, without local state.
    fresh: bool,
}

/// Creates and opens databases.
pub struct OrbitDb {
    identity: Arc<dyn Signer>,
    store: Arc<dyn ContentStore>,
    pubsub: Arc<dyn PubSub>,
    config: Config,
    open: Mutex<OpenHandles>,
}

impl fmt::Debug for OrbitDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrbitDb")
            .field("identity", &self.identity.id())
            .field("pubsub", &self.pubsub)
            .field("config", &self.config)
            .field("open", &self.open.lock().len())
            .finish_non_exhaustive()
    }
}

impl OrbitDb {
    /// Create an instance writing as `identity`, storing entries in `store` and replicating
    /// over `pubsub`.
    pub fn new(
        identity: Arc<dyn Signer>,
        store: Arc<dyn ContentStore>,
        pubsub: Arc<dyn PubSub>,
        config: Config,
    ) -> Self {
        info!(
            identity = %identity.id().fmt_short(),
            directory = %config.directory.display(),
            "orbitdb started"
        );
        OrbitDb {
            identity,
            store,
            pubsub,
            config,
            open: Default::default(),
        }
    }

    pub fn identity(&self) -> &Arc<dyn Signer> {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Create a new database called `name` of store type `kind`.
    ///
    /// Fails with [`Error::DatabaseExists`] if local state for the resulting address exists,
    /// unless `opts.overwrite` is set.
    pub async fn create(&self, name: &str, kind: &str, opts: OpenOptions) -> Result<AnyStore> {
        let kind = StoreType::parse(kind)?;
        let resolved = self.prepare_create(name, kind, &opts).await?;
        self.open_resolved(resolved, opts).await
    }

    /// Open a database by address, or create one by name.
    ///
    /// A name is only accepted with `opts.create` and `opts.kind` set. An address opens the
    /// database its manifest describes; with `opts.kind` set the manifest must match it.
    pub async fn open(&self, name_or_address: &str, opts: OpenOptions) -> Result<AnyStore> {
        let resolved = self.resolve(name_or_address, &opts).await?;
        self.open_resolved(resolved, opts).await
    }

    /// Open or create an [`EventLog`].
    pub async fn eventlog(&self, name_or_address: &str, opts: OpenOptions) -> Result<EventLog> {
        self.open_as::<EventIndex>(name_or_address, opts).await
    }

    /// Open or create a [`Feed`].
    pub async fn feed(&self, name_or_address: &str, opts: OpenOptions) -> Result<Feed> {
        self.open_as::<FeedIndex>(name_or_address, opts).await
    }

    /// Open or create a [`KeyValue`] store.
    pub async fn kvstore(&self, name_or_address: &str, opts: OpenOptions) -> Result<KeyValue> {
        self.open_as::<KvIndex>(name_or_address, opts).await
    }

    /// Open or create a [`DocStore`].
    pub async fn docstore(&self, name_or_address: &str, opts: OpenOptions) -> Result<DocStore> {
        self.open_as::<DocIndex>(name_or_address, opts).await
    }

    /// Open or create a [`Counter`].
    pub async fn counter(&self, name_or_address: &str, opts: OpenOptions) -> Result<Counter> {
        self.open_as::<CounterIndex>(name_or_address, opts).await
    }

    /// The address a database called `name` of type `kind` created with `opts` would have.
    pub async fn determine_address(
        &self,
        name: &str,
        kind: StoreType,
        opts: &OpenOptions,
    ) -> Result<Address> {
        if Address::is_valid(name) {
            return Err(Error::AddressNameConflict);
        }
        Ok(self.create_manifest(name, kind, opts).await?.address())
    }

    /// Typed openers create by default.
    async fn open_as<R: StoreIndex>(
        &self,
        name_or_address: &str,
        opts: OpenOptions,
    ) -> Result<Database<R>> {
        let opts = OpenOptions {
            create: true,
            kind: Some(R::TYPE),
            ..opts
        };
        let resolved = self.resolve(name_or_address, &opts).await?;
        self.open_typed::<R>(resolved, opts).await
    }

    async fn resolve(&self, name_or_address: &str, opts: &OpenOptions) -> Result<Resolved> {
        let Ok(address) = name_or_address.parse::<Address>() else {
            if !opts.create {
                return Err(Error::CreateDisabled);
            }
            let kind = opts.kind.ok_or(Error::MissingType)?;
            return self.prepare_create(name_or_address, kind, opts).await;
        };
        let manifest = self.read_manifest(&address, opts).await?;
        if let Some(requested) = opts.kind {
            if requested != manifest.kind {
                return Err(Error::TypeMismatch {
                    address,
                    actual: manifest.kind,
                    requested,
                });
            }
        }
        Ok(Resolved {
            address,
            manifest,
            fresh: false,
        })
    }

    async fn prepare_create(
        &self,
        name: &str,
        kind: StoreType,
        opts: &OpenOptions,
    ) -> Result<Resolved> {
        if Address::is_valid(name) {
            return Err(Error::AddressNameConflict);
        }
        let manifest = self.create_manifest(name, kind, opts).await?;
        let address = manifest.address();
        let exists = StatePath::new(self.directory(opts), &address)
            .exists()
            .await
            .map_err(Error::State)?;
        if exists && !opts.overwrite {
            return Err(Error::DatabaseExists(address));
        }
        debug!(%address, %kind, "created database");
        Ok(Resolved {
            address,
            manifest,
            fresh: !exists,
        })
    }

    fn directory(&self, opts: &OpenOptions) -> PathBuf {
        opts.directory
            .clone()
            .unwrap_or_else(|| self.config.directory.clone())
    }

    async fn create_manifest(
        &self,
        name: &str,
        kind: StoreType,
        opts: &OpenOptions,
    ) -> Result<Manifest> {
        address::validate_name(name)?;
        let access = AccessManifest {
            kind: opts.access,
            grants: Grants::for_creator(self.identity.id(), opts.write.iter().cloned()),
        };
        let bytes = access.to_bytes().map_err(anyhow::Error::from)?;
        let access_hash = self.store.put(bytes).await?;
        let manifest = Manifest::new(name, kind, access_hash);
        self.store.put(manifest.to_bytes()).await?;
        Ok(manifest)
    }

    async fn read_manifest(&self, address: &Address, opts: &OpenOptions) -> Result<Manifest> {
        let state = StatePath::new(self.directory(opts), address);
        if opts.local_only && !state.exists().await.map_err(Error::State)? {
            return Err(Error::NotFoundLocally(address.clone()));
        }
        let bytes = self.store.get(address.root()).await?;
        if Hash::new(&bytes) != address.root() {
            return Err(Error::CorruptEntry(format!("manifest of {address}")));
        }
        let manifest = Manifest::from_bytes(&bytes)?;
        if manifest.name != address.path() {
            return Err(Error::InvalidAddress(address.to_string()));
        }
        Ok(manifest)
    }

    async fn open_access(&self, address: &Address, manifest: &Manifest) -> Result<AccessControl> {
        let bytes = self.store.get(manifest.access_manifest()?).await?;
        let access = AccessManifest::from_bytes(&bytes)
            .map_err(|err| Error::CorruptEntry(format!("access manifest: {err}")))?;
        Ok(match access.kind {
            AccessKind::Static => AccessControl::Static(Arc::new(access.grants)),
            AccessKind::Log => {
                let log = OpLog::new(format!("{address}/_access"), self.store.clone())
                    .with_max_in_flight(self.config.max_in_flight);
                AccessControl::Log(Arc::new(LogAccess::new(log, access.grants)))
            }
        })
    }

    async fn open_resolved(&self, resolved: Resolved, opts: OpenOptions) -> Result<AnyStore> {
        Ok(match resolved.manifest.kind {
            StoreType::EventLog => self.open_typed::<EventIndex>(resolved, opts).await?.into(),
            StoreType::Feed => self.open_typed::<FeedIndex>(resolved, opts).await?.into(),
            StoreType::KeyValue => self.open_typed::<KvIndex>(resolved, opts).await?.into(),
            StoreType::DocStore => self.open_typed::<DocIndex>(resolved, opts).await?.into(),
            StoreType::Counter => self.open_typed::<CounterIndex>(resolved, opts).await?.into(),
        })
    }

    /// An open handle to `address`, if there is one of type `R`.
    fn cached<R: StoreIndex>(&self, address: &Address) -> Option<Database<R>> {
        let inner = self.open.lock().get(address)?.upgrade()?;
        let inner = inner.downcast::<Inner<R>>().ok()?;
        if inner.is_closed() {
            return None;
        }
        Some(Database { inner })
    }

    async fn open_typed<R: StoreIndex>(
        &self,
        resolved: Resolved,
        opts: OpenOptions,
    ) -> Result<Database<R>> {
        let Resolved {
            address,
            manifest,
            fresh,
        } = resolved;
        if manifest.kind != R::TYPE {
            return Err(Error::TypeMismatch {
                address,
                actual: manifest.kind,
                requested: R::TYPE,
            });
        }
        if let Some(db) = self.cached::<R>(&address) {
            return Ok(db);
        }
        let access = self.open_access(&address, &manifest).await?;
        let state = StatePath::new(self.directory(&opts), &address);
        let lock = state.lock().map_err(Error::State)?;
        let log = OpLog::new(address.to_string(), self.store.clone())
            .with_max_in_flight(self.config.max_in_flight);
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        let (replication_tx, replication) = watch::channel(ReplicationState::Idle);
        let cancel = CancellationToken::new();
        let core = Core {
            address: address.clone(),
            manifest,
            identity: self.identity.clone(),
            access,
            log,
            state,
            load_depth: self.config.load_depth,
            events,
            replication,
            mutation: Default::default(),
            lock: Mutex::new(Some(lock)),
            replicator: Default::default(),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
        };
        let db = Database::new(core, R::new(&opts));
        if fresh {
            db.persist().await?;
        }
        let weak: Weak<Inner<R>> = Arc::downgrade(&db.inner);
        if opts.sync {
            let replica: Weak<dyn Replica> = weak.clone();
            let handle = ReplicatorHandle::spawn(
                replica,
                &address,
                self.pubsub.clone(),
                &self.config,
                replication_tx,
                cancel,
            );
            db.set_replicator(handle);
        }
        let handle: Weak<dyn Any + Send + Sync> = weak;
        self.open.lock().insert(address.clone(), handle);
        debug!(%address, kind = %R::TYPE, sync = opts.sync, "opened database");
        Ok(db)
    }
}
