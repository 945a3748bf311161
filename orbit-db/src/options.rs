//! Options for creating and opening databases.

use std::path::PathBuf;

use orbit_oplog::{Grantee, access::AccessKind};

use crate::address::StoreType;

/// Options for [`crate::OrbitDb::open`] and [`crate::OrbitDb::create`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Create the database if a name instead of an address is given.
    pub create: bool,
    /// Store type to create, or to require when opening.
    pub kind: Option<StoreType>,
    /// Create even if local state for the address exists.
    pub overwrite: bool,
    /// Fail with [`crate::Error::NotFoundLocally`] instead of fetching the manifest.
    pub local_only: bool,
    /// Replicate with peers on the pub/sub channel.
    pub sync: bool,
    /// Directory for local state, instead of [`crate::Config::directory`].
    pub directory: Option<PathBuf>,
    /// Writers besides the creator.
    pub write: Vec<Grantee>,
    /// Access controller kind to create.
    pub access: AccessKind,
    /// Document field used as key in a docstore.
    pub index_by: Option<String>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create: false,
            kind: None,
            overwrite: false,
            local_only: false,
            sync: true,
            directory: None,
            write: Vec::new(),
            access: AccessKind::Static,
            index_by: None,
        }
    }
}

impl OpenOptions {
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn kind(mut self, kind: StoreType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn write(mut self, writers: impl IntoIterator<Item = Grantee>) -> Self {
        self.write = writers.into_iter().collect();
        self
    }

    pub fn access(mut self, access: AccessKind) -> Self {
        self.access = access;
        self
    }

    pub fn index_by(mut self, field: impl Into<String>) -> Self {
        self.index_by = Some(field.into());
        self
    }
}
