//! Write access control for logs.
//!
//! An [`AccessControl`] is either a fixed set of [`Grants`], or a set of grants derived from a
//! log of grant and revoke operations. The log backing an access controller is itself gated
//! by an open static controller, and only operations by admins take effect when the log is
//! replayed.

use std::{fmt, str::FromStr, sync::Arc};

use bytes::Bytes;
use orbit_base::{Hash, IdentityId, Signer};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    entry::SignedEntry,
    index::{Index, Reducer},
    log::{AppendError, JoinOptions, JoinOutcome, OpLog},
};

/// Decides whether an identity may add entries to a log.
pub trait CanAppend: Send + Sync {
    fn can_append(&self, identity: &IdentityId) -> bool;
}

/// A role an identity can be granted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Admin,
    Write,
    Read,
}

/// An identity, or everyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Grantee {
    /// `*`
    Any,
    Id(IdentityId),
}

impl Grantee {
    fn matches(&self, identity: &IdentityId) -> bool {
        match self {
            Grantee::Any => true,
            Grantee::Id(id) => id == identity,
        }
    }
}

impl From<IdentityId> for Grantee {
    fn from(id: IdentityId) -> Self {
        Grantee::Id(id)
    }
}

impl fmt::Display for Grantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Grantee::Any => f.write_str("*"),
            Grantee::Id(id) => fmt::Display::fmt(id, f),
        }
    }
}

impl FromStr for Grantee {
    type Err = orbit_base::key::KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "*" => Ok(Grantee::Any),
            s => Ok(Grantee::Id(s.parse()?)),
        }
    }
}

impl From<Grantee> for String {
    fn from(value: Grantee) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for Grantee {
    type Error = orbit_base::key::KeyParsingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Members of each role, in the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grants {
    pub admin: Vec<Grantee>,
    pub write: Vec<Grantee>,
    pub read: Vec<Grantee>,
}

impl Grants {
    /// Everyone may write, nobody may administer.
    pub fn open() -> Self {
        Grants {
            write: vec![Grantee::Any],
            ..Default::default()
        }
    }

    /// `creator` administers and writes; `writers` may write as well.
    pub fn for_creator(
        creator: IdentityId,
        writers: impl IntoIterator<Item = Grantee>,
    ) -> Self {
        let mut write: Vec<Grantee> = Vec::new();
        for grantee in writers {
            if !write.contains(&grantee) && grantee != Grantee::Id(creator) {
                write.push(grantee);
            }
        }
        write.push(Grantee::Id(creator));
        Grants {
            admin: vec![Grantee::Id(creator)],
            write,
            read: Vec::new(),
        }
    }

    pub fn members(&self, role: Role) -> &[Grantee] {
        match role {
            Role::Admin => &self.admin,
            Role::Write => &self.write,
            Role::Read => &self.read,
        }
    }

    fn members_mut(&mut self, role: Role) -> &mut Vec<Grantee> {
        match role {
            Role::Admin => &mut self.admin,
            Role::Write => &mut self.write,
            Role::Read => &mut self.read,
        }
    }

    pub fn can_administer(&self, identity: &IdentityId) -> bool {
        self.admin.iter().any(|g| g.matches(identity))
    }

    pub fn can_read(&self, identity: &IdentityId) -> bool {
        self.read.iter().any(|g| g.matches(identity)) || self.can_append(identity)
    }

    fn apply(&mut self, op: &AclOp) {
        match op {
            AclOp::Grant { role, grantee } => {
                let members = self.members_mut(*role);
                if !members.contains(grantee) {
                    members.push(*grantee);
                }
            }
            AclOp::Revoke { role, grantee } => {
                self.members_mut(*role).retain(|g| g != grantee);
            }
        }
    }
}

impl CanAppend for Grants {
    fn can_append(&self, identity: &IdentityId) -> bool {
        self.write.iter().any(|g| g.matches(identity)) || self.can_administer(identity)
    }
}

/// Kind of access controller named in an [`AccessManifest`].
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AccessKind {
    /// Grants fixed at creation.
    #[default]
    Static,
    /// Grants replayed from a log of grant and revoke operations.
    Log,
}

/// The immutable description of an access controller, stored as JSON in the content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessManifest {
    #[serde(rename = "type")]
    pub kind: AccessKind,
    #[serde(flatten)]
    pub grants: Grants,
}

impl AccessManifest {
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// An operation in the log of a log backed access controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum AclOp {
    Grant { role: Role, grantee: Grantee },
    Revoke { role: Role, grantee: Grantee },
}

/// Error from mutating an [`AccessControl`].
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The caller is not an admin.
    #[error("identity {0} is not allowed to administer")]
    AccessDenied(IdentityId),
    /// Static grants can't change.
    #[error("access controller is immutable")]
    Immutable,
    #[error(transparent)]
    Append(#[from] AppendError),
}

/// Grants replayed from the access log.
#[derive(Debug, Clone)]
struct AclState(Grants);

impl Reducer for AclState {
    fn apply(&mut self, entry: &SignedEntry) {
        let op: AclOp = match serde_json::from_slice(entry.payload()) {
            Ok(op) => op,
            Err(err) => {
                debug!(hash = %entry.hash().fmt_short(), %err, "ignoring undecodable acl op");
                return;
            }
        };
        if !self.0.can_administer(entry.identity()) {
            trace!(
                hash = %entry.hash().fmt_short(),
                writer = %entry.identity().fmt_short(),
                "ignoring acl op from non-admin"
            );
            return;
        }
        self.0.apply(&op);
    }
}

/// Access controller backed by a log of [`AclOp`]s.
#[derive(Debug)]
pub struct LogAccess {
    log: OpLog,
    gate: Grants,
    index: RwLock<Index<AclState>>,
}

impl LogAccess {
    /// Create a controller starting from `genesis`, storing its operations in `log`.
    pub fn new(log: OpLog, genesis: Grants) -> Self {
        LogAccess {
            log,
            gate: Grants::open(),
            index: RwLock::new(Index::new(AclState(genesis))),
        }
    }

    pub fn log(&self) -> &OpLog {
        &self.log
    }

    fn grants(&self) -> Grants {
        self.index.read().get().0.clone()
    }

    async fn append(&self, caller: &dyn Signer, op: AclOp) -> Result<SignedEntry, AccessError> {
        let id = caller.id();
        if !self.index.read().get().0.can_administer(&id) {
            return Err(AccessError::AccessDenied(id));
        }
        // serializing a plain enum into a Vec cannot fail
        let payload = serde_json::to_vec(&op).unwrap_or_default();
        let entry = self.log.append(caller, &self.gate, payload).await?;
        self.index.write().update(&self.log);
        debug!(?op, by = %id.fmt_short(), "acl updated");
        Ok(entry)
    }

    async fn join(&self, heads: Vec<Hash>, opts: JoinOptions) -> JoinOutcome {
        let outcome = self.log.join(heads, &self.gate, opts).await;
        if !outcome.is_empty() {
            self.index.write().update(&self.log);
        }
        outcome
    }

    async fn load(&self, heads: Vec<Hash>, amount: Option<usize>) -> JoinOutcome {
        let outcome = self.log.load(heads, &self.gate, amount).await;
        self.index.write().update(&self.log);
        outcome
    }
}

/// Access controller of a database.
#[derive(Debug, Clone)]
pub enum AccessControl {
    /// Fixed grants. With [`Grants::open`] this is the bootstrap controller.
    Static(Arc<Grants>),
    /// Grants derived from a log.
    Log(Arc<LogAccess>),
}

impl AccessControl {
    pub fn open() -> Self {
        AccessControl::Static(Arc::new(Grants::open()))
    }

    pub fn kind(&self) -> AccessKind {
        match self {
            AccessControl::Static(_) => AccessKind::Static,
            AccessControl::Log(_) => AccessKind::Log,
        }
    }

    /// Snapshot of the current grants.
    pub fn grants(&self) -> Grants {
        match self {
            AccessControl::Static(grants) => (**grants).clone(),
            AccessControl::Log(log) => log.grants(),
        }
    }

    pub fn can_administer(&self, identity: &IdentityId) -> bool {
        match self {
            AccessControl::Static(grants) => grants.can_administer(identity),
            AccessControl::Log(log) => log.index.read().get().0.can_administer(identity),
        }
    }

    /// Give `grantee` the `role`. Requires `caller` to be an admin.
    pub async fn grant(
        &self,
        caller: &dyn Signer,
        role: Role,
        grantee: Grantee,
    ) -> Result<SignedEntry, AccessError> {
        match self {
            AccessControl::Static(_) => Err(AccessError::Immutable),
            AccessControl::Log(log) => log.append(caller, AclOp::Grant { role, grantee }).await,
        }
    }

    /// Take the `role` from `grantee`. Requires `caller` to be an admin.
    pub async fn revoke(
        &self,
        caller: &dyn Signer,
        role: Role,
        grantee: Grantee,
    ) -> Result<SignedEntry, AccessError> {
        match self {
            AccessControl::Static(_) => Err(AccessError::Immutable),
            AccessControl::Log(log) => log.append(caller, AclOp::Revoke { role, grantee }).await,
        }
    }

    /// Heads of the access log. Empty for static grants.
    pub fn heads(&self) -> Vec<Hash> {
        match self {
            AccessControl::Static(_) => Vec::new(),
            AccessControl::Log(log) => log.log.heads(),
        }
    }

    /// Merge remote access log heads.
    pub async fn join(&self, heads: Vec<Hash>, opts: JoinOptions) -> JoinOutcome {
        match self {
            AccessControl::Static(_) => JoinOutcome::default(),
            AccessControl::Log(log) => log.join(heads, opts).await,
        }
    }

    /// Load persisted access log heads.
    pub async fn load(&self, heads: Vec<Hash>, amount: Option<usize>) -> JoinOutcome {
        match self {
            AccessControl::Static(_) => JoinOutcome::default(),
            AccessControl::Log(log) => log.load(heads, amount).await,
        }
    }
}

impl CanAppend for AccessControl {
    fn can_append(&self, identity: &IdentityId) -> bool {
        match self {
            AccessControl::Static(grants) => grants.can_append(identity),
            AccessControl::Log(log) => log.index.read().get().0.can_append(identity),
        }
    }
}

#[cfg(test)]
mod tests {
    use orbit_base::Identity;
    use rand::SeedableRng;

    use super::*;
    use crate::store::mem;

    fn identity(seed: u64) -> Identity {
        Identity::new(&mut rand_chacha::ChaCha12Rng::seed_from_u64(seed))
    }

    fn log_access(store: &mem::Store, genesis: Grants) -> AccessControl {
        let log = OpLog::new("acl", Arc::new(store.clone()));
        AccessControl::Log(Arc::new(LogAccess::new(log, genesis)))
    }

    #[test]
    fn creator_defaults() {
        let alice = identity(1).id();
        let bob = identity(2).id();
        let grants = Grants::for_creator(alice, [Grantee::Id(bob), Grantee::Id(alice)]);
        assert_eq!(grants.admin, vec![Grantee::Id(alice)]);
        assert_eq!(grants.write, vec![Grantee::Id(bob), Grantee::Id(alice)]);
        assert!(grants.read.is_empty());
        assert!(grants.can_append(&bob));
        assert!(!grants.can_administer(&bob));
    }

    #[test]
    fn manifest_json() {
        let alice = identity(1).id();
        let manifest = AccessManifest {
            kind: AccessKind::Static,
            grants: Grants::for_creator(alice, [Grantee::Any]),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(json["type"], "static");
        assert_eq!(json["write"][0], "*");
        assert_eq!(json["admin"][0], alice.to_string());
        let back = AccessManifest::from_bytes(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(back, manifest);
    }

    #[tokio::test]
    async fn static_is_immutable() {
        let alice = identity(1);
        let access = AccessControl::Static(Arc::new(Grants::for_creator(alice.id(), [])));
        let res = access.grant(&alice, Role::Write, Grantee::Any).await;
        assert!(matches!(res, Err(AccessError::Immutable)));
    }

    #[tokio::test]
    async fn grant_and_revoke() {
        let store = mem::Store::new();
        let alice = identity(1);
        let bob = identity(2);
        let access = log_access(&store, Grants::for_creator(alice.id(), []));
        assert!(!access.can_append(&bob.id()));

        let res = access.grant(&bob, Role::Write, bob.id().into()).await;
        assert!(matches!(res, Err(AccessError::AccessDenied(id)) if id == bob.id()));

        access.grant(&alice, Role::Write, bob.id().into()).await.unwrap();
        assert!(access.can_append(&bob.id()));
        access.revoke(&alice, Role::Write, bob.id().into()).await.unwrap();
        assert!(!access.can_append(&bob.id()));
    }

    #[tokio::test]
    async fn replicated_ops_from_non_admins_are_ignored() {
        let store = mem::Store::new();
        let alice = identity(1);
        let mallory = identity(3);
        let genesis = Grants::for_creator(alice.id(), []);

        // mallory writes straight into the open access log, bypassing the admin check
        let rogue = OpLog::new("acl", Arc::new(store.clone()));
        let op = serde_json::to_vec(&AclOp::Grant {
            role: Role::Admin,
            grantee: mallory.id().into(),
        })
        .unwrap();
        rogue.append(&mallory, &Grants::open(), op).await.unwrap();

        let access = log_access(&store, genesis.clone());
        let outcome = access.join(rogue.heads(), Default::default()).await;
        assert_eq!(outcome.added.len(), 1);
        assert_eq!(access.grants(), genesis);
        assert!(!access.can_administer(&mallory.id()));

        // a grant by alice replicates to another controller
        access.grant(&alice, Role::Write, mallory.id().into()).await.unwrap();
        let other = log_access(&store, genesis);
        other.join(access.heads(), Default::default()).await;
        assert!(other.can_append(&mallory.id()));
    }
}
