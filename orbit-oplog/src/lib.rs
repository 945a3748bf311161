//! Signed, content addressed operation logs.
//!
//! An [`OpLog`] is a set of [`SignedEntry`]s, each pointing at its causal predecessors by
//! content id. Logs are merged with [`OpLog::join`], which lazily pulls missing ancestors from
//! a [`ContentStore`] and checks every entry against an [`AccessControl`]. The merged entries
//! have a single deterministic order, which an [`Index`] folds into derived state.
#![deny(rustdoc::broken_intra_doc_links)]

pub mod access;
pub mod entry;
pub mod index;
pub mod log;
pub mod store;

pub use self::{
    access::{AccessControl, CanAppend, Grantee, Grants, Role},
    entry::{Clock, Entry, Key, SignedEntry},
    index::{Index, Reducer},
    log::{JoinOptions, JoinOutcome, LoadState, OpLog, Rejection},
    store::{ContentStore, StoreError},
};
