//! Derived state replayed from a log.

use tracing::trace;

use crate::{
    entry::{Key, SignedEntry},
    log::OpLog,
};

/// Folds entries, in log order, into some state.
///
/// Must be deterministic: the same entries in the same order always produce the same state.
pub trait Reducer: Clone + Send + Sync + 'static {
    fn apply(&mut self, entry: &SignedEntry);
}

/// What an [`Index::update`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Update {
    /// No new entries.
    Unchanged,
    /// New entries were applied on top of the previous state.
    Incremental(usize),
    /// Some new entry sorted before an applied one, so everything was replayed.
    Rebuilt(usize),
}

/// A [`Reducer`] kept in sync with an [`OpLog`].
///
/// The state can always be thrown away and rebuilt from the log.
#[derive(Debug, Clone)]
pub struct Index<R> {
    initial: R,
    state: R,
    last: Option<Key>,
    applied: usize,
}

impl<R: Reducer> Index<R> {
    /// Create an index starting from `initial`.
    pub fn new(initial: R) -> Self {
        Index {
            state: initial.clone(),
            initial,
            last: None,
            applied: 0,
        }
    }

    /// Current state.
    pub fn get(&self) -> &R {
        &self.state
    }

    /// Number of entries the state was built from.
    pub fn applied(&self) -> usize {
        self.applied
    }

    /// Bring the state up to date with `log`.
    ///
    /// New entries are applied incrementally only if all of them sort after the last applied
    /// entry. Otherwise the state is rebuilt from scratch.
    pub fn update(&mut self, log: &OpLog) -> Update {
        let view = log.read();
        let total = view.len();
        if total == self.applied {
            return Update::Unchanged;
        }
        let newer: Vec<&SignedEntry> = view.after(self.last.as_ref()).collect();
        let update = if self.applied + newer.len() == total {
            for entry in &newer {
                self.state.apply(entry);
            }
            Update::Incremental(newer.len())
        } else {
            self.state = self.initial.clone();
            for entry in view.values() {
                self.state.apply(entry);
            }
            Update::Rebuilt(total)
        };
        self.last = view.last_key();
        self.applied = total;
        trace!(log = %log.id(), ?update, "index updated");
        update
    }

    /// Drop the state and replay the whole log.
    pub fn rebuild(&mut self, log: &OpLog) {
        self.state = self.initial.clone();
        self.last = None;
        self.applied = 0;
        self.update(log);
    }
}
