//! Identity remap protocol.
//!
//! Record identities are immutable values. When storage (or a server log)
//! replaces a temporary identity with a final one, every structure keyed by
//! the old identity is emptied of it in `on_before_identity_change`, the
//! lifted state waits in the in-transit table, and `on_after_identity_change`
//! reinserts it under the new identity and records `old -> new` so later
//! lookups by the old identity are redirected.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::debug;

use crate::errors::{GraphTxError, Result};
use crate::ledger::RecordOperation;
use crate::rid::Rid;

/// Receives the two halves of an identity change.
///
/// Implementations must leave no structure keyed by `old` between the two
/// calls, and must accept `new` as the only key afterwards.
pub trait IdentityChangeListener {
    fn on_before_identity_change(&mut self, old: Rid) -> Result<()>;
    fn on_after_identity_change(&mut self, old: Rid, new: Rid) -> Result<()>;
}

/// Transaction state lifted out for one identity while it changes.
#[derive(Debug, Default)]
pub(crate) struct InTransit {
    pub(crate) operation: Option<RecordOperation>,
    /// Positions the identity held in the callback queues.
    pub(crate) before_queue: Vec<usize>,
    pub(crate) after_queue: Vec<usize>,
}

#[derive(Debug, Default)]
pub struct IdentityRemap {
    /// Identities that may still change: temporary ones registered by the ledger.
    watched: HashSet<Rid>,
    in_transit: HashMap<Rid, InTransit>,
    mapping: HashMap<Rid, Rid>,
}

impl IdentityRemap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&mut self, rid: Rid) {
        self.watched.insert(rid);
    }

    pub fn is_watched(&self, rid: &Rid) -> bool {
        self.watched.contains(rid)
    }

    pub(crate) fn stash(&mut self, old: Rid, transit: InTransit) -> Result<()> {
        if self.in_transit.contains_key(&old) {
            return Err(GraphTxError::Consistency(format!(
                "identity {} is already changing",
                old
            )));
        }
        self.in_transit.insert(old, transit);
        Ok(())
    }

    pub(crate) fn unstash(&mut self, old: &Rid) -> Result<InTransit> {
        self.in_transit.remove(old).ok_or_else(|| {
            GraphTxError::Consistency(format!(
                "identity change of {} completed without being started",
                old
            ))
        })
    }

    /// Records `old -> new`, redirecting earlier mappings that ended at `old`.
    pub(crate) fn record_change(&mut self, old: Rid, new: Rid) {
        for target in self.mapping.values_mut() {
            if *target == old {
                *target = new;
            }
        }
        self.mapping.insert(old, new);
        self.watched.remove(&old);
        if new.is_new() {
            self.watched.insert(new);
        }
        debug!("identity {} is now {}", old, new);
    }

    /// Current identity of a record once known as `rid`.
    pub fn resolve(&self, rid: Rid) -> Rid {
        self.mapping.get(&rid).copied().unwrap_or(rid)
    }

    /// Every `old -> new` change recorded in this transaction.
    pub fn mapping(&self) -> &HashMap<Rid, Rid> {
        &self.mapping
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty() && self.in_transit.is_empty() && self.mapping.is_empty()
    }

    pub fn clear(&mut self) {
        self.watched.clear();
        self.in_transit.clear();
        self.mapping.clear();
    }
}
