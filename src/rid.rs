use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a record collection (a physical cluster of records).
pub type CollectionId = i32;

/// Collection id carried by records that have not been assigned to a collection yet.
pub const UNASSIGNED_COLLECTION: CollectionId = -1;

/// Position carried by records that have no position at all.
pub const INVALID_POSITION: i64 = -1;

/// Record identifier: `⟨collection id, position⟩`.
///
/// Positions `>= 0` are final and assigned by storage. Positions `<= -2` are
/// temporary placeholders handed out by the transaction ledger; they are
/// replaced at commit by the identity remap protocol. `Rid` is an immutable
/// value type, so a change of identity is always expressed as a pair
/// `(old, new)` rather than by mutating a key that lives inside a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rid {
    collection: CollectionId,
    position: i64,
}

impl Rid {
    pub const fn new(collection: CollectionId, position: i64) -> Self {
        Self {
            collection,
            position,
        }
    }

    /// A RID that is neither temporary nor final.
    pub const fn unassigned() -> Self {
        Self::new(UNASSIGNED_COLLECTION, INVALID_POSITION)
    }

    pub const fn collection(&self) -> CollectionId {
        self.collection
    }

    pub const fn position(&self) -> i64 {
        self.position
    }

    /// Storage assigned this identifier; it will never change again.
    pub const fn is_persistent(&self) -> bool {
        self.collection >= 0 && self.position >= 0
    }

    /// The identifier is a transaction-local placeholder.
    pub const fn is_temporary(&self) -> bool {
        self.position < INVALID_POSITION
    }

    /// The identifier may still change identity before the record is stored.
    pub const fn is_new(&self) -> bool {
        self.position < 0
    }

    /// Whether the record has been placed in a collection.
    pub const fn is_assigned(&self) -> bool {
        self.collection >= 0
    }

    pub const fn with_position(self, position: i64) -> Self {
        Self::new(self.collection, position)
    }
}

impl Default for Rid {
    fn default() -> Self {
        Self::unassigned()
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.collection, self.position)
    }
}
