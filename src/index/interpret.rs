use crate::errors::{GraphTxError, Result};
use crate::index::changes::{EntryOperation, IndexChanges, IndexChangesPerKey};
use crate::index::definition::IndexCardinality;
use crate::index::key::IndexKey;
use crate::rid::Rid;

/// Net effect of a transaction on one index, as handed to the index engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexEffect {
    /// Drop the whole index content before applying the other effects.
    Clear,
    Put { key: IndexKey, value: Rid },
    /// `value: None` removes every value stored under `key`.
    Remove { key: IndexKey, value: Option<Rid> },
}

impl IndexCardinality {
    /// Reduces the ordered change list of one key to its net effects.
    pub fn interpret(&self, index: &str, changes: &IndexChangesPerKey) -> Result<Vec<IndexEffect>> {
        match self {
            IndexCardinality::Unique => interpret_unique(index, changes),
            IndexCardinality::NotUnique => Ok(interpret_not_unique(changes)),
        }
    }
}

/// Reduces every buffered key of `changes` according to the index cardinality.
pub fn interpret_index(changes: &IndexChanges) -> Result<Vec<IndexEffect>> {
    let definition = changes.definition();
    let mut effects = Vec::new();
    if changes.is_cleared() {
        effects.push(IndexEffect::Clear);
    }
    for per_key in changes.per_key() {
        effects.extend(
            definition
                .cardinality()
                .interpret(definition.name(), per_key)?,
        );
    }
    Ok(effects)
}

/// A unique key ends with at most one value; two distinct live puts conflict.
fn interpret_unique(index: &str, changes: &IndexChangesPerKey) -> Result<Vec<IndexEffect>> {
    let mut remove_all = false;
    let mut removed: Vec<Rid> = Vec::new();
    let mut put: Option<Rid> = None;

    for entry in changes.entries() {
        match (entry.operation, entry.value) {
            (EntryOperation::Put, Some(value)) => {
                if let Some(current) = put {
                    if current != value {
                        return Err(GraphTxError::DuplicateKey {
                            index: index.to_string(),
                            key: changes.key().to_string(),
                        });
                    }
                }
                put = Some(value);
            }
            (EntryOperation::Remove, Some(value)) => {
                if put == Some(value) {
                    put = None;
                } else if !removed.contains(&value) {
                    removed.push(value);
                }
            }
            (EntryOperation::Remove, None) => {
                put = None;
                remove_all = true;
                removed.clear();
            }
            (EntryOperation::Put, None) => {}
        }
    }

    let key = changes.key();
    let mut effects = Vec::new();
    if remove_all {
        effects.push(IndexEffect::Remove {
            key: key.clone(),
            value: None,
        });
    }
    effects.extend(removed.into_iter().map(|value| IndexEffect::Remove {
        key: key.clone(),
        value: Some(value),
    }));
    if let Some(value) = put {
        effects.push(IndexEffect::Put {
            key: key.clone(),
            value,
        });
    }
    Ok(effects)
}

/// A multi-value key is a multiset: puts and removes of a value cancel out.
fn interpret_not_unique(changes: &IndexChangesPerKey) -> Vec<IndexEffect> {
    let mut remove_all = false;
    let mut net: Vec<(Rid, i64)> = Vec::new();

    for entry in changes.entries() {
        match (entry.operation, entry.value) {
            (EntryOperation::Remove, None) => {
                remove_all = true;
                net.clear();
            }
            (operation, Some(value)) => {
                let delta = if operation == EntryOperation::Put { 1 } else { -1 };
                match net.iter_mut().find(|(rid, _)| *rid == value) {
                    Some((_, count)) => *count += delta,
                    None => net.push((value, delta)),
                }
            }
            (EntryOperation::Put, None) => {}
        }
    }

    let key = changes.key();
    let mut effects = Vec::new();
    if remove_all {
        effects.push(IndexEffect::Remove {
            key: key.clone(),
            value: None,
        });
    }
    for (value, count) in net {
        if count > 0 {
            effects.push(IndexEffect::Put {
                key: key.clone(),
                value,
            });
        } else if count < 0 {
            effects.push(IndexEffect::Remove {
                key: key.clone(),
                value: Some(value),
            });
        }
    }
    effects
}
