//! Field values stored on records.

use std::collections::BTreeMap;

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};

use crate::rid::Rid;

/// A value that can be stored in a record field.
///
/// Links (`Link`, `LinkList`) reference other records by [`Rid`] and are the
/// reason record contents take part in the identity remap protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    /// Reference to another, independently persisted record.
    Link(Rid),
    /// Ordered references to other records.
    LinkList(Vec<Rid>),
    /// Nested document owned by the enclosing record.
    Embedded(BTreeMap<String, Value>),
    List(Vec<Value>),
}

impl Value {
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[inline]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_link(&self) -> Option<Rid> {
        match self {
            Self::Link(rid) => Some(*rid),
            _ => None,
        }
    }

    /// Whether `rid` appears anywhere inside this value.
    pub fn contains_rid(&self, rid: Rid) -> bool {
        match self {
            Self::Link(r) => *r == rid,
            Self::LinkList(rids) => rids.contains(&rid),
            Self::Embedded(map) => map.values().any(|v| v.contains_rid(rid)),
            Self::List(values) => values.iter().any(|v| v.contains_rid(rid)),
            _ => false,
        }
    }

    /// Rewrites every link found in `mapping`. Returns `true` if anything changed.
    pub fn rewrite_links(&mut self, mapping: &HashMap<Rid, Rid>) -> bool {
        match self {
            Self::Link(rid) => match mapping.get(rid) {
                Some(new_rid) => {
                    *rid = *new_rid;
                    true
                }
                None => false,
            },
            Self::LinkList(rids) => {
                let mut changed = false;
                for rid in rids.iter_mut() {
                    if let Some(new_rid) = mapping.get(rid) {
                        *rid = *new_rid;
                        changed = true;
                    }
                }
                changed
            }
            Self::Embedded(map) => map
                .values_mut()
                .fold(false, |changed, v| v.rewrite_links(mapping) | changed),
            Self::List(values) => values
                .iter_mut()
                .fold(false, |changed, v| v.rewrite_links(mapping) | changed),
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Rid> for Value {
    fn from(rid: Rid) -> Self {
        Value::Link(rid)
    }
}
