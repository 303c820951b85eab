use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::rid::Rid;
use crate::value::Value;

/// `f64` with a total order so it can live inside ordered index keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FloatKey(pub f64);

impl PartialEq for FloatKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for FloatKey {}

impl PartialOrd for FloatKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloatKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl Hash for FloatKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

/// One component of an index key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Int(i64),
    Float(FloatKey),
    String(String),
    Bytes(Vec<u8>),
    Link(Rid),
    /// Embedded document flattened into sorted `(field, part)` pairs.
    Embedded(Vec<(String, KeyPart)>),
}

impl KeyPart {
    /// Converts a field value. Collections are indexed per element and are rejected here.
    pub fn from_value(value: &Value) -> Option<KeyPart> {
        let part = match value {
            Value::Null => KeyPart::Null,
            Value::Bool(b) => KeyPart::Bool(*b),
            Value::Int(i) => KeyPart::Int(*i),
            Value::Float(f) => KeyPart::Float(FloatKey(*f)),
            Value::String(s) => KeyPart::String(s.clone()),
            Value::Bytes(b) => KeyPart::Bytes(b.clone()),
            Value::Link(rid) => KeyPart::Link(*rid),
            Value::Embedded(map) => {
                let mut parts = Vec::with_capacity(map.len());
                for (name, value) in map {
                    parts.push((name.clone(), KeyPart::from_value(value)?));
                }
                KeyPart::Embedded(parts)
            }
            Value::LinkList(_) | Value::List(_) => return None,
        };
        Some(part)
    }

    pub fn contains_rid(&self, rid: Rid) -> bool {
        match self {
            KeyPart::Link(r) => *r == rid,
            KeyPart::Embedded(parts) => parts.iter().any(|(_, part)| part.contains_rid(rid)),
            _ => false,
        }
    }

    fn replace_rid(&mut self, old: Rid, new: Rid) -> bool {
        match self {
            KeyPart::Link(r) if *r == old => {
                *r = new;
                true
            }
            KeyPart::Embedded(parts) => parts
                .iter_mut()
                .fold(false, |changed, (_, part)| part.replace_rid(old, new) | changed),
            _ => false,
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "null"),
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Float(x) => write!(f, "{}", x.0),
            KeyPart::String(s) => write!(f, "'{s}'"),
            KeyPart::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            KeyPart::Link(rid) => write!(f, "{rid}"),
            KeyPart::Embedded(parts) => {
                write!(f, "{{")?;
                for (i, (name, part)) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {part}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Key of an index entry: a single part or a composite of several.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Single(KeyPart),
    Composite(Vec<KeyPart>),
}

impl IndexKey {
    pub fn from_parts(mut parts: Vec<KeyPart>) -> Self {
        if parts.len() == 1 {
            IndexKey::Single(parts.remove(0))
        } else {
            IndexKey::Composite(parts)
        }
    }

    pub fn null() -> Self {
        IndexKey::Single(KeyPart::Null)
    }

    pub fn is_null(&self) -> bool {
        match self {
            IndexKey::Single(part) => *part == KeyPart::Null,
            IndexKey::Composite(parts) => parts.iter().all(|p| *p == KeyPart::Null),
        }
    }

    pub fn parts(&self) -> &[KeyPart] {
        match self {
            IndexKey::Single(part) => std::slice::from_ref(part),
            IndexKey::Composite(parts) => parts,
        }
    }

    /// Whether the key equals, or has a sub-key containing, `rid`.
    pub fn contains_rid(&self, rid: Rid) -> bool {
        self.parts().iter().any(|part| part.contains_rid(rid))
    }

    /// Returns the key with every occurrence of `old` replaced, or `None` if it had none.
    pub fn with_rid_replaced(&self, old: Rid, new: Rid) -> Option<IndexKey> {
        let mut key = self.clone();
        let changed = match &mut key {
            IndexKey::Single(part) => part.replace_rid(old, new),
            IndexKey::Composite(parts) => parts
                .iter_mut()
                .fold(false, |changed, part| part.replace_rid(old, new) | changed),
        };
        changed.then_some(key)
    }
}

impl From<KeyPart> for IndexKey {
    fn from(part: KeyPart) -> Self {
        IndexKey::Single(part)
    }
}

impl From<Rid> for IndexKey {
    fn from(rid: Rid) -> Self {
        IndexKey::Single(KeyPart::Link(rid))
    }
}

impl From<&str> for IndexKey {
    fn from(s: &str) -> Self {
        IndexKey::Single(KeyPart::String(s.to_string()))
    }
}

impl From<i64> for IndexKey {
    fn from(i: i64) -> Self {
        IndexKey::Single(KeyPart::Int(i))
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Single(part) => write!(f, "{part}"),
            IndexKey::Composite(parts) => {
                write!(f, "[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{part}")?;
                }
                write!(f, "]")
            }
        }
    }
}
