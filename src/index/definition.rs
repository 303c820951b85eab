use serde::{Deserialize, Serialize};

use crate::data_store::record::Record;
use crate::index::key::{IndexKey, KeyPart};
use crate::value::Value;

/// Declared type of an indexed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    String,
    Binary,
    Link,
    Embedded,
    LinkList,
    LinkSet,
    LinkMap,
    EmbeddedList,
    EmbeddedSet,
    EmbeddedMap,
}

impl FieldType {
    pub const fn is_collection(self) -> bool {
        matches!(
            self,
            FieldType::LinkList
                | FieldType::LinkSet
                | FieldType::LinkMap
                | FieldType::EmbeddedList
                | FieldType::EmbeddedSet
                | FieldType::EmbeddedMap
        )
    }

    /// Type of the elements of a collection type; scalars map to themselves.
    pub const fn component_type(self) -> FieldType {
        match self {
            FieldType::LinkList | FieldType::LinkSet | FieldType::LinkMap => FieldType::Link,
            FieldType::EmbeddedList | FieldType::EmbeddedSet | FieldType::EmbeddedMap => {
                FieldType::Embedded
            }
            other => other,
        }
    }

    /// Whether a key built from a field of this type may embed a record identity.
    pub const fn may_depend_on_rid(self) -> bool {
        match self {
            FieldType::Link | FieldType::Embedded => true,
            FieldType::Boolean
            | FieldType::Integer
            | FieldType::Float
            | FieldType::String
            | FieldType::Binary => false,
            // `IndexField::new` resolves collections to their component type.
            FieldType::LinkList
            | FieldType::LinkSet
            | FieldType::LinkMap
            | FieldType::EmbeddedList
            | FieldType::EmbeddedSet
            | FieldType::EmbeddedMap => true,
        }
    }
}

/// One field of an index definition, already resolved to a scalar type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexField {
    name: String,
    field_type: FieldType,
}

impl IndexField {
    /// Collection types are indexed by element, so they are stored as their component type.
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type: field_type.component_type(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }
}

/// How an index reduces the per-key change list at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexCardinality {
    /// At most one value per key.
    Unique,
    /// Any number of values per key.
    NotUnique,
}

/// Secondary index over one or more fields of a record class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    name: String,
    class: String,
    fields: Vec<IndexField>,
    cardinality: IndexCardinality,
    /// Maintained by `IndexMaintenanceHook` rather than by explicit calls.
    automatic: bool,
}

impl IndexDefinition {
    pub fn new(
        name: &str,
        class: &str,
        fields: Vec<IndexField>,
        cardinality: IndexCardinality,
    ) -> Self {
        Self {
            name: name.to_string(),
            class: class.to_string(),
            fields,
            cardinality,
            automatic: true,
        }
    }

    /// An index fed only through explicit `add_index_entry` calls.
    pub fn manual(name: &str, fields: Vec<IndexField>, cardinality: IndexCardinality) -> Self {
        Self {
            name: name.to_string(),
            class: String::new(),
            fields,
            cardinality,
            automatic: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn fields(&self) -> &[IndexField] {
        &self.fields
    }

    pub fn cardinality(&self) -> IndexCardinality {
        self.cardinality
    }

    pub fn is_unique(&self) -> bool {
        self.cardinality == IndexCardinality::Unique
    }

    pub fn is_automatic(&self) -> bool {
        self.automatic
    }

    pub fn is_composite(&self) -> bool {
        self.fields.len() > 1
    }

    /// A composite key depends on a RID as soon as any of its fields may.
    pub fn may_depend_on_rid(&self) -> bool {
        self.fields
            .iter()
            .any(|field| field.field_type().may_depend_on_rid())
    }

    /// Builds the key for `record` from its current field values.
    pub fn key_of(&self, record: &Record) -> Option<IndexKey> {
        self.build_key(|name| record.field(name))
    }

    /// Builds the key for `record` from its field values before the pending changes.
    pub fn original_key_of(&self, record: &Record) -> Option<IndexKey> {
        self.build_key(|name| record.original_field(name))
    }

    /// Returns `None` when a field holds a value that cannot be part of a key.
    /// A missing field yields a null key part.
    fn build_key<'a>(&self, lookup: impl Fn(&str) -> Option<&'a Value>) -> Option<IndexKey> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let part = match lookup(field.name()) {
                Some(value) => KeyPart::from_value(value)?,
                None => KeyPart::Null,
            };
            parts.push(part);
        }
        Some(IndexKey::from_parts(parts))
    }
}
