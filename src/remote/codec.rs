use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::data_store::record::{Record, RecordContent, RecordOwner};
use crate::errors::{GraphTxError, Result};
use crate::rid::Rid;
use crate::value::Value;

/// Network serialization collaborator used by the client-server merge.
///
/// `from_wire` may leave the field bytes unparsed; `materialize` must be
/// called before the fields are read or written.
pub trait WireCodec: Send + Sync {
    fn to_wire(&self, record: &Record) -> Result<Vec<u8>>;

    fn from_wire(&self, bytes: &[u8]) -> Result<Record>;

    fn materialize(&self, record: &mut Record) -> Result<()>;

    /// Encodes the fields changed since the record was last clean.
    fn serialize_delta(&self, record: &Record) -> Result<Vec<u8>>;

    /// Applies a delta produced by `serialize_delta` to `record`.
    fn deserialize_delta(&self, bytes: &[u8], record: &mut Record) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct WireRecord {
    rid: Rid,
    class: Option<String>,
    version: u64,
    dirty: u64,
    /// bincode-encoded field map, decoded on `materialize`.
    fields: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct WireDelta {
    /// `None` removes the field.
    changes: Vec<(String, Option<Value>)>,
}

/// [`WireCodec`] on top of bincode.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl BincodeCodec {
    pub fn new() -> Self {
        Self
    }
}

impl WireCodec for BincodeCodec {
    fn to_wire(&self, record: &Record) -> Result<Vec<u8>> {
        let fields = match record.content() {
            RecordContent::Fields(fields) => bincode::serialize(fields)?,
            RecordContent::Serialized(bytes) => bytes.clone(),
        };
        let wire = WireRecord {
            rid: record.rid(),
            class: record.class().map(str::to_string),
            version: record.version(),
            dirty: record.dirty_counter(),
            fields,
        };
        Ok(bincode::serialize(&wire)?)
    }

    fn from_wire(&self, bytes: &[u8]) -> Result<Record> {
        let wire: WireRecord = bincode::deserialize(bytes)?;
        let mut record = Record::loaded(
            wire.rid,
            wire.class,
            RecordContent::Serialized(wire.fields),
            wire.version,
            RecordOwner::Detached,
        );
        record.set_dirty_counter(wire.dirty);
        Ok(record)
    }

    fn materialize(&self, record: &mut Record) -> Result<()> {
        if let RecordContent::Serialized(bytes) = record.content() {
            let fields: BTreeMap<String, Value> = bincode::deserialize(bytes)?;
            record.set_content(RecordContent::Fields(fields));
        }
        Ok(())
    }

    fn serialize_delta(&self, record: &Record) -> Result<Vec<u8>> {
        if !record.is_materialized() {
            return Err(GraphTxError::SerializationError(format!(
                "cannot compute a delta of unparsed record {}",
                record.rid()
            )));
        }
        let changes = record
            .changed_fields()
            .map(|name| (name.to_string(), record.field(name).cloned()))
            .collect();
        Ok(bincode::serialize(&WireDelta { changes })?)
    }

    fn deserialize_delta(&self, bytes: &[u8], record: &mut Record) -> Result<()> {
        let delta: WireDelta = bincode::deserialize(bytes)?;
        self.materialize(record)?;
        for (name, value) in delta.changes {
            match value {
                Some(value) => record.set_field(&name, value)?,
                None => {
                    record.remove_field(&name)?;
                }
            }
        }
        Ok(())
    }
}
