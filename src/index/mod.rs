/// Buffered per-index, per-key changes and their remap bookkeeping.
pub mod changes;
/// Index definitions and the RID-dependency classification of field types.
pub mod definition;
/// Cardinality-driven reduction of buffered changes to index effects.
pub mod interpret;
/// Single and composite index keys.
pub mod key;
