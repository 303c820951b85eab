use serde::{Deserialize, Serialize};

/// Tunables shared by every transaction of a session.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TxConfig {
    /// First temporary position handed out to new records. Later ones decrease.
    pub first_temporary_position: i64,
    /// Upper bound on callback passes before a hook cascade is declared runaway.
    pub max_callback_passes: usize,
    /// Publish committed records to the session cache.
    pub use_cache: bool,
}

impl Default for TxConfig {
    fn default() -> Self {
        Self {
            first_temporary_position: -2,
            max_callback_passes: 64,
            use_cache: true,
        }
    }
}
