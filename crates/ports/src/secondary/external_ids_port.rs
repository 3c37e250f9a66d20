use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExternalIdsError {
    #[error("configuration store unreachable: {0}")]
    Unreachable(String),

    #[error("bridge {0} not found in configuration store")]
    BridgeNotFound(String),

    #[error("malformed configuration store reply: {0}")]
    Malformed(String),
}

/// Secondary port for the switch's configuration store.
///
/// Exposes the per-bridge `external_ids` string map; the only key the
/// datapath persists is the restart round.
pub trait ExternalIdsPort: Send + Sync {
    fn get_external_ids(&self, bridge: &str) -> Result<HashMap<String, String>, ExternalIdsError>;

    fn set_external_ids(
        &self,
        bridge: &str,
        ids: HashMap<String, String>,
    ) -> Result<(), ExternalIdsError>;
}
