use domain::rule::entity::PolicyRule;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConntrackError {
    #[error("conntrack operation failed: {0}")]
    Failed(String),
}

/// Secondary port for invalidating kernel connection-tracking state.
///
/// The cleaner worker batches rule predicates and calls `delete_matching`;
/// under backpressure it falls back to `flush_all`. Implementations may be
/// slow; they are only ever called from the dedicated cleaner task, never
/// under the replay lock.
pub trait ConntrackPort: Send + Sync {
    /// Flush the entire IPv4 conntrack table.
    fn flush_all(&self) -> Result<(), ConntrackError>;

    /// Delete sessions matching any of the given rule predicates.
    /// Returns the number of entries removed.
    fn delete_matching(&self, rules: &[PolicyRule]) -> Result<u64, ConntrackError>;
}
