use thiserror::Error;

/// Datapath error taxonomy.
///
/// Only `Fatal` may escape to the process supervisor; every other kind is
/// returned to the calling API and logged. The core never retries; external
/// collaborators converge by re-asserting desired state.
#[derive(Debug, Error)]
pub enum DatapathError {
    /// The switch session is down. Recoverable by replay.
    #[error("switch unavailable: {0}")]
    SwitchUnavailable(String),

    /// The rule failed structural validation. No state was changed.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// The switch rejected a flow install. The store was not updated, so
    /// the next replay or retry re-attempts.
    #[error("flow install failed: {0}")]
    FlowInstallFailed(String),

    /// A store invariant was violated. Non-fatal so callers can converge.
    #[error("store inconsistency: {0}")]
    StoreInconsistency(String),

    /// Unrecoverable: round commit failure, replay lock timeout, address
    /// subscription setup failure. The process must abort.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl DatapathError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}
