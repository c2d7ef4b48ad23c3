use thiserror::Error;

/// Errors that can occur in the lease layer.
#[derive(Error, Debug)]
pub enum LeaseError {
    /// Local clock and store clock disagree by more than the grace window.
    #[error("This machine's time is not synchronized with the lease store (skew {skew_ms}ms, grace {grace_ms}ms)")]
    ClockSkew { skew_ms: i64, grace_ms: i64 },

    #[error("Unsupported lease store: {0}")]
    UnsupportedStore(String),

    #[error("A lease already exists for: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Lease manager already started")]
    AlreadyStarted,

    #[error("Lease manager has been stopped")]
    Stopped,
}

impl LeaseError {
    /// Whether the manager must refuse to operate after this error.
    ///
    /// Clock skew and an unknown store both break the expiration arithmetic
    /// every ownership decision relies on.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            LeaseError::ClockSkew { .. } | LeaseError::UnsupportedStore(_)
        )
    }
}
