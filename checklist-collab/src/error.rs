//! Error taxonomy for the sync core.

use crate::storage::StoreError;

/// Errors surfaced by sessions, operations, events and template history.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Missing or malformed input, rejected before any write
    Validation(String),
    /// Session or version absent
    NotFound(String),
    /// Optimistic-concurrency retries exhausted
    Conflict(String),
    /// Underlying store failure
    Storage(String),
    /// Caller's role does not allow the action
    Permission(String),
}

impl SyncError {
    /// Short machine-readable tag, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Validation(_) => "validation",
            SyncError::NotFound(_) => "not_found",
            SyncError::Conflict(_) => "conflict",
            SyncError::Storage(_) => "storage",
            SyncError::Permission(_) => "permission",
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Validation(e) => write!(f, "Validation error: {e}"),
            SyncError::NotFound(e) => write!(f, "Not found: {e}"),
            SyncError::Conflict(e) => write!(f, "Conflict: {e}"),
            SyncError::Storage(e) => write!(f, "Storage error: {e}"),
            SyncError::Permission(e) => write!(f, "Permission denied: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConditionFailed { .. } => SyncError::Conflict(e.to_string()),
            other => SyncError::Storage(other.to_string()),
        }
    }
}

/// Reject blank identifiers before touching the store.
pub(crate) fn require(field: &str, value: &str) -> Result<(), SyncError> {
    if value.trim().is_empty() {
        return Err(SyncError::Validation(format!("{field} is required")));
    }
    Ok(())
}
