//! Error taxonomy for the sync layer.
//!
//! Feed errors are captured into a mirror's `error` field and never cross the
//! snapshot-delivery boundary. Commands (`mark_read`, `delete`, …) return them.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by feeds, mirrors and commands.
///
/// `Clone` so the last error can live inside published mirror state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Caller lacks rights to the path or query. Never retried.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Network loss, timeout or a dropped stream. Retry is the caller's call.
    #[error("transport error: {0}")]
    Transport(String),

    /// A single write, patch or delete was rejected.
    #[error("write failed: {0}")]
    WriteFailure(String),

    /// A non-atomic batch partly failed. Which records landed is unknown.
    #[error("batch partially failed: {failed} of {attempted} operations rejected")]
    PartialBatchFailure { attempted: usize, failed: usize },

    /// Query constraints the store cannot execute.
    #[error("malformed query constraints: {0}")]
    MalformedConstraints(String),

    /// Path with the wrong shape for the requested operation.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Remote data did not match the local record type.
    #[error("decode error: {0}")]
    Decode(String),
}

impl SyncError {
    /// Errors that no re-subscription can fix without caller intervention.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::MalformedConstraints(_) | Self::InvalidPath(_)
        )
    }

    /// Errors worth a caller-initiated retry (re-subscribe or re-issue).
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::WriteFailure(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_vs_retryable() {
        assert!(SyncError::PermissionDenied("users/u2".into()).is_terminal());
        assert!(SyncError::MalformedConstraints("limit".into()).is_terminal());
        assert!(!SyncError::Transport("reset".into()).is_terminal());
        assert!(SyncError::Transport("reset".into()).is_retryable());
        assert!(!SyncError::PermissionDenied("x".into()).is_retryable());
    }

    #[test]
    fn test_partial_batch_message() {
        let e = SyncError::PartialBatchFailure { attempted: 5, failed: 2 };
        assert_eq!(e.to_string(), "batch partially failed: 2 of 5 operations rejected");
    }

    #[test]
    fn test_decode_from_serde() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::Decode(_)));
    }
}
