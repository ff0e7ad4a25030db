use conduit_core::{CoreError, SourceKind};
use thiserror::Error;

/// Errors returned by the scheduler's control surface.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The recurrence expression could not be parsed or never fires.
    #[error("Invalid schedule '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    /// The timezone is not a known IANA name.
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    /// No adapter was registered for this kind when the scheduler was built.
    #[error("No adapter registered for source kind: {0}")]
    UnsupportedKind(SourceKind),

    #[error("Source not found: {id}")]
    SourceNotFound { id: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

impl SchedulerError {
    /// Short error code string for API layers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::InvalidSchedule { .. } => "INVALID_SCHEDULE",
            SchedulerError::InvalidTimezone(_) => "INVALID_TIMEZONE",
            SchedulerError::UnsupportedKind(_) => "UNSUPPORTED_KIND",
            SchedulerError::SourceNotFound { .. } => "SOURCE_NOT_FOUND",
            SchedulerError::Store(_) => "STORE_ERROR",
            SchedulerError::Config(_) => "CONFIG_ERROR",
            SchedulerError::ShuttingDown => "SHUTTING_DOWN",
        }
    }

    /// True for input the caller must fix; these are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::InvalidSchedule { .. } | SchedulerError::InvalidTimezone(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors from a [`SourceStore`](crate::store::SourceStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A persisted row could not be mapped back to a descriptor.
    #[error("Corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Failure reported by a source adapter.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// The pull ran but did not succeed.
    #[error("sync failed: {0}")]
    Failed(String),

    /// The external system could not be reached.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// The external system throttled the request.
    #[error("rate limited: {0}")]
    RateLimited(String),
}

/// Why a single run did not complete.
#[derive(Debug, Clone, Error)]
pub enum SyncFailure {
    #[error("{0}")]
    Adapter(#[from] AdapterError),

    /// The run exceeded its execution window.
    #[error("sync timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    /// The sweeper reaped the run.
    #[error("run presumed stuck after {running_secs}s and was reaped")]
    Stuck { running_secs: u64 },
}

impl SyncFailure {
    /// Adapter errors and timeouts are transient and go through the retry path.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncFailure::Adapter(_) | SyncFailure::Timeout { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncFailure::Adapter(_) => "adapter_error",
            SyncFailure::Timeout { .. } => "timeout_error",
            SyncFailure::Stuck { .. } => "stuck_task_error",
        }
    }
}

/// Delivery failure of a notification sink. Logged, never propagated.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification channel closed")]
    Closed,

    #[error("notification channel full")]
    Full,

    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_retryable_but_stuck_runs_are_not() {
        assert!(SyncFailure::Timeout { after_ms: 10 }.is_retryable());
        assert!(SyncFailure::from(AdapterError::Unavailable("down".into())).is_retryable());
        assert!(!SyncFailure::Stuck { running_secs: 7300 }.is_retryable());
    }

    #[test]
    fn validation_errors_are_flagged() {
        let err = SchedulerError::InvalidSchedule {
            expression: "nope".into(),
            reason: "bad".into(),
        };
        assert!(err.is_validation());
        assert_eq!(err.code(), "INVALID_SCHEDULE");
        assert!(!SchedulerError::ShuttingDown.is_validation());
    }
}
