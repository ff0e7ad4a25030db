use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use conduit_core::{SchedulerConfig, SourceDescriptor, SourceId, SourceKind, SourceStatus, SyncResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SyncFailure;

/// Identifier of a single execution. Time-ordered (UUID v7).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What caused a run to be dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunOrigin {
    Scheduled,
    Manual,
    Retry { attempt: u32 },
}

impl RunOrigin {
    /// Retry attempt number; fresh runs are attempt 0.
    pub fn attempt(&self) -> u32 {
        match self {
            RunOrigin::Retry { attempt } => *attempt,
            _ => 0,
        }
    }
}

/// Recurring trigger bookkeeping for one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTrigger {
    pub source_id: SourceId,
    pub schedule: String,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    /// `None` while paused.
    pub next_fire_estimate: Option<DateTime<Utc>>,
    pub fire_count: u64,
    pub failure_count: u64,
    pub paused: bool,
}

/// An in-flight run as tracked by the execution guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub source_id: SourceId,
    pub started_at: DateTime<Utc>,
    pub origin: RunOrigin,
    pub retry_attempt: u32,
    /// Descriptor as it was when the run started.
    pub source_snapshot: SourceDescriptor,
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay(),
            multiplier: config.backoff_multiplier,
            max_delay: config.max_delay(),
        }
    }

    /// Delay before retry `attempt` (1-based): `base * multiplier^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// A retry that has been scheduled but not yet dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPlan {
    pub source_id: SourceId,
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub due_at: DateTime<Utc>,
}

/// Result of asking the scheduler to start a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Started { run_id: RunId },
    /// Another run holds the guard; this request was skipped.
    AlreadyRunning,
    Paused,
    UnknownSource,
    /// No adapter is registered for the source's kind.
    UnsupportedKind { kind: SourceKind },
    ShuttingDown,
}

impl DispatchOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, DispatchOutcome::Started { .. })
    }
}

/// Terminal result of one execution.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    Completed {
        result: SyncResult,
        duration: Duration,
    },
    Failed {
        failure: SyncFailure,
        duration: Duration,
        retry: Option<RetryPlan>,
    },
    /// The run was reaped before it finished; its result was discarded.
    Abandoned,
}

/// Read-only view of a source combining descriptor, trigger and run state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatus {
    pub source_id: SourceId,
    pub kind: SourceKind,
    pub status: SourceStatus,
    pub schedule: String,
    pub timezone: String,
    pub is_scheduled: bool,
    pub is_paused: bool,
    pub is_running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub sync_count: u64,
    pub error_count: u64,
    pub fire_count: u64,
    pub failure_count: u64,
    pub last_error: Option<String>,
    pub running_since: Option<DateTime<Utc>>,
    pub run_id: Option<RunId>,
    pub retry_attempt: Option<u32>,
    pub pending_retry: Option<RetryPlan>,
}
