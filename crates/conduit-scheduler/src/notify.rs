//! Lifecycle events and the sinks they are delivered to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_core::SourceId;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::error::NotifyError;
use crate::types::{RunId, RunOrigin};

/// Everything the scheduler reports about a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    ScheduleRegistered {
        source_id: SourceId,
        schedule: String,
        timezone: String,
        next_run: Option<DateTime<Utc>>,
    },
    ScheduleUpdated {
        source_id: SourceId,
        schedule: String,
        timezone: String,
        next_run: Option<DateTime<Utc>>,
    },
    ScheduleCancelled {
        source_id: SourceId,
    },
    SchedulePaused {
        source_id: SourceId,
    },
    ScheduleResumed {
        source_id: SourceId,
        next_run: Option<DateTime<Utc>>,
    },
    SyncStarted {
        source_id: SourceId,
        run_id: RunId,
        origin: RunOrigin,
    },
    SyncCompleted {
        source_id: SourceId,
        run_id: RunId,
        duration_ms: u64,
        records: u64,
        sync_count: u64,
    },
    SyncFailed {
        source_id: SourceId,
        run_id: RunId,
        duration_ms: u64,
        error_kind: String,
        error: String,
        error_count: u64,
    },
    RetryScheduled {
        source_id: SourceId,
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        due_at: DateTime<Utc>,
    },
    RetryExhausted {
        source_id: SourceId,
        attempts: u32,
    },
    StuckTaskReaped {
        source_id: SourceId,
        run_id: RunId,
        running_secs: u64,
    },
}

impl SchedulerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SchedulerEvent::ScheduleRegistered { .. } => "schedule_registered",
            SchedulerEvent::ScheduleUpdated { .. } => "schedule_updated",
            SchedulerEvent::ScheduleCancelled { .. } => "schedule_cancelled",
            SchedulerEvent::SchedulePaused { .. } => "schedule_paused",
            SchedulerEvent::ScheduleResumed { .. } => "schedule_resumed",
            SchedulerEvent::SyncStarted { .. } => "sync_started",
            SchedulerEvent::SyncCompleted { .. } => "sync_completed",
            SchedulerEvent::SyncFailed { .. } => "sync_failed",
            SchedulerEvent::RetryScheduled { .. } => "retry_scheduled",
            SchedulerEvent::RetryExhausted { .. } => "retry_exhausted",
            SchedulerEvent::StuckTaskReaped { .. } => "stuck_task_reaped",
        }
    }

    pub fn source_id(&self) -> &SourceId {
        match self {
            SchedulerEvent::ScheduleRegistered { source_id, .. }
            | SchedulerEvent::ScheduleUpdated { source_id, .. }
            | SchedulerEvent::ScheduleCancelled { source_id }
            | SchedulerEvent::SchedulePaused { source_id }
            | SchedulerEvent::ScheduleResumed { source_id, .. }
            | SchedulerEvent::SyncStarted { source_id, .. }
            | SchedulerEvent::SyncCompleted { source_id, .. }
            | SchedulerEvent::SyncFailed { source_id, .. }
            | SchedulerEvent::RetryScheduled { source_id, .. }
            | SchedulerEvent::RetryExhausted { source_id, .. }
            | SchedulerEvent::StuckTaskReaped { source_id, .. } => source_id,
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: String,
    pub source_id: SourceId,
    pub payload: serde_json::Value,
}

impl Notification {
    /// Decode the payload back into the typed event.
    pub fn decode(&self) -> Option<SchedulerEvent> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Destination for lifecycle notifications.
///
/// `publish` is called inline on scheduler paths and must not block.
/// Errors are logged by the caller and otherwise ignored.
pub trait NotificationSink: Send + Sync {
    fn publish(
        &self,
        event_type: &str,
        source_id: &SourceId,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Fans notifications out to any number of subscribers.
///
/// Sending with no subscribers is not an error.
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationSink for BroadcastSink {
    fn publish(
        &self,
        event_type: &str,
        source_id: &SourceId,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        // Err only means nobody is listening right now.
        let _ = self.tx.send(Notification {
            event: event_type.to_string(),
            source_id: source_id.clone(),
            payload: payload.clone(),
        });
        Ok(())
    }
}

/// Delivers into a bounded mpsc queue without waiting for capacity.
pub struct ChannelSink {
    tx: mpsc::Sender<Notification>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn publish(
        &self,
        event_type: &str,
        source_id: &SourceId,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        self.tx
            .try_send(Notification {
                event: event_type.to_string(),
                source_id: source_id.clone(),
                payload: payload.clone(),
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => NotifyError::Full,
                mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
            })
    }
}

/// Writes every notification to the log.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn publish(
        &self,
        event_type: &str,
        source_id: &SourceId,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        info!(event = event_type, %source_id, %payload, "scheduler event");
        Ok(())
    }
}

/// Publishes to every inner sink; reports the first failure after trying all.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl NotificationSink for FanoutSink {
    fn publish(
        &self,
        event_type: &str,
        source_id: &SourceId,
        payload: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.publish(event_type, source_id, payload) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
