use std::sync::Arc;

use conduit_core::SourceDescriptor;
use tracing::warn;

use crate::notify::{NotificationSink, SchedulerEvent};
use crate::types::{RetryPlan, RunRecord, ScheduleStatus, ScheduledTrigger};

/// Emits lifecycle events and composes the read-only status view.
pub struct StatusReporter {
    sink: Arc<dyn NotificationSink>,
}

impl StatusReporter {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Publish `event`. Delivery failures are logged and swallowed.
    pub fn emit(&self, event: SchedulerEvent) {
        let event_type = event.event_type();
        if let Err(e) = self
            .sink
            .publish(event_type, event.source_id(), &event.payload())
        {
            warn!(
                event = event_type,
                source_id = %event.source_id(),
                error = %e,
                "failed to deliver scheduler event"
            );
        }
    }

    /// Merge descriptor, trigger and run state into one view.
    pub fn compose(
        descriptor: &SourceDescriptor,
        trigger: Option<&ScheduledTrigger>,
        run: Option<&RunRecord>,
        pending_retry: Option<&RetryPlan>,
    ) -> ScheduleStatus {
        let armed = trigger.filter(|t| !t.paused);
        ScheduleStatus {
            source_id: descriptor.id.clone(),
            kind: descriptor.kind,
            status: descriptor.status,
            schedule: descriptor.schedule.clone(),
            timezone: descriptor.timezone.clone(),
            is_scheduled: armed.is_some(),
            is_paused: descriptor.is_paused(),
            is_running: run.is_some(),
            last_run: descriptor.last_sync_at,
            next_run: armed.and_then(|t| t.next_fire_estimate),
            sync_count: descriptor.sync_count,
            error_count: descriptor.error_count,
            fire_count: trigger.map_or(0, |t| t.fire_count),
            failure_count: trigger.map_or(0, |t| t.failure_count),
            last_error: descriptor.last_error.clone(),
            running_since: run.map(|r| r.started_at),
            run_id: run.map(|r| r.run_id.clone()),
            retry_attempt: run.map(|r| r.retry_attempt),
            pending_retry: pending_retry.cloned(),
        }
    }
}
