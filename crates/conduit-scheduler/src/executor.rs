use std::sync::Arc;
use std::time::Duration;

use conduit_core::{SchedulerConfig, SourceDescriptor, SourceStatus, SyncResult};
use tracing::{debug, error, info, warn};

use crate::adapter::AdapterRegistry;
use crate::clock::Clock;
use crate::error::{AdapterError, SyncFailure};
use crate::guard::RunPermit;
use crate::notify::SchedulerEvent;
use crate::registry::ScheduleRegistry;
use crate::retry::{RetryCoordinator, RetryDecision};
use crate::sources::SourceTable;
use crate::status::StatusReporter;
use crate::types::SyncOutcome;

/// Runs one sync end to end: adapter call under a timeout, descriptor
/// bookkeeping, events, and the hand-off to the retry path.
pub struct SyncExecutor {
    config: SchedulerConfig,
    adapters: Arc<AdapterRegistry>,
    sources: Arc<SourceTable>,
    registry: Arc<ScheduleRegistry>,
    retries: Arc<RetryCoordinator>,
    reporter: Arc<StatusReporter>,
    clock: Arc<dyn Clock>,
}

impl SyncExecutor {
    pub(crate) fn new(
        config: SchedulerConfig,
        adapters: Arc<AdapterRegistry>,
        sources: Arc<SourceTable>,
        registry: Arc<ScheduleRegistry>,
        retries: Arc<RetryCoordinator>,
        reporter: Arc<StatusReporter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            adapters,
            sources,
            registry,
            retries,
            reporter,
            clock,
        }
    }

    /// Execute the run owned by `permit`.
    ///
    /// The permit is released before any retry is scheduled, so the retry
    /// can always acquire the guard. If the sweeper reaped the run while the
    /// adapter was working, the result is discarded untouched.
    pub async fn execute(&self, permit: RunPermit, source: SourceDescriptor) -> SyncOutcome {
        let id = source.id.clone();
        let run_id = permit.run_id().clone();
        let origin = permit.origin();

        self.sources.update(&id, |d| {
            if d.status != SourceStatus::Paused {
                d.status = SourceStatus::Syncing;
            }
            d.updated_at = self.clock.now();
        });
        info!(source_id = %id, %run_id, kind = %source.kind, ?origin, "sync started");
        self.reporter.emit(SchedulerEvent::SyncStarted {
            source_id: id.clone(),
            run_id: run_id.clone(),
            origin,
        });

        let started = tokio::time::Instant::now();
        let result = self.call_adapter(&source).await;
        let duration = started.elapsed();

        if !permit.is_current() {
            warn!(source_id = %id, %run_id, "run was reaped before it finished; result discarded");
            return SyncOutcome::Abandoned;
        }

        match result {
            Ok(result) => {
                let completed_at = self.clock.now();
                let updated = self.sources.update(&id, |d| {
                    d.last_sync_at = Some(completed_at);
                    d.sync_count += 1;
                    d.error_count = 0;
                    d.last_error = None;
                    d.last_sync_result = Some(result.clone());
                    if d.status != SourceStatus::Paused {
                        d.status = SourceStatus::Active;
                    }
                    d.updated_at = completed_at;
                });
                drop(permit);

                let sync_count = updated.map_or(0, |d| d.sync_count);
                info!(
                    source_id = %id,
                    %run_id,
                    records = result.records,
                    duration_ms = duration_ms(duration),
                    "sync completed"
                );
                self.reporter.emit(SchedulerEvent::SyncCompleted {
                    source_id: id,
                    run_id,
                    duration_ms: duration_ms(duration),
                    records: result.records,
                    sync_count,
                });
                SyncOutcome::Completed { result, duration }
            }
            Err(failure) => {
                let message = failure.to_string();
                let updated = self.sources.update(&id, |d| {
                    d.error_count += 1;
                    d.last_error = Some(message.clone());
                    if d.status != SourceStatus::Paused {
                        d.status = SourceStatus::Error;
                    }
                    d.updated_at = self.clock.now();
                });
                self.registry.record_failure(&id);
                drop(permit);

                let error_count = updated.as_ref().map_or(0, |d| d.error_count);
                let paused = updated.as_ref().is_some_and(|d| d.is_paused());
                error!(
                    source_id = %id,
                    %run_id,
                    error_kind = failure.kind(),
                    error = %message,
                    error_count,
                    "sync failed"
                );
                self.reporter.emit(SchedulerEvent::SyncFailed {
                    source_id: id.clone(),
                    run_id,
                    duration_ms: duration_ms(duration),
                    error_kind: failure.kind().to_string(),
                    error: message,
                    error_count,
                });

                let retry = if !failure.is_retryable() {
                    None
                } else if paused {
                    debug!(source_id = %id, "source paused; no retry scheduled");
                    None
                } else {
                    match self.retries.schedule_retry(&id, origin.attempt() + 1) {
                        RetryDecision::Scheduled(plan) => Some(plan),
                        RetryDecision::Exhausted { .. } | RetryDecision::ShuttingDown => None,
                    }
                };
                SyncOutcome::Failed {
                    failure,
                    duration,
                    retry,
                }
            }
        }
    }

    async fn call_adapter(&self, source: &SourceDescriptor) -> Result<SyncResult, SyncFailure> {
        let Some(adapter) = self.adapters.get(source.kind) else {
            return Err(AdapterError::Failed(format!(
                "no adapter registered for kind {}",
                source.kind
            ))
            .into());
        };
        let window = self.config.timeout_for(source.kind);
        match tokio::time::timeout(window, adapter.sync_data(&source.id)).await {
            Ok(result) => result.map_err(SyncFailure::from),
            Err(_) => Err(SyncFailure::Timeout {
                after_ms: duration_ms(window),
            }),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
