use std::sync::Arc;
use std::time::Duration;

use conduit_core::{SourceId, SourceStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::error::SyncFailure;
use crate::guard::ExecutionGuard;
use crate::notify::SchedulerEvent;
use crate::registry::ScheduleRegistry;
use crate::sources::SourceTable;
use crate::status::StatusReporter;

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub reaped: Vec<SourceId>,
    pub refreshed: usize,
}

/// Periodically reaps runs that have held the guard past the stuck
/// threshold and refreshes trigger next-fire estimates.
pub struct CleanupSweeper {
    guard: Arc<ExecutionGuard>,
    sources: Arc<SourceTable>,
    registry: Arc<ScheduleRegistry>,
    reporter: Arc<StatusReporter>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
    interval: Duration,
}

impl CleanupSweeper {
    pub(crate) fn new(
        guard: Arc<ExecutionGuard>,
        sources: Arc<SourceTable>,
        registry: Arc<ScheduleRegistry>,
        reporter: Arc<StatusReporter>,
        clock: Arc<dyn Clock>,
        threshold: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            guard,
            sources,
            registry,
            reporter,
            clock,
            threshold,
            interval,
        }
    }

    /// Sweep until `shutdown` is cancelled. The first sweep runs immediately.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "cleanup sweeper started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("cleanup sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.sweep();
                    debug!(reaped = report.reaped.len(), refreshed = report.refreshed, "sweep finished");
                }
            }
        }
    }

    /// One pass. Runs strictly older than the threshold are reaped: their
    /// task is aborted, the guard released and the source marked as failed.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut reaped = Vec::new();

        for record in self.guard.snapshot() {
            let running = (now - record.started_at).to_std().unwrap_or_default();
            if running <= self.threshold {
                continue;
            }
            // The run may have finished since the snapshot; reap only if the
            // slot still belongs to it.
            let Some(record) = self.guard.reap(&record.source_id, &record.run_id) else {
                continue;
            };

            let failure = SyncFailure::Stuck {
                running_secs: running.as_secs(),
            };
            let message = failure.to_string();
            self.sources.update(&record.source_id, |d| {
                d.error_count += 1;
                d.last_error = Some(message.clone());
                if d.status != SourceStatus::Paused {
                    d.status = SourceStatus::Error;
                }
                d.updated_at = now;
            });
            self.registry.record_failure(&record.source_id);

            error!(
                source_id = %record.source_id,
                run_id = %record.run_id,
                running_secs = running.as_secs(),
                "stuck run reaped"
            );
            self.reporter.emit(SchedulerEvent::StuckTaskReaped {
                source_id: record.source_id.clone(),
                run_id: record.run_id.clone(),
                running_secs: running.as_secs(),
            });
            reaped.push(record.source_id);
        }

        let refreshed = self.registry.refresh_estimates(now);
        SweepReport { reaped, refreshed }
    }
}
