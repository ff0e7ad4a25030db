use std::collections::BTreeMap;
use std::sync::Arc;

use conduit_core::{SchedulerConfig, SourceDescriptor, SourceId, SourceStatus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::adapter::AdapterRegistry;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, SchedulerError};
use crate::executor::SyncExecutor;
use crate::guard::ExecutionGuard;
use crate::notify::{NotificationSink, SchedulerEvent};
use crate::registry::{Dispatch, ScheduleRegistry};
use crate::retry::RetryCoordinator;
use crate::schedule::SyncSchedule;
use crate::sources::SourceTable;
use crate::status::StatusReporter;
use crate::store::SourceStore;
use crate::sweeper::{CleanupSweeper, SweepReport};
use crate::types::{DispatchOutcome, RetryPolicy, RunOrigin, RunRecord, ScheduleStatus};

const INTERRUPTED_BY_RESTART: &str = "run interrupted by scheduler restart";

/// Multi-source sync scheduler.
///
/// Owns the trigger registry, the execution guard, the retry coordinator and
/// the cleanup sweeper, and exposes the control surface. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    adapters: Arc<AdapterRegistry>,
    sources: Arc<SourceTable>,
    guard: Arc<ExecutionGuard>,
    registry: Arc<ScheduleRegistry>,
    retries: Arc<RetryCoordinator>,
    executor: Arc<SyncExecutor>,
    sweeper: Arc<CleanupSweeper>,
    reporter: Arc<StatusReporter>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Scheduler {
    /// Build and start a scheduler on the system clock.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        config: SchedulerConfig,
        store: Arc<dyn SourceStore>,
        adapters: AdapterRegistry,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        Self::start_with_clock(config, store, adapters, sink, Arc::new(SystemClock))
    }

    /// Build and start a scheduler on an explicit clock.
    ///
    /// Loads every persisted source, recovers runs interrupted by a previous
    /// shutdown, arms triggers, then spawns the dispatcher and the sweeper.
    pub fn start_with_clock(
        config: SchedulerConfig,
        store: Arc<dyn SourceStore>,
        adapters: AdapterRegistry,
        sink: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.dispatch_buffer);
        let shutdown = CancellationToken::new();
        let adapters = Arc::new(adapters);
        let sources = Arc::new(SourceTable::load(store)?);
        let reporter = Arc::new(StatusReporter::new(sink));
        let guard = Arc::new(ExecutionGuard::new());
        let registry = Arc::new(ScheduleRegistry::new(dispatch_tx.clone(), clock.clone()));
        let retries = Arc::new(RetryCoordinator::new(
            RetryPolicy::from_config(&config),
            dispatch_tx,
            clock.clone(),
            reporter.clone(),
            shutdown.child_token(),
        ));
        let executor = Arc::new(SyncExecutor::new(
            config.clone(),
            adapters.clone(),
            sources.clone(),
            registry.clone(),
            retries.clone(),
            reporter.clone(),
            clock.clone(),
        ));
        let sweeper = Arc::new(CleanupSweeper::new(
            guard.clone(),
            sources.clone(),
            registry.clone(),
            reporter.clone(),
            clock.clone(),
            config.stuck_threshold(),
            config.sweep_interval(),
        ));

        let inner = Arc::new(Inner {
            config,
            clock,
            adapters,
            sources,
            guard,
            registry,
            retries,
            executor,
            sweeper,
            reporter,
            shutdown,
            tasks: TaskTracker::new(),
        });

        let (armed, failed) = inner.recover();

        inner
            .tasks
            .spawn(dispatch_loop(Arc::clone(&inner), dispatch_rx));
        inner
            .tasks
            .spawn(Arc::clone(&inner.sweeper).run(inner.shutdown.child_token()));

        info!(
            sources = inner.sources.len(),
            armed,
            failed,
            adapters = ?inner.adapters.kinds(),
            "sync scheduler started"
        );
        Ok(Self { inner })
    }

    /// Register a source, or replace the schedule of a known one.
    ///
    /// A known source keeps its counters and history. The schedule is
    /// validated before anything changes.
    pub fn register_source(&self, descriptor: SourceDescriptor) -> Result<ScheduleStatus> {
        self.ensure_running()?;
        SyncSchedule::parse(&descriptor.schedule, &descriptor.timezone)?;
        if !self.inner.adapters.supports(descriptor.kind) {
            return Err(SchedulerError::UnsupportedKind(descriptor.kind));
        }

        let now = self.inner.clock.now();
        let descriptor = match self.inner.sources.get(&descriptor.id) {
            Some(mut existing) => {
                existing.kind = descriptor.kind;
                existing.schedule = descriptor.schedule;
                existing.timezone = descriptor.timezone;
                existing.updated_at = now;
                existing
            }
            None => {
                let mut fresh = descriptor;
                if matches!(fresh.status, SourceStatus::Syncing | SourceStatus::Error) {
                    fresh.status = SourceStatus::Active;
                }
                fresh.created_at = now;
                fresh.updated_at = now;
                fresh
            }
        };
        self.inner.sources.insert(descriptor.clone())?;

        let trigger = if descriptor.is_paused() {
            self.inner
                .registry
                .register_paused(&descriptor.id, &descriptor.schedule, &descriptor.timezone)?
        } else {
            self.inner
                .registry
                .register(&descriptor.id, &descriptor.schedule, &descriptor.timezone)?
        };

        info!(source_id = %descriptor.id, kind = %descriptor.kind, schedule = %descriptor.schedule, "source registered");
        self.inner.reporter.emit(SchedulerEvent::ScheduleRegistered {
            source_id: descriptor.id.clone(),
            schedule: trigger.schedule,
            timezone: trigger.timezone,
            next_run: trigger.next_fire_estimate,
        });
        self.inner
            .status_of(&descriptor.id)
            .ok_or(SchedulerError::SourceNotFound {
                id: descriptor.id.to_string(),
            })
    }

    /// Stop the trigger and any pending retry for `id`. The descriptor and
    /// any in-flight run are kept. Returns whether a trigger existed.
    pub fn cancel_source(&self, id: &SourceId) -> bool {
        let retried = self.inner.retries.cancel(id);
        let cancelled = self.inner.registry.cancel(id);
        if cancelled {
            self.inner.reporter.emit(SchedulerEvent::ScheduleCancelled {
                source_id: id.clone(),
            });
        }
        debug!(source_id = %id, cancelled, retried, "cancel requested");
        cancelled
    }

    /// Stop firing `id` until resumed. Idempotent: returns false when the
    /// source was already paused.
    pub fn pause_source(&self, id: &SourceId) -> Result<bool> {
        self.ensure_running()?;
        let descriptor = self.inner.require(id)?;
        if descriptor.is_paused() {
            return Ok(false);
        }

        self.inner.registry.pause(id);
        self.inner.retries.cancel(id);
        let now = self.inner.clock.now();
        self.inner.sources.update(id, |d| {
            d.status = SourceStatus::Paused;
            d.updated_at = now;
        });

        info!(source_id = %id, "source paused");
        self.inner.reporter.emit(SchedulerEvent::SchedulePaused {
            source_id: id.clone(),
        });
        Ok(true)
    }

    /// Re-arm a paused source. Idempotent: returns false when it was not paused.
    pub fn resume_source(&self, id: &SourceId) -> Result<bool> {
        self.ensure_running()?;
        let descriptor = self.inner.require(id)?;
        if !descriptor.is_paused() {
            return Ok(false);
        }
        self.inner.ensure_supported(&descriptor)?;

        // A cancelled source has no trigger left to resume.
        if !self.inner.registry.resume(id) && self.inner.registry.get(id).is_none() {
            self.inner
                .registry
                .register(id, &descriptor.schedule, &descriptor.timezone)?;
        }
        let running = self.inner.guard.is_running(id);
        let now = self.inner.clock.now();
        self.inner.sources.update(id, |d| {
            d.status = if running {
                SourceStatus::Syncing
            } else {
                SourceStatus::Active
            };
            d.updated_at = now;
        });

        let next_run = self.inner.registry.get(id).and_then(|t| t.next_fire_estimate);
        info!(source_id = %id, "source resumed");
        self.inner.reporter.emit(SchedulerEvent::ScheduleResumed {
            source_id: id.clone(),
            next_run,
        });
        Ok(true)
    }

    /// Replace the recurrence of `id`. Nothing changes if the new expression
    /// or timezone is invalid.
    pub fn update_schedule(
        &self,
        id: &SourceId,
        expression: &str,
        timezone: &str,
    ) -> Result<ScheduleStatus> {
        self.ensure_running()?;
        let descriptor = self.inner.require(id)?;
        self.inner.ensure_supported(&descriptor)?;

        let trigger = if descriptor.is_paused() && self.inner.registry.get(id).is_none() {
            self.inner.registry.register_paused(id, expression, timezone)?
        } else {
            self.inner.registry.update_schedule(id, expression, timezone)?
        };
        let now = self.inner.clock.now();
        self.inner.sources.update(id, |d| {
            d.schedule = trigger.schedule.clone();
            d.timezone = trigger.timezone.clone();
            d.updated_at = now;
        });

        info!(source_id = %id, schedule = %trigger.schedule, timezone = %trigger.timezone, "schedule updated");
        self.inner.reporter.emit(SchedulerEvent::ScheduleUpdated {
            source_id: id.clone(),
            schedule: trigger.schedule,
            timezone: trigger.timezone,
            next_run: trigger.next_fire_estimate,
        });
        self.inner.status_of(id).ok_or(SchedulerError::SourceNotFound {
            id: id.to_string(),
        })
    }

    /// Start a run now, outside the schedule. Skipped (not queued) when a
    /// run is already in flight or the kind has no adapter.
    pub fn trigger_manual_sync(&self, id: &SourceId) -> Result<DispatchOutcome> {
        self.ensure_running()?;
        self.inner.require(id)?;
        Ok(self.inner.dispatch(id, RunOrigin::Manual))
    }

    pub fn get_status(&self, id: &SourceId) -> Option<ScheduleStatus> {
        self.inner.status_of(id)
    }

    pub fn get_all_statuses(&self) -> BTreeMap<SourceId, ScheduleStatus> {
        self.inner
            .sources
            .ids()
            .into_iter()
            .filter_map(|id| self.inner.status_of(&id).map(|s| (id, s)))
            .collect()
    }

    /// The in-flight run of `id`, if any.
    pub fn run_status(&self, id: &SourceId) -> Option<RunRecord> {
        self.inner.guard.status(id)
    }

    /// Run one cleanup pass immediately.
    pub fn sweep_now(&self) -> SweepReport {
        self.inner.sweeper.sweep()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop all triggers and retries, then wait up to the grace period for
    /// in-flight runs. Runs still going after that are left to the runtime.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("sync scheduler shutting down");
        self.inner.shutdown.cancel();
        let triggers = self.inner.registry.cancel_all();
        let retries = self.inner.retries.cancel_all();
        self.inner.tasks.close();

        let grace = self.inner.config.shutdown_grace();
        match tokio::time::timeout(grace, self.inner.tasks.wait()).await {
            Ok(()) => info!(triggers, retries, "sync scheduler stopped"),
            Err(_) => warn!(
                still_running = self.inner.guard.running_count(),
                grace_secs = grace.as_secs(),
                "in-flight runs did not finish within the grace period"
            ),
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(())
    }
}

impl Inner {
    fn require(&self, id: &SourceId) -> Result<SourceDescriptor> {
        self.sources.get(id).ok_or_else(|| SchedulerError::SourceNotFound {
            id: id.to_string(),
        })
    }

    fn ensure_supported(&self, descriptor: &SourceDescriptor) -> Result<()> {
        if !self.adapters.supports(descriptor.kind) {
            return Err(SchedulerError::UnsupportedKind(descriptor.kind));
        }
        Ok(())
    }

    fn status_of(&self, id: &SourceId) -> Option<ScheduleStatus> {
        let descriptor = self.sources.get(id)?;
        let trigger = self.registry.get(id);
        let run = self.guard.status(id);
        let retry = self.retries.pending(id);
        Some(StatusReporter::compose(
            &descriptor,
            trigger.as_ref(),
            run.as_ref(),
            retry.as_ref(),
        ))
    }

    /// Restore state after a restart. Returns (armed, failed) trigger counts.
    ///
    /// Sources persisted as `Syncing` lost their run with the previous
    /// process and become `Error`. Sources whose schedule no longer parses or
    /// whose kind has no adapter are marked `Error` and left unarmed.
    fn recover(&self) -> (usize, usize) {
        let now = self.clock.now();
        let mut armed = 0;
        let mut failed = 0;

        for descriptor in self.sources.all() {
            let id = descriptor.id.clone();
            if descriptor.status == SourceStatus::Syncing {
                warn!(source_id = %id, "run was interrupted by restart");
                self.sources.update(&id, |d| {
                    d.status = SourceStatus::Error;
                    d.error_count += 1;
                    d.last_error = Some(INTERRUPTED_BY_RESTART.to_string());
                    d.updated_at = now;
                });
            }

            if !self.adapters.supports(descriptor.kind) {
                error!(source_id = %id, kind = %descriptor.kind, "no adapter for source kind; not scheduled");
                self.mark_unschedulable(&id, SchedulerError::UnsupportedKind(descriptor.kind));
                failed += 1;
                continue;
            }

            let result = if descriptor.is_paused() {
                self.registry
                    .register_paused(&id, &descriptor.schedule, &descriptor.timezone)
            } else {
                self.registry
                    .register(&id, &descriptor.schedule, &descriptor.timezone)
            };
            match result {
                Ok(_) => armed += 1,
                Err(e) => {
                    error!(source_id = %id, error = %e, "stored schedule is invalid; not scheduled");
                    self.mark_unschedulable(&id, e);
                    failed += 1;
                }
            }
        }
        (armed, failed)
    }

    fn mark_unschedulable(&self, id: &SourceId, reason: SchedulerError) {
        let now = self.clock.now();
        self.sources.update(id, |d| {
            if d.status != SourceStatus::Paused {
                d.status = SourceStatus::Error;
            }
            d.last_error = Some(reason.to_string());
            d.updated_at = now;
        });
    }

    /// Try to start a run for `id`.
    fn dispatch(self: &Arc<Self>, id: &SourceId, origin: RunOrigin) -> DispatchOutcome {
        if self.shutdown.is_cancelled() {
            return DispatchOutcome::ShuttingDown;
        }
        let Some(descriptor) = self.sources.get(id) else {
            warn!(source_id = %id, "dispatch for unknown source");
            return DispatchOutcome::UnknownSource;
        };
        if descriptor.is_paused() {
            info!(source_id = %id, ?origin, "source paused; run skipped");
            return DispatchOutcome::Paused;
        }
        if !self.adapters.supports(descriptor.kind) {
            warn!(source_id = %id, kind = %descriptor.kind, ?origin, "no adapter for source kind; run skipped");
            return DispatchOutcome::UnsupportedKind {
                kind: descriptor.kind,
            };
        }
        let Some(permit) = self
            .guard
            .try_acquire(&descriptor, origin, self.clock.now())
        else {
            info!(source_id = %id, ?origin, "sync already running; run skipped");
            return DispatchOutcome::AlreadyRunning;
        };

        let run_id = permit.run_id().clone();
        let span = info_span!("sync_run", source_id = %id, run_id = %run_id);
        let executor = Arc::clone(&self.executor);
        let handle = self.tasks.spawn(
            async move {
                executor.execute(permit, descriptor).await;
            }
            .instrument(span),
        );
        self.guard.attach_task(id, &run_id, handle.abort_handle());
        DispatchOutcome::Started { run_id }
    }
}

/// Drain fires and due retries until shutdown.
async fn dispatch_loop(inner: Arc<Inner>, mut rx: mpsc::Receiver<Dispatch>) {
    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = rx.recv() => next,
        };
        match next {
            None => break,
            Some(Dispatch::Fire {
                source_id,
                generation,
                occurrence,
            }) => {
                if !inner.registry.record_fire(&source_id, generation, occurrence) {
                    debug!(%source_id, generation, "stale fire dropped");
                    continue;
                }
                inner.dispatch(&source_id, RunOrigin::Scheduled);
            }
            Some(Dispatch::Retry { source_id, attempt }) => {
                if !inner.retries.take_due(&source_id, attempt) {
                    debug!(%source_id, attempt, "superseded retry dropped");
                    continue;
                }
                inner.dispatch(&source_id, RunOrigin::Retry { attempt });
            }
        }
    }
    debug!("dispatcher stopped");
}
