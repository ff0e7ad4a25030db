use std::sync::Arc;

use conduit_core::SourceId;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::notify::SchedulerEvent;
use crate::registry::Dispatch;
use crate::status::StatusReporter;
use crate::types::{RetryPlan, RetryPolicy};

/// What happened to a retry request.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Scheduled(RetryPlan),
    /// `attempts` retries were already made; nothing more will run.
    Exhausted { attempts: u32 },
    /// The scheduler is shutting down; no retry was armed.
    ShuttingDown,
}

struct PendingRetry {
    plan: RetryPlan,
    timer: JoinHandle<()>,
}

/// One-shot delayed retries with exponential backoff.
///
/// At most one retry is pending per source; scheduling a new one replaces
/// it. A retry only dispatches if it is still the pending one when its
/// delay elapses. Nothing is armed once `shutdown` is cancelled.
pub struct RetryCoordinator {
    policy: RetryPolicy,
    pending: DashMap<SourceId, PendingRetry>,
    dispatch_tx: mpsc::Sender<Dispatch>,
    clock: Arc<dyn Clock>,
    reporter: Arc<StatusReporter>,
    shutdown: CancellationToken,
}

impl RetryCoordinator {
    pub(crate) fn new(
        policy: RetryPolicy,
        dispatch_tx: mpsc::Sender<Dispatch>,
        clock: Arc<dyn Clock>,
        reporter: Arc<StatusReporter>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            policy,
            pending: DashMap::new(),
            dispatch_tx,
            clock,
            reporter,
            shutdown,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Schedule retry `attempt` (1-based) under the configured policy.
    pub fn schedule_retry(&self, id: &SourceId, attempt: u32) -> RetryDecision {
        let policy = self.policy.clone();
        self.schedule_retry_with(id, attempt, &policy)
    }

    /// Schedule retry `attempt` under an explicit policy.
    pub fn schedule_retry_with(&self, id: &SourceId, attempt: u32, policy: &RetryPolicy) -> RetryDecision {
        if self.shutdown.is_cancelled() {
            debug!(source_id = %id, attempt, "shutting down; retry not scheduled");
            return RetryDecision::ShuttingDown;
        }
        if attempt > policy.max_attempts {
            self.cancel(id);
            warn!(source_id = %id, attempts = policy.max_attempts, "retries exhausted");
            self.reporter.emit(SchedulerEvent::RetryExhausted {
                source_id: id.clone(),
                attempts: policy.max_attempts,
            });
            return RetryDecision::Exhausted {
                attempts: policy.max_attempts,
            };
        }

        let delay = policy.delay_for(attempt);
        let due_at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let plan = RetryPlan {
            source_id: id.clone(),
            attempt,
            max_attempts: policy.max_attempts,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            due_at,
        };

        let tx = self.dispatch_tx.clone();
        let source_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(Dispatch::Retry { source_id, attempt }).await.is_err() {
                debug!("dispatcher gone; retry dropped");
            }
        });
        if let Some(previous) = self.pending.insert(
            id.clone(),
            PendingRetry {
                plan: plan.clone(),
                timer,
            },
        ) {
            previous.timer.abort();
        }
        // Shutdown may have swept the pending map while this one was armed.
        if self.shutdown.is_cancelled() {
            self.cancel(id);
            return RetryDecision::ShuttingDown;
        }

        info!(
            source_id = %id,
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = plan.delay_ms,
            "retry scheduled"
        );
        self.reporter.emit(SchedulerEvent::RetryScheduled {
            source_id: id.clone(),
            attempt,
            max_attempts: policy.max_attempts,
            delay_ms: plan.delay_ms,
            due_at,
        });
        RetryDecision::Scheduled(plan)
    }

    /// Drop the pending retry for `id`. Returns whether one was pending.
    pub fn cancel(&self, id: &SourceId) -> bool {
        match self.pending.remove(id) {
            Some((_, retry)) => {
                retry.timer.abort();
                debug!(source_id = %id, attempt = retry.plan.attempt, "pending retry cancelled");
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let ids: Vec<SourceId> = self.pending.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    pub fn pending(&self, id: &SourceId) -> Option<RetryPlan> {
        self.pending.get(id).map(|r| r.plan.clone())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Claim a due retry. False if it was cancelled or superseded meanwhile.
    pub(crate) fn take_due(&self, id: &SourceId, attempt: u32) -> bool {
        self.pending
            .remove_if(id, |_, retry| retry.plan.attempt == attempt)
            .is_some()
    }
}
