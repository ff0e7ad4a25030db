use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_core::{SourceDescriptor, SourceId};
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::task::AbortHandle;
use tracing::debug;

use crate::types::{RunId, RunOrigin, RunRecord};

struct RunSlot {
    record: RunRecord,
    task: Option<AbortHandle>,
}

/// At most one in-flight run per source.
///
/// `try_acquire` is an atomic check-and-set on the source's map entry. The
/// returned [`RunPermit`] releases the slot when dropped, but only while it
/// still owns it: a run that was force-released by the sweeper cannot free
/// a newer run's slot.
#[derive(Default)]
pub struct ExecutionGuard {
    runs: DashMap<SourceId, RunSlot>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the run slot for `source`, or `None` if a run is in flight.
    pub fn try_acquire(
        self: &Arc<Self>,
        source: &SourceDescriptor,
        origin: RunOrigin,
        now: DateTime<Utc>,
    ) -> Option<RunPermit> {
        match self.runs.entry(source.id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let run_id = RunId::new();
                slot.insert(RunSlot {
                    record: RunRecord {
                        run_id: run_id.clone(),
                        source_id: source.id.clone(),
                        started_at: now,
                        origin,
                        retry_attempt: origin.attempt(),
                        source_snapshot: source.clone(),
                    },
                    task: None,
                });
                Some(RunPermit {
                    guard: Arc::clone(self),
                    source_id: source.id.clone(),
                    run_id,
                    origin,
                })
            }
        }
    }

    /// Associate the spawned task with its run so a reap can abort it.
    pub fn attach_task(&self, id: &SourceId, run_id: &RunId, task: AbortHandle) {
        match self.runs.get_mut(id) {
            Some(mut slot) if &slot.record.run_id == run_id => slot.task = Some(task),
            // The run already finished or was reaped.
            _ => debug!(source_id = %id, %run_id, "run gone before task was attached"),
        }
    }

    /// Unconditionally clear the slot for `id`, aborting its task if any.
    pub fn release(&self, id: &SourceId) -> Option<RunRecord> {
        let (_, slot) = self.runs.remove(id)?;
        if let Some(task) = slot.task {
            task.abort();
        }
        Some(slot.record)
    }

    /// Clear the slot only if it still belongs to `run_id`, aborting its task.
    pub fn reap(&self, id: &SourceId, run_id: &RunId) -> Option<RunRecord> {
        let (_, slot) = self.runs.remove_if(id, |_, slot| &slot.record.run_id == run_id)?;
        if let Some(task) = slot.task {
            task.abort();
        }
        Some(slot.record)
    }

    pub fn status(&self, id: &SourceId) -> Option<RunRecord> {
        self.runs.get(id).map(|slot| slot.record.clone())
    }

    pub fn is_running(&self, id: &SourceId) -> bool {
        self.runs.contains_key(id)
    }

    pub fn is_current(&self, id: &SourceId, run_id: &RunId) -> bool {
        self.runs
            .get(id)
            .is_some_and(|slot| &slot.record.run_id == run_id)
    }

    pub fn snapshot(&self) -> Vec<RunRecord> {
        self.runs.iter().map(|slot| slot.record.clone()).collect()
    }

    pub fn running_count(&self) -> usize {
        self.runs.len()
    }

    fn release_owned(&self, id: &SourceId, run_id: &RunId) -> bool {
        self.runs
            .remove_if(id, |_, slot| &slot.record.run_id == run_id)
            .is_some()
    }
}

/// Ownership of a source's run slot.
pub struct RunPermit {
    guard: Arc<ExecutionGuard>,
    source_id: SourceId,
    run_id: RunId,
    origin: RunOrigin,
}

impl RunPermit {
    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn origin(&self) -> RunOrigin {
        self.origin
    }

    /// False once the sweeper has reaped this run.
    pub fn is_current(&self) -> bool {
        self.guard.is_current(&self.source_id, &self.run_id)
    }
}

impl Drop for RunPermit {
    fn drop(&mut self) {
        if !self.guard.release_owned(&self.source_id, &self.run_id) {
            debug!(source_id = %self.source_id, run_id = %self.run_id, "run slot already released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_core::SourceKind;

    fn source() -> SourceDescriptor {
        SourceDescriptor::new("ds-1", SourceKind::Spreadsheet, "*/5 * * * *", "")
    }

    #[test]
    fn second_acquire_is_refused_until_release() {
        let guard = Arc::new(ExecutionGuard::new());
        let first = guard.try_acquire(&source(), RunOrigin::Scheduled, Utc::now());
        assert!(first.is_some());
        assert!(guard.try_acquire(&source(), RunOrigin::Manual, Utc::now()).is_none());
        assert_eq!(guard.running_count(), 1);

        drop(first);
        assert!(!guard.is_running(&source().id));
        assert!(guard.try_acquire(&source(), RunOrigin::Manual, Utc::now()).is_some());
    }

    #[test]
    fn record_carries_retry_attempt() {
        let guard = Arc::new(ExecutionGuard::new());
        let _permit = guard
            .try_acquire(&source(), RunOrigin::Retry { attempt: 2 }, Utc::now())
            .unwrap();
        let record = guard.status(&source().id).unwrap();
        assert_eq!(record.retry_attempt, 2);
        assert_eq!(record.source_snapshot.schedule, "*/5 * * * *");
    }

    #[test]
    fn stale_permit_does_not_release_newer_run() {
        let guard = Arc::new(ExecutionGuard::new());
        let stale = guard
            .try_acquire(&source(), RunOrigin::Scheduled, Utc::now())
            .unwrap();
        let reaped = guard.reap(&source().id, stale.run_id()).unwrap();
        assert_eq!(&reaped.run_id, stale.run_id());
        assert!(!stale.is_current());

        let fresh = guard
            .try_acquire(&source(), RunOrigin::Manual, Utc::now())
            .unwrap();
        drop(stale);
        assert!(fresh.is_current());
        assert!(guard.is_running(&source().id));
    }

    #[test]
    fn reap_with_wrong_run_id_is_a_no_op() {
        let guard = Arc::new(ExecutionGuard::new());
        let _permit = guard
            .try_acquire(&source(), RunOrigin::Scheduled, Utc::now())
            .unwrap();
        assert!(guard.reap(&source().id, &RunId::new()).is_none());
        assert!(guard.is_running(&source().id));
    }

    #[tokio::test]
    async fn release_aborts_attached_task() {
        let guard = Arc::new(ExecutionGuard::new());
        let permit = guard
            .try_acquire(&source(), RunOrigin::Scheduled, Utc::now())
            .unwrap();
        let handle = tokio::spawn(std::future::pending::<()>());
        guard.attach_task(permit.source_id(), permit.run_id(), handle.abort_handle());

        assert!(guard.release(&source().id).is_some());
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
