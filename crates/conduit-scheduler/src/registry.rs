use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use conduit_core::SourceId;
use dashmap::{mapref::entry::Entry, DashMap};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::schedule::SyncSchedule;
use crate::types::ScheduledTrigger;

/// Work handed from timers to the dispatcher loop.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Dispatch {
    /// A recurring trigger fired. `generation` identifies the arming that
    /// produced it so fires from a replaced or paused timer can be dropped.
    Fire {
        source_id: SourceId,
        generation: u64,
        occurrence: DateTime<Utc>,
    },
    /// A backoff delay elapsed.
    Retry { source_id: SourceId, attempt: u32 },
}

struct TriggerSlot {
    trigger: ScheduledTrigger,
    schedule: SyncSchedule,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl TriggerSlot {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Recurring triggers, at most one per source.
///
/// Each armed trigger is a Tokio task that sleeps until the next occurrence
/// and pushes a [`Dispatch::Fire`] into the dispatcher queue. Replacing,
/// pausing or cancelling a trigger aborts its task under the map entry lock
/// and bumps the generation.
pub struct ScheduleRegistry {
    triggers: DashMap<SourceId, TriggerSlot>,
    dispatch_tx: mpsc::Sender<Dispatch>,
    clock: Arc<dyn Clock>,
    generation: AtomicU64,
}

impl ScheduleRegistry {
    pub(crate) fn new(dispatch_tx: mpsc::Sender<Dispatch>, clock: Arc<dyn Clock>) -> Self {
        Self {
            triggers: DashMap::new(),
            dispatch_tx,
            clock,
            generation: AtomicU64::new(0),
        }
    }

    /// Install an armed trigger for `id`, atomically replacing any existing one.
    ///
    /// The expression is validated before anything is touched; on error the
    /// previous trigger stays in place.
    pub fn register(&self, id: &SourceId, expression: &str, timezone: &str) -> Result<ScheduledTrigger> {
        self.install(id, expression, timezone, true)
    }

    /// Install a trigger that starts paused (no timer armed).
    pub fn register_paused(
        &self,
        id: &SourceId,
        expression: &str,
        timezone: &str,
    ) -> Result<ScheduledTrigger> {
        self.install(id, expression, timezone, false)
    }

    fn install(
        &self,
        id: &SourceId,
        expression: &str,
        timezone: &str,
        armed: bool,
    ) -> Result<ScheduledTrigger> {
        let schedule = SyncSchedule::parse(expression, timezone)?;
        let now = self.clock.now();
        let generation = self.next_generation();

        let mut slot = TriggerSlot {
            trigger: ScheduledTrigger {
                source_id: id.clone(),
                schedule: schedule.expression().to_string(),
                timezone: timezone.trim().to_string(),
                created_at: now,
                last_fired_at: None,
                next_fire_estimate: None,
                fire_count: 0,
                failure_count: 0,
                paused: !armed,
            },
            schedule,
            generation,
            timer: None,
        };

        // The previous timer is aborted before the new one is spawned.
        let trigger = match self.triggers.entry(id.clone()) {
            Entry::Occupied(mut existing) => {
                existing.get_mut().disarm();
                if armed {
                    self.arm(&mut slot, now);
                }
                let trigger = slot.trigger.clone();
                existing.insert(slot);
                info!(source_id = %id, schedule = %trigger.schedule, "trigger replaced");
                trigger
            }
            Entry::Vacant(vacant) => {
                if armed {
                    self.arm(&mut slot, now);
                }
                let trigger = slot.trigger.clone();
                vacant.insert(slot);
                info!(source_id = %id, schedule = %trigger.schedule, "trigger registered");
                trigger
            }
        };
        Ok(trigger)
    }

    /// Change the expression of an existing trigger, keeping its counters.
    ///
    /// A paused trigger stays paused. Unknown ids get a fresh trigger.
    pub fn update_schedule(
        &self,
        id: &SourceId,
        expression: &str,
        timezone: &str,
    ) -> Result<ScheduledTrigger> {
        let schedule = SyncSchedule::parse(expression, timezone)?;
        let now = self.clock.now();

        let Some(mut slot) = self.triggers.get_mut(id) else {
            return self.register(id, expression, timezone);
        };
        slot.disarm();
        slot.generation = self.next_generation();
        slot.trigger.schedule = schedule.expression().to_string();
        slot.trigger.timezone = timezone.trim().to_string();
        slot.schedule = schedule;
        if !slot.trigger.paused {
            self.arm(&mut slot, now);
        }
        info!(source_id = %id, schedule = %slot.trigger.schedule, "trigger rescheduled");
        Ok(slot.trigger.clone())
    }

    /// Stop and remove the trigger for `id`. Returns whether one existed.
    pub fn cancel(&self, id: &SourceId) -> bool {
        match self.triggers.remove(id) {
            Some((_, mut slot)) => {
                slot.disarm();
                info!(source_id = %id, "trigger cancelled");
                true
            }
            None => false,
        }
    }

    /// Disarm the trigger. Returns true only on the armed-to-paused transition.
    pub fn pause(&self, id: &SourceId) -> bool {
        let Some(mut slot) = self.triggers.get_mut(id) else {
            return false;
        };
        if slot.trigger.paused {
            return false;
        }
        slot.disarm();
        slot.generation = self.next_generation();
        slot.trigger.paused = true;
        slot.trigger.next_fire_estimate = None;
        true
    }

    /// Re-arm a paused trigger. Returns true only on the paused-to-armed transition.
    pub fn resume(&self, id: &SourceId) -> bool {
        let Some(mut slot) = self.triggers.get_mut(id) else {
            return false;
        };
        if !slot.trigger.paused {
            return false;
        }
        slot.generation = self.next_generation();
        slot.trigger.paused = false;
        let now = self.clock.now();
        self.arm(&mut slot, now);
        true
    }

    /// Book a fire from the dispatcher. Returns false for a stale fire, which
    /// must then not start a run.
    pub(crate) fn record_fire(&self, id: &SourceId, generation: u64, occurrence: DateTime<Utc>) -> bool {
        let Some(mut slot) = self.triggers.get_mut(id) else {
            return false;
        };
        if slot.generation != generation || slot.trigger.paused {
            return false;
        }
        let now = self.clock.now();
        slot.trigger.last_fired_at = Some(now);
        slot.trigger.fire_count += 1;
        let from = occurrence.max(now);
        slot.trigger.next_fire_estimate = slot.schedule.next_after(from);
        true
    }

    pub fn record_failure(&self, id: &SourceId) {
        if let Some(mut slot) = self.triggers.get_mut(id) {
            slot.trigger.failure_count += 1;
        }
    }

    /// Recompute next-fire estimates for every armed trigger. Returns how many
    /// were refreshed.
    pub fn refresh_estimates(&self, now: DateTime<Utc>) -> usize {
        let mut refreshed = 0;
        for mut slot in self.triggers.iter_mut() {
            if slot.trigger.paused {
                continue;
            }
            let next = slot.schedule.next_after(now);
            slot.trigger.next_fire_estimate = next;
            refreshed += 1;
        }
        refreshed
    }

    pub fn get(&self, id: &SourceId) -> Option<ScheduledTrigger> {
        self.triggers.get(id).map(|slot| slot.trigger.clone())
    }

    pub fn is_armed(&self, id: &SourceId) -> bool {
        self.triggers
            .get(id)
            .is_some_and(|slot| slot.timer.is_some())
    }

    pub fn is_paused(&self, id: &SourceId) -> bool {
        self.triggers.get(id).is_some_and(|slot| slot.trigger.paused)
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Abort every timer and drop all triggers.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<SourceId> = self.triggers.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn arm(&self, slot: &mut TriggerSlot, now: DateTime<Utc>) {
        slot.disarm();
        slot.trigger.next_fire_estimate = slot.schedule.next_after(now);
        slot.timer = Some(tokio::spawn(run_timer(
            slot.trigger.source_id.clone(),
            slot.schedule.clone(),
            slot.generation,
            self.dispatch_tx.clone(),
            Arc::clone(&self.clock),
        )));
    }
}

/// Sleep until each occurrence and enqueue a fire.
///
/// The next occurrence is always computed strictly after
/// `max(now, previous occurrence)` so a timer that wakes early cannot fire
/// the same occurrence twice, and a late wake-up skips missed occurrences
/// instead of replaying them.
async fn run_timer(
    source_id: SourceId,
    schedule: SyncSchedule,
    generation: u64,
    tx: mpsc::Sender<Dispatch>,
    clock: Arc<dyn Clock>,
) {
    let mut previous: Option<DateTime<Utc>> = None;
    loop {
        let now = clock.now();
        let from = previous.map_or(now, |p| p.max(now));
        let Some(next) = schedule.next_after(from) else {
            warn!(%source_id, "schedule has no further occurrences; timer stopped");
            return;
        };
        let wait = (next - now).to_std().unwrap_or_default();
        tokio::time::sleep(wait).await;

        let fire = Dispatch::Fire {
            source_id: source_id.clone(),
            generation,
            occurrence: next,
        };
        match tx.try_send(fire) {
            Ok(()) => debug!(%source_id, occurrence = %next, "trigger fired"),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%source_id, occurrence = %next, "dispatch queue full; fire skipped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
        previous = Some(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn registry() -> (ScheduleRegistry, mpsc::Receiver<Dispatch>) {
        let (tx, rx) = mpsc::channel(16);
        let anchor = Utc.with_ymd_and_hms(2026, 3, 2, 10, 3, 0).unwrap();
        (ScheduleRegistry::new(tx, Arc::new(TokioClock::starting_at(anchor))), rx)
    }

    fn id() -> SourceId {
        SourceId::from("ds-1")
    }

    #[tokio::test(start_paused = true)]
    async fn armed_trigger_fires_at_occurrence() {
        let (registry, mut rx) = registry();
        let trigger = registry.register(&id(), "*/5 * * * *", "").unwrap();
        assert_eq!(
            trigger.next_fire_estimate,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 10, 5, 0).unwrap())
        );

        let Some(Dispatch::Fire { occurrence, generation, .. }) = rx.recv().await else {
            panic!("expected a fire");
        };
        assert_eq!(occurrence, Utc.with_ymd_and_hms(2026, 3, 2, 10, 5, 0).unwrap());
        assert!(registry.record_fire(&id(), generation, occurrence));
        assert_eq!(registry.get(&id()).unwrap().fire_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_replacement_keeps_previous_trigger() {
        let (registry, _rx) = registry();
        registry.register(&id(), "*/5 * * * *", "").unwrap();
        assert!(registry.register(&id(), "not a cron", "").is_err());
        assert_eq!(registry.get(&id()).unwrap().schedule, "*/5 * * * *");
        assert!(registry.is_armed(&id()));
    }

    #[tokio::test(start_paused = true)]
    async fn replaced_trigger_fires_are_stale() {
        let (registry, mut rx) = registry();
        registry.register(&id(), "*/5 * * * *", "").unwrap();
        let old_generation = {
            let Some(Dispatch::Fire { generation, .. }) = rx.recv().await else {
                panic!("expected a fire");
            };
            generation
        };
        registry.register(&id(), "*/5 * * * *", "").unwrap();
        assert!(!registry.record_fire(&id(), old_generation, Utc::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_and_resume_are_idempotent() {
        let (registry, mut rx) = registry();
        registry.register(&id(), "*/5 * * * *", "").unwrap();

        assert!(registry.pause(&id()));
        assert!(!registry.pause(&id()));
        assert!(!registry.is_armed(&id()));
        assert!(registry.get(&id()).unwrap().next_fire_estimate.is_none());

        // Nothing fires while paused.
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(rx.try_recv().is_err());

        assert!(registry.resume(&id()));
        assert!(!registry.resume(&id()));
        assert!(registry.is_armed(&id()));
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn update_schedule_keeps_counters() {
        let (registry, mut rx) = registry();
        registry.register(&id(), "*/5 * * * *", "").unwrap();
        let Some(Dispatch::Fire { generation, occurrence, .. }) = rx.recv().await else {
            panic!("expected a fire");
        };
        registry.record_fire(&id(), generation, occurrence);
        registry.record_failure(&id());

        let updated = registry.update_schedule(&id(), "0 * * * *", "").unwrap();
        assert_eq!(updated.schedule, "0 * * * *");
        assert_eq!(updated.fire_count, 1);
        assert_eq!(updated.failure_count, 1);
        assert_eq!(
            updated.next_fire_estimate,
            Some(Utc.with_ymd_and_hms(2026, 3, 2, 11, 0, 0).unwrap())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_every_timer() {
        let (registry, mut rx) = registry();
        registry.register(&SourceId::from("a"), "* * * * *", "").unwrap();
        registry.register(&SourceId::from("b"), "* * * * *", "").unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.is_empty());

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(rx.try_recv().is_err());
        assert!(!registry.cancel(&SourceId::from("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_registration_leaves_one_live_timer() {
        let (registry, mut rx) = registry();
        registry.register(&id(), "*/5 * * * *", "").unwrap();
        registry.register(&id(), "*/5 * * * *", "").unwrap();
        let current = registry.register(&id(), "*/5 * * * *", "").unwrap();
        assert_eq!(current.fire_count, 0);

        // Until 10:07: exactly one fire for the 10:05 occurrence.
        tokio::time::sleep(Duration::from_secs(4 * 60)).await;
        let Ok(Dispatch::Fire { generation, occurrence, .. }) = rx.try_recv() else {
            panic!("expected a fire");
        };
        assert!(rx.try_recv().is_err());
        assert_eq!(occurrence, Utc.with_ymd_and_hms(2026, 3, 2, 10, 5, 0).unwrap());
        assert!(registry.record_fire(&id(), generation, occurrence));
    }
}
