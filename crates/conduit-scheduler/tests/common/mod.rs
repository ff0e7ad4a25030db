// Shared fixtures for the scheduler integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use conduit_core::{SchedulerConfig, SourceDescriptor, SourceId, SourceKind, SyncResult};
use conduit_scheduler::{
    AdapterError, AdapterRegistry, ChannelSink, MemorySourceStore, Notification, Scheduler,
    SchedulerEvent, SourceAdapter, SourceStore, TokioClock,
};
use tokio::sync::{mpsc, Semaphore};

/// Wall-clock instant every test starts at: Monday 2026-03-02 10:03:00 UTC.
pub fn anchor() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 10, 3, 0).unwrap()
}

pub fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, h, m, s).unwrap()
}

pub fn id(s: &str) -> SourceId {
    SourceId::from(s)
}

/// A schedule that will not fire during any test.
pub const YEARLY: &str = "0 0 1 1 *";

pub fn source(id: &str, schedule: &str) -> SourceDescriptor {
    SourceDescriptor::new(id, SourceKind::Spreadsheet, schedule, "")
}

pub fn start(config: SchedulerConfig, adapters: AdapterRegistry) -> (Scheduler, mpsc::Receiver<Notification>) {
    start_with_store(config, Arc::new(MemorySourceStore::new()), adapters)
}

pub fn start_with_store(
    config: SchedulerConfig,
    store: Arc<dyn SourceStore>,
    adapters: AdapterRegistry,
) -> (Scheduler, mpsc::Receiver<Notification>) {
    let (sink, rx) = ChannelSink::channel(1024);
    let scheduler = Scheduler::start_with_clock(
        config,
        store,
        adapters,
        Arc::new(sink),
        Arc::new(TokioClock::starting_at(anchor())),
    )
    .expect("scheduler starts");
    (scheduler, rx)
}

/// Receive the next event, failing the test after a simulated day of silence.
pub async fn next_event(rx: &mut mpsc::Receiver<Notification>) -> SchedulerEvent {
    let n = tokio::time::timeout(Duration::from_secs(86_400), rx.recv())
        .await
        .expect("timed out waiting for a scheduler event")
        .expect("event channel closed");
    n.decode().expect("decodable event")
}

/// Collect events up to and including the first one of `event_type`.
pub async fn events_until(rx: &mut mpsc::Receiver<Notification>, event_type: &str) -> Vec<SchedulerEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = event.event_type() == event_type;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

/// Everything already queued, without waiting.
pub fn drain(rx: &mut mpsc::Receiver<Notification>) -> Vec<SchedulerEvent> {
    let mut seen = Vec::new();
    while let Ok(n) = rx.try_recv() {
        if let Some(e) = n.decode() {
            seen.push(e);
        }
    }
    seen
}

pub fn types(events: &[SchedulerEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.event_type()).collect()
}

/// Adapter that plays back queued outcomes, then succeeds.
///
/// Each call takes `work` of simulated time and records how many calls were
/// in flight at once.
pub struct ScriptedAdapter {
    kind: SourceKind,
    script: Mutex<VecDeque<Result<SyncResult, AdapterError>>>,
    work: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedAdapter {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            script: Mutex::new(VecDeque::new()),
            work: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn failing(kind: SourceKind, times: usize) -> Self {
        let adapter = Self::new(kind);
        for n in 0..times {
            adapter.push(Err(AdapterError::Unavailable(format!("upstream 503 #{}", n + 1))));
        }
        adapter
    }

    pub fn with_work(mut self, work: Duration) -> Self {
        self.work = work;
        self
    }

    pub fn push(&self, outcome: Result<SyncResult, AdapterError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn sync_data(&self, _source_id: &SourceId) -> Result<SyncResult, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if !self.work.is_zero() {
            tokio::time::sleep(self.work).await;
        }
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(SyncResult::new(10)));

        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Adapter that blocks every call until the test opens the gate.
pub struct GatedAdapter {
    kind: SourceKind,
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedAdapter {
    pub fn new(kind: SourceKind) -> Self {
        Self {
            kind,
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Let one blocked (or future) call through.
    pub fn open_once(&self) {
        self.gate.add_permits(1);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for GatedAdapter {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn sync_data(&self, _source_id: &SourceId) -> Result<SyncResult, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| AdapterError::Failed(e.to_string()))?;
        permit.forget();
        Ok(SyncResult::new(1))
    }
}
