//! `conduit-scheduler`: keeps many external data sources synchronised on
//! per-source cron schedules.
//!
//! A [`Scheduler`] arms one recurring trigger per source, guarantees at most
//! one in-flight run per source, retries failures with exponential backoff,
//! reaps runs that hang past a threshold, and reports every lifecycle change
//! to a [`NotificationSink`].

pub mod adapter;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod guard;
pub mod notify;
pub mod registry;
pub mod retry;
pub mod schedule;
pub mod sources;
pub mod status;
pub mod store;
pub mod sweeper;
pub mod types;

pub use adapter::{AdapterRegistry, SourceAdapter};
pub use clock::{Clock, SystemClock, TokioClock};
pub use engine::Scheduler;
pub use error::{AdapterError, NotifyError, Result, SchedulerError, StoreError, SyncFailure};
pub use notify::{
    BroadcastSink, ChannelSink, FanoutSink, Notification, NotificationSink, SchedulerEvent,
    TracingSink,
};
pub use schedule::SyncSchedule;
pub use store::{MemorySourceStore, SourceStore, SqliteSourceStore};
pub use sweeper::SweepReport;
pub use types::{
    DispatchOutcome, RetryPlan, RetryPolicy, RunId, RunOrigin, RunRecord, ScheduleStatus,
    ScheduledTrigger, SyncOutcome,
};
