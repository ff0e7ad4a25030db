//! `conduit-core`: identifiers, source records and configuration shared by
//! the scheduler and the daemon.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConduitConfig, SchedulerConfig};
pub use error::{CoreError, Result};
pub use types::{SourceDescriptor, SourceId, SourceKind, SourceStatus, SyncResult};
