use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Stable, unique identifier of an external data source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(pub String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SourceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The family of external system a source belongs to.
///
/// Each kind is served by exactly one adapter, registered when the scheduler
/// is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Spreadsheet,
    Accounting,
    Storefront,
    Payments,
    Database,
}

impl SourceKind {
    pub const ALL: [SourceKind; 5] = [
        SourceKind::Spreadsheet,
        SourceKind::Accounting,
        SourceKind::Storefront,
        SourceKind::Payments,
        SourceKind::Database,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Spreadsheet => "spreadsheet",
            SourceKind::Accounting => "accounting",
            SourceKind::Storefront => "storefront",
            SourceKind::Payments => "payments",
            SourceKind::Database => "database",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        SourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| CoreError::UnknownKind(s.to_string()))
    }
}

/// Lifecycle state of a source as seen by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Scheduled and idle.
    #[default]
    Active,
    /// A run is executing right now.
    Syncing,
    /// Not firing; the schedule is kept for `resume`.
    Paused,
    /// The last run failed, was reaped, or retries are exhausted.
    Error,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceStatus::Active => "active",
            SourceStatus::Syncing => "syncing",
            SourceStatus::Paused => "paused",
            SourceStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(SourceStatus::Active),
            "syncing" => Ok(SourceStatus::Syncing),
            "paused" => Ok(SourceStatus::Paused),
            "error" => Ok(SourceStatus::Error),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Summary an adapter hands back after a successful pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Number of records the adapter ingested.
    #[serde(default)]
    pub records: u64,
    /// Adapter-specific detail, stored verbatim.
    #[serde(default)]
    pub detail: serde_json::Value,
}

impl SyncResult {
    pub fn new(records: u64) -> Self {
        Self {
            records,
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// A persisted data source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: SourceId,
    pub kind: SourceKind,
    /// Recurrence expression, cron syntax (5, 6 or 7 fields).
    pub schedule: String,
    /// IANA timezone name the expression is evaluated in. Empty means UTC.
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub status: SourceStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_count: u64,
    #[serde(default)]
    pub error_count: u64,
    /// Reason for the most recent failure; cleared on success.
    pub last_error: Option<String>,
    pub last_sync_result: Option<SyncResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceDescriptor {
    /// A fresh, never-synced source in `Active` state.
    pub fn new(
        id: impl Into<SourceId>,
        kind: SourceKind,
        schedule: impl Into<String>,
        timezone: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            kind,
            schedule: schedule.into(),
            timezone: timezone.into(),
            status: SourceStatus::Active,
            last_sync_at: None,
            sync_count: 0,
            error_count: 0,
            last_error: None,
            last_sync_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status == SourceStatus::Paused
    }
}
