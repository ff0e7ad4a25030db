use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use conduit_core::{SourceDescriptor, SourceId, SourceKind, SourceStatus, SyncResult};
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::instrument;

use crate::db::init_db;
use crate::error::StoreError;

/// Persistence of source descriptors.
///
/// Implementations must be cheap to call from the scheduler's hot path; all
/// methods are synchronous.
pub trait SourceStore: Send + Sync {
    fn load(&self, id: &SourceId) -> Result<Option<SourceDescriptor>, StoreError>;
    fn save(&self, descriptor: &SourceDescriptor) -> Result<(), StoreError>;
    fn list(&self) -> Result<Vec<SourceDescriptor>, StoreError>;
    fn delete(&self, id: &SourceId) -> Result<bool, StoreError>;
}

/// SQLite-backed store.
pub struct SqliteSourceStore {
    conn: Mutex<Connection>,
}

const SELECT_COLUMNS: &str = "id, kind, schedule, timezone, status, last_sync_at, sync_count,
     error_count, last_error, last_sync_result, created_at, updated_at";

impl SqliteSourceStore {
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::new(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-call; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SourceStore for SqliteSourceStore {
    #[instrument(skip(self), fields(source_id = %id))]
    fn load(&self, id: &SourceId) -> Result<Option<SourceDescriptor>, StoreError> {
        let conn = self.conn();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sources WHERE id = ?1");
        let row = conn
            .query_row(&sql, params![id.as_str()], read_row)
            .optional()?;
        row.map(row_to_descriptor).transpose()
    }

    #[instrument(skip(self, descriptor), fields(source_id = %descriptor.id))]
    fn save(&self, descriptor: &SourceDescriptor) -> Result<(), StoreError> {
        let result_json = descriptor
            .last_sync_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO sources
             (id, kind, schedule, timezone, status, last_sync_at, sync_count,
              error_count, last_error, last_sync_result, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12)
             ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind,
                schedule = excluded.schedule,
                timezone = excluded.timezone,
                status = excluded.status,
                last_sync_at = excluded.last_sync_at,
                sync_count = excluded.sync_count,
                error_count = excluded.error_count,
                last_error = excluded.last_error,
                last_sync_result = excluded.last_sync_result,
                updated_at = excluded.updated_at",
            params![
                descriptor.id.as_str(),
                descriptor.kind.as_str(),
                descriptor.schedule,
                descriptor.timezone,
                descriptor.status.to_string(),
                descriptor.last_sync_at.map(|t| t.to_rfc3339()),
                descriptor.sync_count as i64,
                descriptor.error_count as i64,
                descriptor.last_error,
                result_json,
                descriptor.created_at.to_rfc3339(),
                descriptor.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    #[instrument(skip(self))]
    fn list(&self) -> Result<Vec<SourceDescriptor>, StoreError> {
        let conn = self.conn();
        let sql = format!("SELECT {SELECT_COLUMNS} FROM sources ORDER BY created_at, id");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(row_to_descriptor).collect()
    }

    #[instrument(skip(self), fields(source_id = %id))]
    fn delete(&self, id: &SourceId) -> Result<bool, StoreError> {
        let conn = self.conn();
        let n = conn.execute("DELETE FROM sources WHERE id = ?1", params![id.as_str()])?;
        Ok(n > 0)
    }
}

/// A `sources` row as stored, before its text columns are parsed.
struct StoredRow {
    id: String,
    kind: String,
    schedule: String,
    timezone: String,
    status: String,
    last_sync_at: Option<String>,
    sync_count: i64,
    error_count: i64,
    last_error: Option<String>,
    last_sync_result: Option<String>,
    created_at: String,
    updated_at: String,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
    Ok(StoredRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        schedule: row.get(2)?,
        timezone: row.get(3)?,
        status: row.get(4)?,
        last_sync_at: row.get(5)?,
        sync_count: row.get(6)?,
        error_count: row.get(7)?,
        last_error: row.get(8)?,
        last_sync_result: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn row_to_descriptor(row: StoredRow) -> Result<SourceDescriptor, StoreError> {
    let corrupt = |column: &str, reason: String| StoreError::Corrupt {
        id: row.id.clone(),
        reason: format!("{column}: {reason}"),
    };

    let kind = row
        .kind
        .parse::<SourceKind>()
        .map_err(|e| corrupt("kind", e.to_string()))?;
    let status = row
        .status
        .parse::<SourceStatus>()
        .map_err(|e| corrupt("status", e.to_string()))?;
    let last_sync_at = row
        .last_sync_at
        .as_deref()
        .map(parse_ts)
        .transpose()
        .map_err(|e| corrupt("last_sync_at", e))?;
    let last_sync_result = row
        .last_sync_result
        .as_deref()
        .map(serde_json::from_str::<SyncResult>)
        .transpose()
        .map_err(|e| corrupt("last_sync_result", e.to_string()))?;
    let created_at = parse_ts(&row.created_at).map_err(|e| corrupt("created_at", e))?;
    let updated_at = parse_ts(&row.updated_at).map_err(|e| corrupt("updated_at", e))?;

    Ok(SourceDescriptor {
        id: SourceId::new(row.id),
        kind,
        schedule: row.schedule,
        timezone: row.timezone,
        status,
        last_sync_at,
        sync_count: row.sync_count.max(0) as u64,
        error_count: row.error_count.max(0) as u64,
        last_error: row.last_error,
        last_sync_result,
        created_at,
        updated_at,
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("{e} ({s:?})"))
}

/// Process-local store; state is lost on exit.
#[derive(Default)]
pub struct MemorySourceStore {
    sources: DashMap<SourceId, SourceDescriptor>,
}

impl MemorySourceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SourceStore for MemorySourceStore {
    fn load(&self, id: &SourceId) -> Result<Option<SourceDescriptor>, StoreError> {
        Ok(self.sources.get(id).map(|d| d.clone()))
    }

    fn save(&self, descriptor: &SourceDescriptor) -> Result<(), StoreError> {
        self.sources
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(())
    }

    fn list(&self) -> Result<Vec<SourceDescriptor>, StoreError> {
        let mut all: Vec<_> = self.sources.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn delete(&self, id: &SourceId) -> Result<bool, StoreError> {
        Ok(self.sources.remove(id).is_some())
    }
}
