//! Append-only audit trail of connection lifecycle events and status changes.
//!
//! Recording is best-effort: callers log and swallow [`AuditError`]s so that a
//! broken audit backend never fails the device operation that produced the record.

use crate::error::AuditError;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub trait AuditLog: Send + Sync {
    fn record_lifecycle_event(
        &self,
        ts: OffsetDateTime,
        device_id: &str,
        event: &str,
    ) -> Result<(), AuditError>;

    fn record_status_change(
        &self,
        ts: OffsetDateTime,
        device_id: &str,
        status: u8,
    ) -> Result<(), AuditError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    Lifecycle { event: String },
    StatusChange { status: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub device_id: String,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

/// Keeps every record in memory.
#[derive(Default)]
pub struct MemoryAuditLog {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().clone()
    }

    /// Status values recorded for `device_id`, oldest first.
    pub fn status_changes(&self, device_id: &str) -> Vec<u8> {
        self.lock()
            .iter()
            .filter(|r| r.device_id == device_id)
            .filter_map(|r| match r.entry {
                AuditEntry::StatusChange { status } => Some(status),
                _ => None,
            })
            .collect()
    }

    pub fn lifecycle_events(&self, device_id: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|r| r.device_id == device_id)
            .filter_map(|r| match &r.entry {
                AuditEntry::Lifecycle { event } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AuditRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl AuditLog for MemoryAuditLog {
    fn record_lifecycle_event(
        &self,
        ts: OffsetDateTime,
        device_id: &str,
        event: &str,
    ) -> Result<(), AuditError> {
        self.lock().push(AuditRecord {
            ts,
            device_id: device_id.to_string(),
            entry: AuditEntry::Lifecycle {
                event: event.to_string(),
            },
        });
        Ok(())
    }

    fn record_status_change(
        &self,
        ts: OffsetDateTime,
        device_id: &str,
        status: u8,
    ) -> Result<(), AuditError> {
        self.lock().push(AuditRecord {
            ts,
            device_id: device_id.to_string(),
            entry: AuditEntry::StatusChange { status },
        });
        Ok(())
    }
}

/// Emits records as `tracing` events on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record_lifecycle_event(
        &self,
        ts: OffsetDateTime,
        device_id: &str,
        event: &str,
    ) -> Result<(), AuditError> {
        let ts = format_ts(ts)?;
        tracing::info!(target: "audit", %ts, device = device_id, event);
        Ok(())
    }

    fn record_status_change(
        &self,
        ts: OffsetDateTime,
        device_id: &str,
        status: u8,
    ) -> Result<(), AuditError> {
        let ts = format_ts(ts)?;
        let status = format!("0b{status:08b}");
        tracing::info!(target: "audit", %ts, device = device_id, %status, "status changed");
        Ok(())
    }
}

pub(crate) fn format_ts(ts: OffsetDateTime) -> Result<String, AuditError> {
    ts.format(&Rfc3339)
        .map_err(|e| AuditError::Storage(format!("timestamp: {e}")))
}

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteAuditLog;

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::{format_ts, AuditEntry, AuditLog, AuditRecord};
    use crate::error::AuditError;
    use rusqlite::{params, Connection};
    use std::path::Path;
    use std::sync::{Mutex, MutexGuard, PoisonError};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    /// Audit trail in a sqlite file, one table per record kind.
    pub struct SqliteAuditLog {
        conn: Mutex<Connection>,
    }

    impl SqliteAuditLog {
        pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
            let conn = Connection::open(path).map_err(storage)?;
            Self::with_connection(conn)
        }

        pub fn open_in_memory() -> Result<Self, AuditError> {
            let conn = Connection::open_in_memory().map_err(storage)?;
            Self::with_connection(conn)
        }

        fn with_connection(conn: Connection) -> Result<Self, AuditError> {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS lifecycle_event (
                    id          INTEGER PRIMARY KEY,
                    ts          TEXT NOT NULL,
                    device_id   TEXT NOT NULL,
                    event       TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS status_change (
                    id          INTEGER PRIMARY KEY,
                    ts          TEXT NOT NULL,
                    device_id   TEXT NOT NULL,
                    status      INTEGER NOT NULL
                );",
            )
            .map_err(storage)?;
            tracing::debug!("audit tables ready");
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        /// Newest first, at most `limit` rows.
        pub fn recent_lifecycle_events(
            &self,
            device_id: &str,
            limit: usize,
        ) -> Result<Vec<AuditRecord>, AuditError> {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT ts, event FROM lifecycle_event
                     WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![device_id, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(storage)?;
            let mut out = Vec::new();
            for row in rows {
                let (ts, event) = row.map_err(storage)?;
                out.push(AuditRecord {
                    ts: parse_ts(&ts)?,
                    device_id: device_id.to_string(),
                    entry: AuditEntry::Lifecycle { event },
                });
            }
            Ok(out)
        }

        /// Newest first, at most `limit` rows.
        pub fn recent_status_changes(
            &self,
            device_id: &str,
            limit: usize,
        ) -> Result<Vec<AuditRecord>, AuditError> {
            let conn = self.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT ts, status FROM status_change
                     WHERE device_id = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .map_err(storage)?;
            let rows = stmt
                .query_map(params![device_id, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u8>(1)?))
                })
                .map_err(storage)?;
            let mut out = Vec::new();
            for row in rows {
                let (ts, status) = row.map_err(storage)?;
                out.push(AuditRecord {
                    ts: parse_ts(&ts)?,
                    device_id: device_id.to_string(),
                    entry: AuditEntry::StatusChange { status },
                });
            }
            Ok(out)
        }

        fn lock(&self) -> MutexGuard<'_, Connection> {
            self.conn.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    impl AuditLog for SqliteAuditLog {
        fn record_lifecycle_event(
            &self,
            ts: OffsetDateTime,
            device_id: &str,
            event: &str,
        ) -> Result<(), AuditError> {
            self.lock()
                .execute(
                    "INSERT INTO lifecycle_event (ts, device_id, event) VALUES (?1, ?2, ?3)",
                    params![format_ts(ts)?, device_id, event],
                )
                .map_err(storage)?;
            Ok(())
        }

        fn record_status_change(
            &self,
            ts: OffsetDateTime,
            device_id: &str,
            status: u8,
        ) -> Result<(), AuditError> {
            self.lock()
                .execute(
                    "INSERT INTO status_change (ts, device_id, status) VALUES (?1, ?2, ?3)",
                    params![format_ts(ts)?, device_id, status],
                )
                .map_err(storage)?;
            Ok(())
        }
    }

    fn storage(e: rusqlite::Error) -> AuditError {
        AuditError::Storage(e.to_string())
    }

    fn parse_ts(raw: &str) -> Result<OffsetDateTime, AuditError> {
        OffsetDateTime::parse(raw, &Rfc3339)
            .map_err(|e| AuditError::Storage(format!("bad timestamp {raw:?}: {e}")))
    }
}
