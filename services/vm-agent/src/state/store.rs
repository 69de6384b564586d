//! SQLite-based VM record store.
//!
//! This provides durable storage for VM records, enabling the agent to
//! recover its view of the host after a restart.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use ember_id::VmId;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("VM not found: {0}")]
    NotFound(VmId),

    #[error("VM already exists: {0}")]
    AlreadyExists(VmId),

    #[error("Invalid state: {0}")]
    Invalid(String),
}

/// VM lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    /// Resources are being provisioned.
    Creating,
    /// Provisioned, never started or not yet started.
    Created,
    /// Hypervisor process is running.
    Running,
    /// Hypervisor process was stopped on request.
    Stopped,
    /// Something went wrong; see `last_error`.
    Error,
    /// Terminal. Never persisted: the record is removed instead.
    Deleted,
}

impl VmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmStatus {
    type Err = StateStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creating" => Ok(Self::Creating),
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            "deleted" => Ok(Self::Deleted),
            other => Err(StateStoreError::Invalid(format!("unknown status {other:?}"))),
        }
    }
}

/// Durable VM record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmRecord {
    pub id: VmId,
    pub name: String,
    pub status: VmStatus,
    pub memory_mib: u32,
    pub vcpu_count: u8,
    pub disk_size_gib: u32,
    pub ip_address: Option<Ipv4Addr>,
    /// Reason for the most recent transition to `error`.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable storage for VM records.
///
/// Implementations must be safe to call from many tasks at once.
pub trait StateStore: Send + Sync {
    /// Insert a new record. Fails if the id already exists.
    fn create_vm(&self, record: &VmRecord) -> Result<(), StateStoreError>;

    /// Overwrite the mutable fields of an existing record.
    ///
    /// `updated_at` never moves backwards.
    fn update_vm(&self, record: &VmRecord) -> Result<(), StateStoreError>;

    /// Fetch a record.
    fn get_vm(&self, id: &VmId) -> Result<VmRecord, StateStoreError>;

    /// All records, newest first.
    fn list_vms(&self) -> Result<Vec<VmRecord>, StateStoreError>;

    /// Remove a record.
    fn delete_vm(&self, id: &VmId) -> Result<(), StateStoreError>;
}

/// Row as stored, before parsing.
struct VmRow {
    id: String,
    name: String,
    status: String,
    memory_mib: i64,
    vcpu_count: i64,
    disk_size_gib: i64,
    ip_address: Option<String>,
    last_error: Option<String>,
    created_at: i64,
    updated_at: i64,
}

const SELECT_COLUMNS: &str = "SELECT id, name, status, memory_mib, vcpu_count, disk_size_gib, \
     ip_address, last_error, created_at, updated_at FROM vms";

impl VmRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            status: row.get(2)?,
            memory_mib: row.get(3)?,
            vcpu_count: row.get(4)?,
            disk_size_gib: row.get(5)?,
            ip_address: row.get(6)?,
            last_error: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_record(self) -> Result<VmRecord, StateStoreError> {
        let invalid = |what: &str| StateStoreError::Invalid(format!("{what} in row {}", self.id));

        let id = VmId::parse(&self.id)
            .map_err(|e| StateStoreError::Invalid(format!("bad id {:?}: {e}", self.id)))?;
        let ip_address = match &self.ip_address {
            Some(ip) => Some(ip.parse().map_err(|_| invalid("bad ip_address"))?),
            None => None,
        };

        Ok(VmRecord {
            id,
            status: self.status.parse()?,
            memory_mib: u32::try_from(self.memory_mib).map_err(|_| invalid("bad memory_mib"))?,
            vcpu_count: u8::try_from(self.vcpu_count).map_err(|_| invalid("bad vcpu_count"))?,
            disk_size_gib: u32::try_from(self.disk_size_gib)
                .map_err(|_| invalid("bad disk_size_gib"))?,
            ip_address,
            created_at: DateTime::from_timestamp_millis(self.created_at)
                .ok_or_else(|| invalid("bad created_at"))?,
            updated_at: DateTime::from_timestamp_millis(self.updated_at)
                .ok_or_else(|| invalid("bad updated_at"))?,
            name: self.name,
            last_error: self.last_error,
        })
    }
}

/// SQLite state store.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateStoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StateStoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS vms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                status TEXT NOT NULL,
                memory_mib INTEGER NOT NULL,
                vcpu_count INTEGER NOT NULL,
                disk_size_gib INTEGER NOT NULL,
                ip_address TEXT,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_vms_created_at ON vms(created_at);
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }
}

fn ensure_persistable(record: &VmRecord) -> Result<(), StateStoreError> {
    if record.status == VmStatus::Deleted {
        return Err(StateStoreError::Invalid(format!(
            "refusing to persist {} with status deleted",
            record.id
        )));
    }
    Ok(())
}

impl StateStore for SqliteStateStore {
    fn create_vm(&self, record: &VmRecord) -> Result<(), StateStoreError> {
        ensure_persistable(record)?;
        let conn = self.conn();
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO vms (id, name, status, memory_mib, vcpu_count, disk_size_gib,
                                       ip_address, last_error, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                record.id.to_string(),
                record.name,
                record.status.as_str(),
                record.memory_mib,
                record.vcpu_count,
                record.disk_size_gib,
                record.ip_address.map(|ip| ip.to_string()),
                record.last_error,
                record.created_at.timestamp_millis(),
                record.updated_at.timestamp_millis(),
            ],
        )?;
        if inserted == 0 {
            return Err(StateStoreError::AlreadyExists(record.id));
        }
        debug!(vm_id = %record.id, status = %record.status, "Inserted VM record");
        Ok(())
    }

    fn update_vm(&self, record: &VmRecord) -> Result<(), StateStoreError> {
        ensure_persistable(record)?;
        let conn = self.conn();
        let updated = conn.execute(
            r#"
            UPDATE vms SET
                name = ?2,
                status = ?3,
                memory_mib = ?4,
                vcpu_count = ?5,
                disk_size_gib = ?6,
                ip_address = ?7,
                last_error = ?8,
                updated_at = MAX(updated_at, ?9)
            WHERE id = ?1
            "#,
            params![
                record.id.to_string(),
                record.name,
                record.status.as_str(),
                record.memory_mib,
                record.vcpu_count,
                record.disk_size_gib,
                record.ip_address.map(|ip| ip.to_string()),
                record.last_error,
                record.updated_at.timestamp_millis(),
            ],
        )?;
        if updated == 0 {
            return Err(StateStoreError::NotFound(record.id));
        }
        debug!(vm_id = %record.id, status = %record.status, "Updated VM record");
        Ok(())
    }

    fn get_vm(&self, id: &VmId) -> Result<VmRecord, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        stmt.query_row(params![id.to_string()], VmRow::from_row)
            .optional()?
            .ok_or(StateStoreError::NotFound(*id))?
            .into_record()
    }

    fn list_vms(&self) -> Result<Vec<VmRecord>, StateStoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_COLUMNS} ORDER BY created_at DESC, id DESC"
        ))?;

        let rows = stmt
            .query_map([], VmRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(VmRow::into_record).collect()
    }

    fn delete_vm(&self, id: &VmId) -> Result<(), StateStoreError> {
        let deleted = self
            .conn()
            .execute("DELETE FROM vms WHERE id = ?1", params![id.to_string()])?;
        if deleted == 0 {
            return Err(StateStoreError::NotFound(*id));
        }
        debug!(vm_id = %id, "Deleted VM record");
        Ok(())
    }
}
