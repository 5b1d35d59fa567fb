//! Durable storage for queued events
//!
//! The queue writes its entire pending set on every mutation, so adapters
//! only need whole-snapshot `load` / `save`. Writes are advisory: the queue
//! logs failures and keeps going with its in-memory buffer. Adapters are
//! never called with the queue locked, so they may log or call back into it.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{params, Connection};

use crate::error::{Error, Result};
use crate::event::Event;

/// Persistence backend for the event queue
pub trait StorageAdapter: Send + Sync {
    /// Load the last saved snapshot, oldest event first
    fn load(&self) -> Result<Vec<Event>>;

    /// Replace the stored snapshot
    fn save(&self, events: &[Event]) -> Result<()>;

    /// Remove everything; used in preference to `save(&[])`
    fn clear(&self) -> Result<()> {
        self.save(&[])
    }
}

/// Process-local storage, mostly useful in tests
#[derive(Debug, Default)]
pub struct MemoryStorage {
    events: Mutex<Vec<Event>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Vec<Event>) -> Self {
        Self {
            events: Mutex::new(events),
        }
    }

    /// Current stored snapshot
    pub fn snapshot(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StorageAdapter for MemoryStorage {
    fn load(&self) -> Result<Vec<Event>> {
        Ok(self.snapshot())
    }

    fn save(&self, events: &[Event]) -> Result<()> {
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = events.to_vec();
        Ok(())
    }
}

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: queued events snapshot
    r#"
    CREATE TABLE IF NOT EXISTS queued_events (
        position   INTEGER PRIMARY KEY,
        event_id   TEXT NOT NULL,
        payload    JSON NOT NULL
    );
    "#,
];

/// SQLite-backed storage that survives process restarts
pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    /// Open or create a queue database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.migrate()?;
        Ok(storage)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let storage = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        storage.migrate()?;
        Ok(storage)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.connection();
        let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        for (idx, migration) in MIGRATIONS.iter().enumerate() {
            let version = idx as i32 + 1;
            if version > current {
                conn.execute_batch(migration)?;
                conn.pragma_update(None, "user_version", version)?;
                tracing::debug!(version, "Applied queue storage migration");
            }
        }
        Ok(())
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of stored events
    pub fn count(&self) -> Result<usize> {
        let conn = self.connection();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM queued_events", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

impl StorageAdapter for SqliteStorage {
    fn load(&self) -> Result<Vec<Event>> {
        let conn = self.connection();
        let mut stmt = conn.prepare("SELECT payload FROM queued_events ORDER BY position")?;
        let payloads = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        payloads
            .iter()
            .map(|payload| serde_json::from_str(payload).map_err(Error::from))
            .collect()
    }

    fn save(&self, events: &[Event]) -> Result<()> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM queued_events", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO queued_events (position, event_id, payload) VALUES (?1, ?2, ?3)",
            )?;
            for (position, event) in events.iter().enumerate() {
                stmt.execute(params![
                    position as i64,
                    event.event_id.to_string(),
                    serde_json::to_string(event)?,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.connection();
        conn.execute("DELETE FROM queued_events", [])?;
        Ok(())
    }
}
