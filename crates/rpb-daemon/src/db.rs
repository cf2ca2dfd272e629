//! Durable press/state store backed by `SQLite`.
//!
//! Implements the core's [`PersistenceGateway`] plus the daemon-only
//! surface: access-attempt and startup records, and keyset-paginated
//! history queries. Timestamps are stored as RFC 3339 text with
//! millisecond precision.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rpb_core::{PersistenceGateway, PressRecord, StateTransitionEvent, StoreError, StoreResult};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

/// A failed authentication attempt.
///
/// The presented password is deliberately not part of the record.
#[derive(Debug, Clone)]
pub struct AccessAttempt {
    /// When the attempt was rejected.
    pub timestamp: DateTime<Utc>,
    /// Client address as reported by the fronting proxy.
    pub ip: String,
    /// Client country as reported by the fronting proxy.
    pub country: String,
    /// Username presented with the bad credentials.
    pub username: String,
}

/// One daemon boot, recorded for audit.
#[derive(Debug, Clone)]
pub struct StartupRecord {
    /// When the daemon came up.
    pub started_at: DateTime<Utc>,
    /// Configured maximum hold, in seconds.
    pub timeout_secs: f64,
    /// Configured sense pin.
    pub input_pin: u8,
    /// Configured drive pin.
    pub output_pin: u8,
    /// Whether the hardware backend is active.
    pub hardware: bool,
}

/// A persisted state transition, with its row id for pagination.
#[derive(Debug, Clone, Serialize)]
pub struct StateRow {
    /// Database id.
    pub id: i64,
    /// The transition itself.
    #[serde(flatten)]
    pub event: StateTransitionEvent,
}

/// One page of a keyset-paginated history query.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    /// Rows of this page, oldest first.
    pub items: Vec<T>,
    /// Effective page size.
    pub limit: u32,
    /// Cursor this page was fetched at.
    pub cursor: i64,
    /// Cursor of the next page; `None` on the last page.
    pub next_cursor: Option<i64>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS press (
    id INTEGER PRIMARY KEY,
    source TEXT NOT NULL,
    pressed_at TEXT NOT NULL,
    elapsed REAL NOT NULL,
    start_state INTEGER NOT NULL,
    end_state INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS state (
    id INTEGER PRIMARY KEY,
    changed_at TEXT NOT NULL,
    is_on INTEGER NOT NULL,
    during_press INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS bad_access (
    id INTEGER PRIMARY KEY,
    timestamp TEXT NOT NULL,
    ip TEXT NOT NULL,
    country TEXT NOT NULL,
    username TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS startup (
    id INTEGER PRIMARY KEY,
    started_at TEXT NOT NULL,
    timeout REAL NOT NULL,
    input_pin INTEGER NOT NULL,
    output_pin INTEGER NOT NULL,
    hardware INTEGER NOT NULL
);
";

/// `SQLite`-backed store shared across handlers and background tasks.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and initialize the
    /// schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the file cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::query(format!("failed to open database: {e}")))?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database, for tests.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the schema cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::query(format!("failed to open database: {e}")))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::query(format!("schema init failed: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::query("connection lock poisoned"))
    }

    /// Record a rejected authentication attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    pub fn record_access_attempt(&self, attempt: &AccessAttempt) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bad_access (timestamp, ip, country, username) VALUES (?1, ?2, ?3, ?4)",
            params![
                fmt_ts(attempt.timestamp),
                attempt.ip,
                attempt.country,
                attempt.username
            ],
        )
        .map_err(|e| StoreError::query(format!("bad_access insert failed: {e}")))?;
        Ok(())
    }

    /// Record a daemon boot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the insert fails.
    pub fn record_startup(&self, startup: &StartupRecord) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO startup (started_at, timeout, input_pin, output_pin, hardware)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                fmt_ts(startup.started_at),
                startup.timeout_secs,
                startup.input_pin,
                startup.output_pin,
                startup.hardware
            ],
        )
        .map_err(|e| StoreError::query(format!("startup insert failed: {e}")))?;
        Ok(())
    }

    /// Fetch one page of press history, oldest first, starting at `cursor`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or a row is malformed.
    pub fn press_history(&self, limit: u32, cursor: i64) -> StoreResult<Page<PressRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, source, pressed_at, elapsed, start_state, end_state
                 FROM press WHERE id >= ?1 ORDER BY id ASC LIMIT ?2",
            )
            .map_err(|e| StoreError::query(format!("press history query failed: {e}")))?;
        let raw = stmt
            .query_map(params![cursor, i64::from(limit) + 1], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })
            .map_err(|e| StoreError::query(format!("press history query failed: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::query(format!("press history row failed: {e}")))?;

        let mut items = raw
            .into_iter()
            .map(|(id, source, pressed_at, elapsed, start_state, end_state)| {
                Ok(PressRecord {
                    id: Some(id),
                    source,
                    pressed_at: parse_ts(&pressed_at)?,
                    elapsed,
                    start_state,
                    end_state,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let next_cursor = split_page(&mut items, limit, |record| record.id.unwrap_or(0));
        Ok(Page {
            items,
            limit,
            cursor,
            next_cursor,
        })
    }

    /// Fetch one page of state-transition history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the query fails or a row is malformed.
    pub fn state_history(&self, limit: u32, cursor: i64) -> StoreResult<Page<StateRow>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, changed_at, is_on, during_press
                 FROM state WHERE id >= ?1 ORDER BY id ASC LIMIT ?2",
            )
            .map_err(|e| StoreError::query(format!("state history query failed: {e}")))?;
        let raw = stmt
            .query_map(params![cursor, i64::from(limit) + 1], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, bool>(3)?,
                ))
            })
            .map_err(|e| StoreError::query(format!("state history query failed: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| StoreError::query(format!("state history row failed: {e}")))?;

        let mut items = raw
            .into_iter()
            .map(|(id, changed_at, is_on, during_press)| {
                Ok(StateRow {
                    id,
                    event: StateTransitionEvent {
                        changed_at: parse_ts(&changed_at)?,
                        is_on,
                        during_press,
                    },
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        let next_cursor = split_page(&mut items, limit, |row| row.id);
        Ok(Page {
            items,
            limit,
            cursor,
            next_cursor,
        })
    }
}

impl PersistenceGateway for SqliteStore {
    fn record_press(&self, record: &PressRecord) -> StoreResult<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO press (source, pressed_at, elapsed, start_state, end_state)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.source,
                fmt_ts(record.pressed_at),
                record.elapsed,
                record.start_state,
                record.end_state
            ],
        )
        .map_err(|e| StoreError::query(format!("press insert failed: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    fn record_state_transition(&self, event: &StateTransitionEvent) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO state (changed_at, is_on, during_press) VALUES (?1, ?2, ?3)",
            params![fmt_ts(event.changed_at), event.is_on, event.during_press],
        )
        .map_err(|e| StoreError::query(format!("state insert failed: {e}")))?;
        Ok(())
    }

    fn load_last_press(&self) -> StoreResult<Option<PressRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT id, source, pressed_at, elapsed, start_state, end_state
                 FROM press ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, bool>(4)?,
                        row.get::<_, bool>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| StoreError::query(format!("last press query failed: {e}")))?;

        match row {
            Some((id, source, pressed_at, elapsed, start_state, end_state)) => {
                Ok(Some(PressRecord {
                    id: Some(id),
                    source,
                    pressed_at: parse_ts(&pressed_at)?,
                    elapsed,
                    start_state,
                    end_state,
                }))
            },
            None => Ok(None),
        }
    }

    fn load_last_known_state(&self) -> StoreResult<Option<bool>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT is_on FROM state ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| StoreError::query(format!("last state query failed: {e}")))
    }
}

/// Drop the probe row of a `limit + 1` fetch and return its id as the next
/// cursor.
fn split_page<T>(items: &mut Vec<T>, limit: u32, id_of: impl Fn(&T) -> i64) -> Option<i64> {
    if items.len() > limit as usize {
        let next = id_of(&items[limit as usize]);
        items.truncate(limit as usize);
        Some(next)
    } else {
        None
    }
}

fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::corrupt(format!("bad timestamp '{raw}': {e}")))
}

#[cfg(test)]
mod tests {
    use rpb_core::now_utc_ms;

    use super::*;

    fn press(source: &str) -> PressRecord {
        PressRecord {
            id: None,
            source: source.to_string(),
            pressed_at: now_utc_ms(),
            elapsed: 1.5,
            start_state: false,
            end_state: true,
        }
    }

    #[test]
    fn press_roundtrips_through_sqlite() {
        let store = SqliteStore::open_in_memory().expect("open");
        let id = store.record_press(&press("alice")).expect("insert");
        assert_eq!(id, 1);

        let loaded = store.load_last_press().expect("query").expect("row");
        assert_eq!(loaded.id, Some(1));
        assert_eq!(loaded.source, "alice");
        assert!((loaded.elapsed - 1.5).abs() < f64::EPSILON);
        assert!(!loaded.start_state);
        assert!(loaded.end_state);
    }

    #[test]
    fn press_timestamps_keep_millisecond_precision() {
        let store = SqliteStore::open_in_memory().expect("open");
        let record = press("bob");
        store.record_press(&record).expect("insert");

        let loaded = store.load_last_press().expect("query").expect("row");
        assert_eq!(loaded.pressed_at, record.pressed_at);
    }

    #[test]
    fn empty_store_has_no_last_press_or_state() {
        let store = SqliteStore::open_in_memory().expect("open");
        assert!(store.load_last_press().expect("query").is_none());
        assert!(store.load_last_known_state().expect("query").is_none());
    }

    #[test]
    fn last_known_state_follows_transitions() {
        let store = SqliteStore::open_in_memory().expect("open");
        for is_on in [true, false] {
            store
                .record_state_transition(&StateTransitionEvent {
                    changed_at: now_utc_ms(),
                    is_on,
                    during_press: false,
                })
                .expect("insert");
        }
        assert_eq!(store.load_last_known_state().expect("query"), Some(false));
    }

    #[test]
    fn press_history_paginates_with_keyset_cursor() {
        let store = SqliteStore::open_in_memory().expect("open");
        for i in 0..5 {
            store.record_press(&press(&format!("user{i}"))).expect("insert");
        }

        let first = store.press_history(2, 0).expect("page");
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].id, Some(1));
        assert_eq!(first.next_cursor, Some(3));

        let second = store
            .press_history(2, first.next_cursor.unwrap())
            .expect("page");
        assert_eq!(second.items[0].id, Some(3));
        assert_eq!(second.next_cursor, Some(5));

        let last = store
            .press_history(2, second.next_cursor.unwrap())
            .expect("page");
        assert_eq!(last.items.len(), 1);
        assert_eq!(last.next_cursor, None);
    }

    #[test]
    fn access_attempts_and_startups_insert() {
        let store = SqliteStore::open_in_memory().expect("open");
        store
            .record_access_attempt(&AccessAttempt {
                timestamp: now_utc_ms(),
                ip: "203.0.113.9".to_string(),
                country: "NL".to_string(),
                username: "mallory".to_string(),
            })
            .expect("insert");
        store
            .record_startup(&StartupRecord {
                started_at: now_utc_ms(),
                timeout_secs: 20.0,
                input_pin: 14,
                output_pin: 15,
                hardware: false,
            })
            .expect("insert");
    }
}
