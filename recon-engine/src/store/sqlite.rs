/*!
SQLite-backed Scan Store (WAL journal, append-only event log)
*/

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OpenFlags, Row, params};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::event::Event;

use super::{AppendOutcome, EventFilter, ScanRecord, ScanStatus, ScanStore};

/// Durable Scan Store on an embedded SQLite database.
///
/// Runs in WAL mode so each committed append survives a crash; on restart a
/// scan is resumable up to the last durably recorded event. All engine access
/// goes through one serialised connection.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self::initialize(conn)?;
        info!(path = %path.as_ref().display(), "opened scan store");
        Ok(store)
    }

    /// Private in-memory database, handy for scratch use.
    pub fn open_in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn)
    }

    /// Open an existing database without creating one; used when resuming.
    pub fn open_existing<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE,
        )?;
        Self::initialize(conn)
    }

    fn initialize(conn: Connection) -> EngineResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS scan (
                scan_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                target_kind TEXT NOT NULL,
                target_value TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                ended_at INTEGER,
                status TEXT NOT NULL,
                config_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS event (
                id TEXT PRIMARY KEY,
                scan_id TEXT NOT NULL REFERENCES scan(scan_id),
                type TEXT NOT NULL,
                data TEXT NOT NULL,
                module TEXT NOT NULL,
                parent_id TEXT,
                created_at INTEGER NOT NULL,
                depth INTEGER NOT NULL,
                confidence INTEGER NOT NULL,
                visibility INTEGER NOT NULL,
                risk INTEGER NOT NULL,
                hash TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_event_scan_hash
                ON event(scan_id, hash);
            CREATE INDEX IF NOT EXISTS idx_event_scan_created
                ON event(scan_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_event_scan_type
                ON event(scan_id, type);

            CREATE TABLE IF NOT EXISTS event_edge (
                scan_id TEXT NOT NULL,
                child_id TEXT NOT NULL,
                parent_id TEXT NOT NULL,
                UNIQUE(scan_id, child_id, parent_id)
            );

            CREATE TABLE IF NOT EXISTS resolution_cache (
                scan_id TEXT NOT NULL,
                name TEXT NOT NULL,
                addresses_json TEXT NOT NULL,
                PRIMARY KEY (scan_id, name)
            );

            CREATE TABLE IF NOT EXISTS scan_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                level TEXT NOT NULL,
                component TEXT NOT NULL,
                message TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::StoreFatal("connection lock poisoned".to_string()))
    }

    fn row_to_scan(row: &Row<'_>) -> rusqlite::Result<ScanRecord> {
        let status_str: String = row.get(6)?;
        Ok(ScanRecord {
            id: row.get(0)?,
            name: row.get(1)?,
            target_kind: row.get(2)?,
            target_value: row.get(3)?,
            created_at: row.get(4)?,
            ended_at: row.get(5)?,
            status: ScanStatus::parse(&status_str).unwrap_or(ScanStatus::Errored),
            config_json: row.get(7)?,
        })
    }

    fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
        Ok(Event {
            id: row.get(0)?,
            scan_id: row.get(1)?,
            event_type: row.get(2)?,
            data: row.get(3)?,
            module: row.get(4)?,
            parent_id: row.get(5)?,
            created_at: row.get(6)?,
            depth: row.get(7)?,
            confidence: row.get(8)?,
            visibility: row.get(9)?,
            risk: row.get(10)?,
            hash: row.get(11)?,
        })
    }
}

const EVENT_COLUMNS: &str =
    "id, scan_id, type, data, module, parent_id, created_at, depth, confidence, visibility, risk, hash";

impl ScanStore for SqliteStore {
    fn create_scan(&self, scan: &ScanRecord) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT INTO scan
             (scan_id, name, target_kind, target_value, created_at, ended_at, status, config_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                scan.id,
                scan.name,
                scan.target_kind,
                scan.target_value,
                scan.created_at,
                scan.ended_at,
                scan.status.as_str(),
                scan.config_json,
            ],
        )?;
        Ok(())
    }

    fn get_scan(&self, scan_id: &str) -> EngineResult<Option<ScanRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT scan_id, name, target_kind, target_value, created_at, ended_at, status, config_json
             FROM scan WHERE scan_id = ?1",
        )?;
        match stmt.query_row([scan_id], Self::row_to_scan) {
            Ok(scan) => Ok(Some(scan)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list_scans(&self) -> EngineResult<Vec<ScanRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT scan_id, name, target_kind, target_value, created_at, ended_at, status, config_json
             FROM scan ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], Self::row_to_scan)?;
        let mut scans = Vec::new();
        for row in rows {
            scans.push(row?);
        }
        Ok(scans)
    }

    fn append_event(&self, event: &Event) -> EngineResult<AppendOutcome> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            &format!("INSERT OR IGNORE INTO event ({EVENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"),
            params![
                event.id,
                event.scan_id,
                event.event_type,
                event.data,
                event.module,
                event.parent_id,
                event.created_at,
                event.depth,
                event.confidence,
                event.visibility,
                event.risk,
                event.hash,
            ],
        )?;
        if inserted > 0 {
            return Ok(AppendOutcome::Inserted);
        }
        let existing_id: String = conn.query_row(
            "SELECT id FROM event WHERE scan_id = ?1 AND hash = ?2",
            params![event.scan_id, event.hash],
            |row| row.get(0),
        )?;
        Ok(AppendOutcome::Duplicate { existing_id })
    }

    fn record_edge(&self, scan_id: &str, child_id: &str, parent_id: &str) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO event_edge (scan_id, child_id, parent_id) VALUES (?1, ?2, ?3)",
            params![scan_id, child_id, parent_id],
        )?;
        Ok(())
    }

    fn edges(&self, scan_id: &str) -> EngineResult<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT child_id, parent_id FROM event_edge WHERE scan_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map([scan_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut edges = Vec::new();
        for row in rows {
            edges.push(row?);
        }
        Ok(edges)
    }

    fn set_status(
        &self,
        scan_id: &str,
        status: ScanStatus,
        ended_at: Option<i64>,
    ) -> EngineResult<()> {
        let updated = self.conn()?.execute(
            "UPDATE scan SET status = ?2, ended_at = COALESCE(?3, ended_at) WHERE scan_id = ?1",
            params![scan_id, status.as_str(), ended_at],
        )?;
        if updated == 0 {
            return Err(EngineError::UnknownScan(scan_id.to_string()));
        }
        Ok(())
    }

    fn events(&self, scan_id: &str, filter: &EventFilter) -> EngineResult<Vec<Event>> {
        super::require_scan(self, scan_id)?;
        let conn = self.conn()?;
        let limit = filter.limit.map(|n| n as i64).unwrap_or(-1);
        let mut events = Vec::new();
        if let Some(event_type) = &filter.event_type {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM event
                 WHERE scan_id = ?1 AND type = ?2
                 ORDER BY created_at, id LIMIT ?3 OFFSET ?4"
            ))?;
            let rows = stmt.query_map(
                params![scan_id, event_type, limit, filter.offset as i64],
                Self::row_to_event,
            )?;
            for row in rows {
                events.push(row?);
            }
        } else {
            let mut stmt = stmt_all_events(&conn)?;
            let rows = stmt.query_map(
                params![scan_id, limit, filter.offset as i64],
                Self::row_to_event,
            )?;
            for row in rows {
                events.push(row?);
            }
        }
        Ok(events)
    }

    fn event_count(&self, scan_id: &str) -> EngineResult<u64> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM event WHERE scan_id = ?1",
            [scan_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn counts_by_type(&self, scan_id: &str) -> EngineResult<std::collections::BTreeMap<String, u64>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT type, COUNT(*) FROM event WHERE scan_id = ?1 GROUP BY type")?;
        let rows = stmt.query_map([scan_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut counts = std::collections::BTreeMap::new();
        for row in rows {
            let (event_type, count) = row?;
            counts.insert(event_type, count);
        }
        Ok(counts)
    }

    fn get_resolution(&self, scan_id: &str, name: &str) -> EngineResult<Option<Vec<String>>> {
        let conn = self.conn()?;
        let result = conn.query_row(
            "SELECT addresses_json FROM resolution_cache WHERE scan_id = ?1 AND name = ?2",
            params![scan_id, name],
            |row| row.get::<_, String>(0),
        );
        match result {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put_resolution(&self, scan_id: &str, name: &str, addresses: &[String]) -> EngineResult<()> {
        let json = serde_json::to_string(addresses)?;
        self.conn()?.execute(
            "INSERT OR REPLACE INTO resolution_cache (scan_id, name, addresses_json)
             VALUES (?1, ?2, ?3)",
            params![scan_id, name, json],
        )?;
        Ok(())
    }

    fn append_log(
        &self,
        scan_id: &str,
        level: &str,
        component: &str,
        message: &str,
    ) -> EngineResult<()> {
        self.conn()?.execute(
            "INSERT INTO scan_log (scan_id, created_at, level, component, message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![scan_id, crate::event::now_ms(), level, component, message],
        )?;
        Ok(())
    }
}

fn stmt_all_events(conn: &Connection) -> rusqlite::Result<rusqlite::Statement<'_>> {
    conn.prepare(&format!(
        "SELECT {EVENT_COLUMNS} FROM event
         WHERE scan_id = ?1
         ORDER BY created_at, id LIMIT ?2 OFFSET ?3"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventCatalog, EventFactory};
    use std::sync::Arc;

    fn scan_record(id: &str) -> ScanRecord {
        ScanRecord {
            id: id.to_string(),
            name: "test".to_string(),
            target_kind: "DOMAIN_NAME".to_string(),
            target_value: "example.com".to_string(),
            created_at: 0,
            ended_at: None,
            status: ScanStatus::Created,
            config_json: "{}".to_string(),
        }
    }

    #[test]
    fn round_trips_scan_and_events() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_scan(&scan_record("s1")).unwrap();

        let factory = EventFactory::new("s1", Arc::new(EventCatalog::seed()));
        let root = factory.root("example.com");
        assert_eq!(store.append_event(&root).unwrap(), AppendOutcome::Inserted);
        let child = factory
            .make("DOMAIN_NAME_TARGET", "example.com", "m1", &root)
            .unwrap();
        store.append_event(&child).unwrap();
        store.record_edge("s1", &child.id, &root.id).unwrap();

        let events = store.events("s1", &EventFilter::default()).unwrap();
        let mut expected = vec![root.clone(), child.clone()];
        expected.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        assert_eq!(events, expected);
        assert_eq!(store.edges("s1").unwrap(), vec![(child.id, root.id)]);
    }

    #[test]
    fn ordering_breaks_timestamp_ties_on_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_scan(&scan_record("s1")).unwrap();
        let factory = EventFactory::new("s1", Arc::new(EventCatalog::seed()));
        let root = factory.root("example.com");
        store.append_event(&root).unwrap();
        // Pin every event to one timestamp so only the id can order them.
        let mut pinned = Vec::new();
        for i in 0..6 {
            let mut e = factory
                .make("ERROR_MESSAGE", &format!("failure {i}"), "m1", &root)
                .unwrap();
            e.created_at = 1_000;
            store.append_event(&e).unwrap();
            pinned.push(e);
        }
        pinned.sort_by(|a, b| a.id.cmp(&b.id));

        let read = store
            .events("s1", &EventFilter::by_type("ERROR_MESSAGE"))
            .unwrap();
        assert_eq!(read, pinned);
    }

    #[test]
    fn duplicate_append_leaves_single_row() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_scan(&scan_record("s1")).unwrap();
        let factory = EventFactory::new("s1", Arc::new(EventCatalog::seed()));
        let root = factory.root("example.com");
        store.append_event(&root).unwrap();
        let a = factory.make("ERROR_MESSAGE", "boom", "m1", &root).unwrap();
        // Same payload under a different parent: distinct id, same hash.
        let b = factory.make("ERROR_MESSAGE", "boom", "m2", &a).unwrap();

        assert_eq!(store.append_event(&a).unwrap(), AppendOutcome::Inserted);
        assert_eq!(
            store.append_event(&b).unwrap(),
            AppendOutcome::Duplicate {
                existing_id: a.id.clone()
            }
        );
        assert_eq!(store.event_count("s1").unwrap(), 2);
    }

    #[test]
    fn status_updates_and_counts() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_scan(&scan_record("s1")).unwrap();
        store
            .set_status("s1", ScanStatus::Running, None)
            .unwrap();
        store
            .set_status("s1", ScanStatus::Finished, Some(42))
            .unwrap();
        let scan = store.get_scan("s1").unwrap().unwrap();
        assert_eq!(scan.status, ScanStatus::Finished);
        assert_eq!(scan.ended_at, Some(42));
        assert!(matches!(
            store.set_status("nope", ScanStatus::Running, None),
            Err(EngineError::UnknownScan(_))
        ));
    }

    #[test]
    fn resolution_cache_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.create_scan(&scan_record("s1")).unwrap();
        assert_eq!(store.get_resolution("s1", "www.example.com").unwrap(), None);
        let addrs = vec!["192.0.2.1".to_string(), "192.0.2.2".to_string()];
        store.put_resolution("s1", "www.example.com", &addrs).unwrap();
        assert_eq!(
            store.get_resolution("s1", "www.example.com").unwrap(),
            Some(addrs)
        );
    }
}
