use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::event::Event;
use crate::filter::{compile, Filter, FilterDescriptor, Order};
use crate::store::{EventIter, EventStore};

/// Rows fetched per page. A page boundary is this backend's analogue of
/// the file backend's bucket boundary: the point `cancelled` is checked
/// and the point a scan can actually stop short of the full result set.
const PAGE_SIZE: i64 = 256;

/// Relational backend (spec §4.3): one `events` table, queried through a
/// synchronous driver so `EventStore` stays fully synchronous and can be
/// driven through `spawn_blocking` the same way as `FileStore`.
///
/// Beyond the five columns spec.md names for the table (`id`, `timestamp`,
/// `source`, `tags`, `content`), an `extras` column (JSON-encoded header
/// map) is carried so round-tripping an event with extra headers through
/// this backend holds, the same as it does for the file backend — see
/// DESIGN.md.
pub struct RelationalStore {
    conn: Arc<Mutex<Connection>>,
}

impl RelationalStore {
    pub fn open(database_url: &str) -> Result<Self> {
        let conn = if database_url == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(database_url)?
        };

        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                timestamp DOUBLE NOT NULL,
                source TEXT NOT NULL,
                tags TEXT NOT NULL,
                content TEXT NOT NULL,
                extras TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    fn row_to_event(
        id: String,
        timestamp: f64,
        source: String,
        tags: String,
        content: Vec<u8>,
        extras: String,
    ) -> Event {
        let tags = tags.split(',').filter(|s| !s.is_empty()).map(String::from).collect();
        let extras: Vec<(String, String)> = serde_json::from_str(&extras).unwrap_or_default();
        Event { id, timestamp, source, tags, extras, content }
    }
}

impl EventStore for RelationalStore {
    fn save(&self, event: &Event) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let extras_json = serde_json::to_string(&event.extras)?;
        // Duplicate id on ingest is a silent no-op (idempotent ingest).
        conn.execute(
            "INSERT OR IGNORE INTO events (id, timestamp, source, tags, content, extras)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                event.id,
                event.timestamp,
                event.source,
                event.tags.join(","),
                String::from_utf8_lossy(&event.content).into_owned(),
                extras_json,
            ],
        )?;
        Ok(())
    }

    fn search(&self, filter: &FilterDescriptor, cancelled: Arc<AtomicBool>) -> Result<EventIter> {
        let compiled = compile(filter)?;

        let order_clause = match compiled.order() {
            Order::Asc => "ASC",
            Order::Desc => "DESC",
        };

        let sql = format!(
            "SELECT id, timestamp, source, tags, content, extras FROM events
             WHERE timestamp BETWEEN ?1 AND ?2
             ORDER BY timestamp {order_clause}
             LIMIT ?3 OFFSET ?4"
        );
        let lo = filter.start.map(|v| v as f64).unwrap_or(f64::NEG_INFINITY);
        let hi = filter.end.map(|v| v as f64).unwrap_or(f64::INFINITY);

        Ok(Box::new(RelationalSearchIter {
            conn: Arc::clone(&self.conn),
            sql,
            lo,
            hi,
            filter: compiled,
            cancelled,
            offset: 0,
            exhausted: false,
            buffer: VecDeque::new(),
        }))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Incremental, paginated `/find` scan. Each page is a fresh `LIMIT`/
/// `OFFSET` query rather than one driver-held cursor over the full result,
/// so `cancelled` only needs to be observed between pages (spec §5,
/// extended here from the file backend's per-bucket language to a
/// per-page analogue — see DESIGN.md) and an abandoned scan never holds
/// the connection mutex longer than one page's worth of work.
struct RelationalSearchIter {
    conn: Arc<Mutex<Connection>>,
    sql: String,
    lo: f64,
    hi: f64,
    filter: Filter,
    cancelled: Arc<AtomicBool>,
    offset: i64,
    exhausted: bool,
    buffer: VecDeque<Event>,
}

impl RelationalSearchIter {
    fn load_next_page(&mut self) -> Result<bool> {
        if self.exhausted || self.cancelled.load(Ordering::Relaxed) {
            self.exhausted = true;
            return Ok(false);
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&self.sql)?;
        let rows = stmt.query_map(params![self.lo, self.hi, PAGE_SIZE, self.offset], |row| {
            Ok(RelationalStore::row_to_event(
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get::<_, String>(4)?.into_bytes(),
                row.get(5)?,
            ))
        })?;

        let mut fetched = 0i64;
        for row in rows {
            let event = row?;
            fetched += 1;
            // Regex predicates are applied in-process: SQL LIKE is
            // insufficient for the filter language (spec §4.3).
            if self.filter.matches(&event) {
                self.buffer.push_back(event);
            }
        }
        self.offset += fetched;
        if fetched < PAGE_SIZE {
            self.exhausted = true;
        }
        Ok(!self.buffer.is_empty() || !self.exhausted)
    }
}

impl Iterator for RelationalSearchIter {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Some(Ok(event));
            }
            if self.exhausted {
                return None;
            }
            match self.load_next_page() {
                Ok(true) => continue,
                Ok(false) => return None,
                Err(e) => {
                    self.exhausted = true;
                    self.buffer.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}
