//! Raw store: a single on-disk SQLite database in WAL mode, one table
//! per capture platform, with a `schema_version` migration style.

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::EngineError;
use crate::schema::{Event, Platform};

/// Read-only connection pool for the HTTP query surface. The raw store
/// has exactly one writer (the fast-path ingest thread) but unbounded
/// readers; pooling avoids paying `Connection::open` plus pragma setup on
/// every request.
#[derive(Clone)]
pub struct ReadPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReadPool {
    pub fn open(path: &Path) -> Result<ReadPool, EngineError> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "busy_timeout", 5000)?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(|e| EngineError::TransientIO(e.to_string()))?;
        Ok(ReadPool { pool })
    }

    pub fn get(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>, EngineError> {
        self.pool.get().map_err(|e| EngineError::TransientIO(e.to_string()))
    }
}

const ALL_PLATFORMS: [Platform; 4] = [
    Platform::Claude,
    Platform::Cursor,
    Platform::Windsurf,
    Platform::Other,
];

/// Opens the database file and applies pragmas. Call [`init_schema`] once
/// per process on the connection that owns writes.
pub fn open(path: &Path) -> Result<Connection, EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "cache_size", -64_000)?;
    Ok(conn)
}

fn table_name(platform: Platform) -> String {
    format!("{}_raw_traces", platform.table_fragment())
}

/// Creates the `schema_version` metadata table and the per-platform raw
/// trace tables if they don't already exist.
pub fn init_schema(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_metadata WHERE key = 'raw_store_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if version.is_none() {
        apply_schema_v1(conn)?;
        conn.execute(
            "INSERT INTO schema_metadata(key, value) VALUES ('raw_store_version', '1')",
            [],
        )?;
    }
    Ok(())
}

fn apply_schema_v1(conn: &Connection) -> Result<(), EngineError> {
    for platform in ALL_PLATFORMS {
        let table = table_name(platform);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                row_id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                workspace_hash TEXT,
                event_type TEXT NOT NULL,
                item_key TEXT,
                timestamp TEXT NOT NULL,
                event_data BLOB NOT NULL,
                byte_size INTEGER NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_{table}_event_id ON {table}(event_id);
            CREATE INDEX IF NOT EXISTS idx_{table}_session_id ON {table}(session_id);",
        ))?;
    }
    Ok(())
}

/// Outcome of inserting one event: either a fresh row or the row that
/// already existed for this `event_id` — duplicates still resolve to a
/// `row_id` so a CDC record can be emitted.
#[derive(Debug, Clone, Copy)]
pub enum InsertOutcome {
    Inserted { row_id: i64 },
    Duplicate { row_id: i64 },
}

impl InsertOutcome {
    pub fn row_id(self) -> i64 {
        match self {
            InsertOutcome::Inserted { row_id } | InsertOutcome::Duplicate { row_id } => row_id,
        }
    }
}

/// Inserts a batch of already-validated, already-compressed events within a
/// single transaction via `INSERT OR IGNORE`, absorbing at-least-once
/// redelivery. Best-effort: a failure inserting one row is recorded and
/// skipped rather than aborting the whole batch, except that I/O-level
/// transaction failures (unable to begin/commit) propagate — those
/// indicate the store itself is unreachable, which is `TransientIO`, not a
/// per-row problem.
pub fn insert_batch(
    conn: &mut Connection,
    items: &[(Event, Vec<u8>)],
) -> Result<(Vec<InsertOutcome>, Vec<(String, String)>), EngineError> {
    let tx = conn.transaction()?;
    let mut outcomes = Vec::with_capacity(items.len());
    let mut failures = Vec::new();
    for (event, blob) in items {
        match insert_one(&tx, event, blob) {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => failures.push((event.event_id.clone(), e.to_string())),
        }
    }
    tx.commit()?;
    Ok((outcomes, failures))
}

fn insert_one(
    tx: &rusqlite::Transaction,
    event: &Event,
    blob: &[u8],
) -> Result<InsertOutcome, EngineError> {
    let table = table_name(event.platform);
    let changed = tx.execute(
        &format!(
            "INSERT OR IGNORE INTO {table}
                (event_id, session_id, workspace_hash, event_type, item_key, timestamp, event_data, byte_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ),
        params![
            event.event_id,
            event.session_id(),
            event.workspace_hash(),
            event.event_type,
            event.item_key(),
            event.timestamp.to_rfc3339(),
            blob,
            blob.len() as i64,
        ],
    )?;
    if changed > 0 {
        Ok(InsertOutcome::Inserted {
            row_id: tx.last_insert_rowid(),
        })
    } else {
        let row_id: i64 = tx.query_row(
            &format!("SELECT row_id FROM {table} WHERE event_id = ?1"),
            params![event.event_id],
            |row| row.get(0),
        )?;
        Ok(InsertOutcome::Duplicate { row_id })
    }
}

/// Fetches the compressed blob for a committed row, used by the slow-path
/// workers to reconstruct the original event.
pub fn get_blob(conn: &Connection, platform: Platform, row_id: i64) -> Result<Option<Vec<u8>>, EngineError> {
    let table = table_name(platform);
    let blob: Option<Vec<u8>> = conn
        .query_row(
            &format!("SELECT event_data FROM {table} WHERE row_id = ?1"),
            params![row_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(blob)
}

pub fn row_count(conn: &Connection, platform: Platform) -> Result<i64, EngineError> {
    let table = table_name(platform);
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Platform;
    use chrono::Utc;

    fn sample_event(event_id: &str) -> Event {
        Event {
            event_id: event_id.to_string(),
            enqueued_at: Utc::now(),
            retry_count: 0,
            platform: Platform::Claude,
            external_session_id: "sess-1".to_string(),
            hook_type: "user_prompt_submit".to_string(),
            event_type: "user_prompt_submit".to_string(),
            timestamp: Utc::now(),
            payload: serde_json::json!({"prompt_length": 42}),
            metadata: serde_json::json!({}),
        }
    }

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn insert_batch_assigns_row_ids() {
        let mut conn = memory_conn();
        let event = sample_event("e1");
        let blob = event.encode().unwrap();
        let (outcomes, failures) = insert_batch(&mut conn, &[(event, blob)]).unwrap();
        assert!(failures.is_empty());
        assert!(matches!(outcomes[0], InsertOutcome::Inserted { .. }));
    }

    #[test]
    fn duplicate_event_id_resolves_to_same_row() {
        let mut conn = memory_conn();
        let event = sample_event("e1");
        let blob = event.encode().unwrap();
        let (first, _) = insert_batch(&mut conn, &[(event.clone(), blob.clone())]).unwrap();
        let (second, _) = insert_batch(&mut conn, &[(event, blob)]).unwrap();
        assert_eq!(first[0].row_id(), second[0].row_id());
        assert!(matches!(second[0], InsertOutcome::Duplicate { .. }));
        assert_eq!(row_count(&conn, Platform::Claude).unwrap(), 1);
    }

    #[test]
    fn get_blob_round_trips_through_decode() {
        let mut conn = memory_conn();
        let event = sample_event("e1");
        let blob = event.encode().unwrap();
        let (outcomes, _) = insert_batch(&mut conn, &[(event.clone(), blob)]).unwrap();
        let stored = get_blob(&conn, Platform::Claude, outcomes[0].row_id())
            .unwrap()
            .unwrap();
        let decoded = Event::decode(&stored).unwrap();
        assert_eq!(decoded.event_id, event.event_id);
    }
}
