//! Derived store: `conversations`, `turns`, and `session_aggregates`
//! tables in the same physical database as the raw store. The only writer
//! is the slow-path worker pool (see [`crate::workers`]); readers are the
//! read-only query surface.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::EngineError;
use crate::schema::Platform;

/// Creates the `conversations`, `turns`, and `session_aggregates` tables
/// plus their indexes if they don't already exist. Safe to call alongside
/// [`crate::raw_store::init_schema`] on the same connection or a second
/// connection to the same file.
pub fn init_schema(conn: &Connection) -> Result<(), EngineError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            session_id TEXT PRIMARY KEY,
            platform TEXT NOT NULL,
            workspace_hash TEXT,
            started_at TEXT NOT NULL,
            last_activity_at TEXT NOT NULL,
            turn_count INTEGER NOT NULL DEFAULT 0,
            user_message_count INTEGER NOT NULL DEFAULT 0,
            assistant_message_count INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            tool_invocations_count INTEGER NOT NULL DEFAULT 0,
            last_processed_row_id INTEGER NOT NULL DEFAULT 0
         );
         CREATE INDEX IF NOT EXISTS idx_conversations_recency
             ON conversations(platform, last_activity_at);

         CREATE TABLE IF NOT EXISTS turns (
            session_id TEXT NOT NULL,
            turn_index INTEGER NOT NULL,
            role TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            length_chars INTEGER NOT NULL DEFAULT 0,
            tokens_in INTEGER NOT NULL DEFAULT 0,
            tokens_out INTEGER NOT NULL DEFAULT 0,
            tool_name TEXT,
            PRIMARY KEY (session_id, turn_index)
         );
         CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id);

         CREATE TABLE IF NOT EXISTS session_aggregates (
            session_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (session_id, key)
         );",
    )?;
    Ok(())
}

/// In-memory projection of a `conversations` row, used both as the
/// persisted record and as the prior-state input to per-event derivation —
/// derivation is a pure function of (prior session state, new event).
#[derive(Debug, Clone)]
pub struct Conversation {
    pub session_id: String,
    pub platform: Platform,
    pub workspace_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub turn_count: i64,
    pub user_message_count: i64,
    pub assistant_message_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub tool_invocations_count: i64,
    pub last_processed_row_id: i64,
}

impl Conversation {
    fn new(session_id: &str, platform: Platform, workspace_hash: Option<String>, at: DateTime<Utc>) -> Self {
        Conversation {
            session_id: session_id.to_string(),
            platform,
            workspace_hash,
            started_at: at,
            last_activity_at: at,
            turn_count: 0,
            user_message_count: 0,
            assistant_message_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            tool_invocations_count: 0,
            last_processed_row_id: 0,
        }
    }
}

/// Fetches the current conversation row for a session, if one exists.
pub fn get_conversation(conn: &Connection, session_id: &str) -> Result<Option<Conversation>, EngineError> {
    conn.query_row(
        "SELECT session_id, platform, workspace_hash, started_at, last_activity_at,
                turn_count, user_message_count, assistant_message_count,
                input_tokens, output_tokens, tool_invocations_count, last_processed_row_id
         FROM conversations WHERE session_id = ?1",
        params![session_id],
        row_to_conversation,
    )
    .optional()
    .map_err(EngineError::from)
}

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    let platform_str: String = row.get(1)?;
    Ok(Conversation {
        session_id: row.get(0)?,
        platform: parse_platform(&platform_str),
        workspace_hash: row.get(2)?,
        started_at: parse_ts(row.get::<_, String>(3)?),
        last_activity_at: parse_ts(row.get::<_, String>(4)?),
        turn_count: row.get(5)?,
        user_message_count: row.get(6)?,
        assistant_message_count: row.get(7)?,
        input_tokens: row.get(8)?,
        output_tokens: row.get(9)?,
        tool_invocations_count: row.get(10)?,
        last_processed_row_id: row.get(11)?,
    })
}

fn parse_platform(s: &str) -> Platform {
    match s {
        "claude" => Platform::Claude,
        "cursor" => Platform::Cursor,
        "windsurf" => Platform::Windsurf,
        _ => Platform::Other,
    }
}

fn parse_ts(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// A single derived turn, persisted losslessly as shape only — no message
/// text is ever stored.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub session_id: String,
    pub turn_index: i64,
    pub role: String,
    pub timestamp: DateTime<Utc>,
    pub length_chars: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub tool_name: Option<String>,
}

fn insert_turn_tx(tx: &rusqlite::Transaction, turn: &Turn) -> Result<(), EngineError> {
    tx.execute(
        "INSERT OR REPLACE INTO turns
            (session_id, turn_index, role, timestamp, length_chars, tokens_in, tokens_out, tool_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            turn.session_id,
            turn.turn_index,
            turn.role,
            turn.timestamp.to_rfc3339(),
            turn.length_chars,
            turn.tokens_in,
            turn.tokens_out,
            turn.tool_name,
        ],
    )?;
    Ok(())
}

/// Most recent turns for a session, oldest first, capped at `limit`.
pub fn list_turns(conn: &Connection, session_id: &str, limit: usize) -> Result<Vec<Turn>, EngineError> {
    let mut stmt = conn.prepare(
        "SELECT session_id, turn_index, role, timestamp, length_chars, tokens_in, tokens_out, tool_name
         FROM turns WHERE session_id = ?1 ORDER BY turn_index DESC LIMIT ?2",
    )?;
    let mut rows = stmt
        .query_map(params![session_id, limit as i64], row_to_turn)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.reverse();
    Ok(rows)
}

fn row_to_turn(row: &rusqlite::Row) -> rusqlite::Result<Turn> {
    Ok(Turn {
        session_id: row.get(0)?,
        turn_index: row.get(1)?,
        role: row.get(2)?,
        timestamp: parse_ts(row.get::<_, String>(3)?),
        length_chars: row.get(4)?,
        tokens_in: row.get(5)?,
        tokens_out: row.get(6)?,
        tool_name: row.get(7)?,
    })
}

/// Deltas one derivation step applies to the running conversation counters.
/// Kept as a plain struct so [`crate::workers`] can compute it as a pure
/// function before touching the store.
#[derive(Debug, Clone, Default)]
pub struct ConversationDelta {
    pub role: String,
    pub timestamp: DateTime<Utc>,
    pub length_chars: i64,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub tool_name: Option<String>,
    pub is_user_message: bool,
    pub is_assistant_message: bool,
    pub is_tool_invocation: bool,
}

/// Applies one CDC-driven update within a transaction: creates the
/// conversation row on first sight of a session, advances its counters by
/// `delta`, appends the corresponding turn, and stamps
/// `last_processed_row_id`. The idempotence check
/// (`raw_row_id > last_processed_row_id`) is the caller's responsibility
/// since it must happen before the blob is even decompressed; this
/// function assumes that check already passed.
pub fn apply_delta(
    conn: &mut Connection,
    session_id: &str,
    platform: Platform,
    workspace_hash: Option<String>,
    raw_row_id: i64,
    delta: &ConversationDelta,
) -> Result<Conversation, EngineError> {
    let tx = conn.transaction()?;

    let mut conversation = get_conversation_tx(&tx, session_id)?
        .unwrap_or_else(|| Conversation::new(session_id, platform, workspace_hash.clone(), delta.timestamp));

    conversation.last_activity_at = delta.timestamp;
    conversation.turn_count += 1;
    conversation.user_message_count += delta.is_user_message as i64;
    conversation.assistant_message_count += delta.is_assistant_message as i64;
    conversation.input_tokens += delta.tokens_in;
    conversation.output_tokens += delta.tokens_out;
    conversation.tool_invocations_count += delta.is_tool_invocation as i64;
    conversation.last_processed_row_id = conversation.last_processed_row_id.max(raw_row_id);
    if conversation.workspace_hash.is_none() {
        conversation.workspace_hash = workspace_hash;
    }

    tx.execute(
        "INSERT INTO conversations
            (session_id, platform, workspace_hash, started_at, last_activity_at,
             turn_count, user_message_count, assistant_message_count,
             input_tokens, output_tokens, tool_invocations_count, last_processed_row_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(session_id) DO UPDATE SET
            workspace_hash = excluded.workspace_hash,
            last_activity_at = excluded.last_activity_at,
            turn_count = excluded.turn_count,
            user_message_count = excluded.user_message_count,
            assistant_message_count = excluded.assistant_message_count,
            input_tokens = excluded.input_tokens,
            output_tokens = excluded.output_tokens,
            tool_invocations_count = excluded.tool_invocations_count,
            last_processed_row_id = excluded.last_processed_row_id",
        params![
            conversation.session_id,
            conversation.platform.table_fragment(),
            conversation.workspace_hash,
            conversation.started_at.to_rfc3339(),
            conversation.last_activity_at.to_rfc3339(),
            conversation.turn_count,
            conversation.user_message_count,
            conversation.assistant_message_count,
            conversation.input_tokens,
            conversation.output_tokens,
            conversation.tool_invocations_count,
            conversation.last_processed_row_id,
        ],
    )?;

    let turn = Turn {
        session_id: session_id.to_string(),
        turn_index: conversation.turn_count - 1,
        role: delta.role.clone(),
        timestamp: delta.timestamp,
        length_chars: delta.length_chars,
        tokens_in: delta.tokens_in,
        tokens_out: delta.tokens_out,
        tool_name: delta.tool_name.clone(),
    };
    insert_turn_tx(&tx, &turn)?;

    tx.commit()?;
    Ok(conversation)
}

fn get_conversation_tx(
    tx: &rusqlite::Transaction,
    session_id: &str,
) -> Result<Option<Conversation>, EngineError> {
    tx.query_row(
        "SELECT session_id, platform, workspace_hash, started_at, last_activity_at,
                turn_count, user_message_count, assistant_message_count,
                input_tokens, output_tokens, tool_invocations_count, last_processed_row_id
         FROM conversations WHERE session_id = ?1",
        params![session_id],
        row_to_conversation,
    )
    .optional()
    .map_err(EngineError::from)
}

/// Accumulates a named per-session aggregate (e.g. `tool:Read`,
/// `prompt_length_bucket:0_50`) by adding `delta` to its current value.
/// A breakdown-map style persisted per row instead of kept in memory.
pub fn accumulate_aggregate(
    conn: &Connection,
    session_id: &str,
    key: &str,
    delta: f64,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO session_aggregates (session_id, key, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(session_id, key) DO UPDATE SET value = value + excluded.value",
        params![session_id, key, delta],
    )?;
    Ok(())
}

pub fn get_session_aggregates(conn: &Connection, session_id: &str) -> Result<Vec<(String, f64)>, EngineError> {
    let mut stmt = conn.prepare("SELECT key, value FROM session_aggregates WHERE session_id = ?1")?;
    let rows = stmt
        .query_map(params![session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lists sessions most-recently-active first, optionally filtered by
/// platform.
pub fn list_sessions(
    conn: &Connection,
    platform: Option<Platform>,
    limit: usize,
) -> Result<Vec<Conversation>, EngineError> {
    let mut stmt = match platform {
        Some(_) => conn.prepare(
            "SELECT session_id, platform, workspace_hash, started_at, last_activity_at,
                    turn_count, user_message_count, assistant_message_count,
                    input_tokens, output_tokens, tool_invocations_count, last_processed_row_id
             FROM conversations WHERE platform = ?1 ORDER BY last_activity_at DESC LIMIT ?2",
        )?,
        None => conn.prepare(
            "SELECT session_id, platform, workspace_hash, started_at, last_activity_at,
                    turn_count, user_message_count, assistant_message_count,
                    input_tokens, output_tokens, tool_invocations_count, last_processed_row_id
             FROM conversations ORDER BY last_activity_at DESC LIMIT ?1",
        )?,
    };
    let rows = match platform {
        Some(p) => stmt
            .query_map(params![p.table_fragment(), limit as i64], row_to_conversation)?
            .collect::<Result<Vec<_>, _>>()?,
        None => stmt
            .query_map(params![limit as i64], row_to_conversation)?
            .collect::<Result<Vec<_>, _>>()?,
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn memory_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn user_delta(at: DateTime<Utc>, length_chars: i64) -> ConversationDelta {
        ConversationDelta {
            role: "user".to_string(),
            timestamp: at,
            length_chars,
            tokens_in: 0,
            tokens_out: 0,
            tool_name: None,
            is_user_message: true,
            is_assistant_message: false,
            is_tool_invocation: false,
        }
    }

    #[test]
    fn apply_delta_creates_conversation_on_first_event() {
        let mut conn = memory_conn();
        let delta = user_delta(Utc::now(), 42);
        let conversation = apply_delta(&mut conn, "sess-1", Platform::Claude, None, 1, &delta).unwrap();
        assert_eq!(conversation.user_message_count, 1);
        assert_eq!(conversation.turn_count, 1);
        assert_eq!(conversation.last_processed_row_id, 1);
    }

    #[test]
    fn apply_delta_accumulates_counters_across_events() {
        let mut conn = memory_conn();
        apply_delta(&mut conn, "sess-1", Platform::Claude, None, 1, &user_delta(Utc::now(), 10)).unwrap();
        let conversation =
            apply_delta(&mut conn, "sess-1", Platform::Claude, None, 2, &user_delta(Utc::now(), 20)).unwrap();
        assert_eq!(conversation.user_message_count, 2);
        assert_eq!(conversation.turn_count, 2);
        assert_eq!(conversation.last_processed_row_id, 2);
    }

    #[test]
    fn apply_delta_persists_turns_in_order() {
        let mut conn = memory_conn();
        apply_delta(&mut conn, "sess-1", Platform::Claude, None, 1, &user_delta(Utc::now(), 10)).unwrap();
        apply_delta(&mut conn, "sess-1", Platform::Claude, None, 2, &user_delta(Utc::now(), 20)).unwrap();

        let turns = list_turns(&conn, "sess-1", 50).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].turn_index, 0);
        assert_eq!(turns[0].length_chars, 10);
        assert_eq!(turns[1].turn_index, 1);
        assert_eq!(turns[1].length_chars, 20);
    }

    #[test]
    fn accumulate_aggregate_sums_repeated_keys() {
        let conn = memory_conn();
        accumulate_aggregate(&conn, "sess-1", "tool:Read", 1.0).unwrap();
        accumulate_aggregate(&conn, "sess-1", "tool:Read", 1.0).unwrap();
        let aggregates = get_session_aggregates(&conn, "sess-1").unwrap();
        assert_eq!(aggregates, vec![("tool:Read".to_string(), 2.0)]);
    }

    #[test]
    fn list_sessions_orders_by_recency() {
        let mut conn = memory_conn();
        apply_delta(
            &mut conn,
            "older",
            Platform::Claude,
            None,
            1,
            &user_delta(Utc::now() - chrono::Duration::hours(1), 1),
        )
        .unwrap();
        apply_delta(&mut conn, "newer", Platform::Claude, None, 2, &user_delta(Utc::now(), 1)).unwrap();
        let sessions = list_sessions(&conn, None, 10).unwrap();
        assert_eq!(sessions[0].session_id, "newer");
        assert_eq!(sessions[1].session_id, "older");
    }
}
