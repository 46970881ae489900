use crate::calc::{format_ts, parse_ts};
use crate::pass::PassRow;
use crate::queue::QueueRow;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::path::Path;

pub const DB_FILE: &str = "hallpass.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS passes(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            student_id TEXT,
            student_name TEXT NOT NULL,
            destination TEXT,
            time_out TEXT NOT NULL,
            time_in TEXT,
            is_tablet_user INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_passes_teacher ON passes(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_passes_teacher_time_out ON passes(teacher_id, time_out)",
        [],
    )?;

    // Existing workspaces may predate tablet submissions. Add if needed.
    ensure_passes_is_tablet_user(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS queue(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            student_id TEXT,
            student_name TEXT NOT NULL,
            destination TEXT NOT NULL,
            position INTEGER NOT NULL,
            time_joined TEXT NOT NULL
        )",
        [],
    )?;
    // Positions are unique by construction (assigned inside the INSERT); a
    // UNIQUE index would make the one-statement gap closure order-dependent.
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_queue_teacher_position ON queue(teacher_id, position)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            class_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_teacher ON classes(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_schedule(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            day TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_class_schedule_teacher_day ON class_schedule(teacher_id, day)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS clos(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            class_id TEXT,
            clo_text TEXT NOT NULL,
            is_out_of_class INTEGER NOT NULL DEFAULT 0,
            start_date TEXT,
            end_date TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_clos_date_window(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_clos_teacher ON clos(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    // Durable change feed: appended in the same transaction as every pass or
    // queue mutation, polled by clients as the notification stream.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS changes(
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            teacher_id TEXT NOT NULL,
            tbl TEXT NOT NULL,
            op TEXT NOT NULL,
            row_id TEXT NOT NULL,
            at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_changes_teacher_seq ON changes(teacher_id, seq)",
        [],
    )?;

    Ok(conn)
}

fn ensure_passes_is_tablet_user(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "passes", "is_tablet_user")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE passes ADD COLUMN is_tablet_user INTEGER NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

fn ensure_clos_date_window(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "clos", "start_date")? {
        conn.execute("ALTER TABLE clos ADD COLUMN start_date TEXT", [])?;
    }
    if !table_has_column(conn, "clos", "end_date")? {
        conn.execute("ALTER TABLE clos ADD COLUMN end_date TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// --- settings ---

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(text) => Ok(Some(serde_json::from_str(&text)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

// --- pass rows ---

fn bad_ts(idx: usize) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        "invalid timestamp".into(),
    )
}

fn row_to_pass(r: &rusqlite::Row) -> rusqlite::Result<PassRow> {
    let time_out: String = r.get(5)?;
    let time_in: Option<String> = r.get(6)?;
    let created_at: String = r.get(8)?;
    Ok(PassRow {
        id: r.get(0)?,
        teacher_id: r.get(1)?,
        student_id: r.get(2)?,
        student_name: r.get(3)?,
        destination: r.get(4)?,
        time_out: parse_ts(&time_out).ok_or_else(|| bad_ts(5))?,
        time_in: match time_in {
            Some(t) => Some(parse_ts(&t).ok_or_else(|| bad_ts(6))?),
            None => None,
        },
        is_tablet_user: r.get::<_, i64>(7)? != 0,
        created_at: parse_ts(&created_at).ok_or_else(|| bad_ts(8))?,
    })
}

const PASS_COLUMNS: &str =
    "id, teacher_id, student_id, student_name, destination, time_out, time_in, is_tablet_user, created_at";

pub fn list_passes(conn: &Connection, teacher_id: &str) -> rusqlite::Result<Vec<PassRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM passes WHERE teacher_id = ? ORDER BY time_out, id",
        PASS_COLUMNS
    ))?;
    let rows = stmt.query_map([teacher_id], |r| row_to_pass(r))?;
    rows.collect()
}

pub fn get_pass(conn: &Connection, pass_id: &str) -> rusqlite::Result<Option<PassRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM passes WHERE id = ?", PASS_COLUMNS))?;
    stmt.query_row([pass_id], |r| row_to_pass(r)).optional()
}

pub fn insert_pass(conn: &Connection, pass: &PassRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO passes(id, teacher_id, student_id, student_name, destination,
                            time_out, time_in, is_tablet_user, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &pass.id,
            &pass.teacher_id,
            &pass.student_id,
            &pass.student_name,
            &pass.destination,
            format_ts(pass.time_out),
            pass.time_in.map(format_ts),
            pass.is_tablet_user as i64,
            format_ts(pass.created_at),
        ),
    )?;
    Ok(())
}

pub fn update_pass(conn: &Connection, pass: &PassRow) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE passes SET student_id = ?, student_name = ?, destination = ?,
                           time_out = ?, time_in = ?, is_tablet_user = ?
         WHERE id = ?",
        (
            &pass.student_id,
            &pass.student_name,
            &pass.destination,
            format_ts(pass.time_out),
            pass.time_in.map(format_ts),
            pass.is_tablet_user as i64,
            &pass.id,
        ),
    )
}

pub fn delete_pass(conn: &Connection, pass_id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM passes WHERE id = ?", [pass_id])
}

// --- queue rows ---

fn row_to_queue_entry(r: &rusqlite::Row) -> rusqlite::Result<QueueRow> {
    let time_joined: String = r.get(6)?;
    Ok(QueueRow {
        id: r.get(0)?,
        teacher_id: r.get(1)?,
        student_id: r.get(2)?,
        student_name: r.get(3)?,
        destination: r.get(4)?,
        position: r.get(5)?,
        time_joined: parse_ts(&time_joined).ok_or_else(|| bad_ts(6))?,
    })
}

const QUEUE_COLUMNS: &str =
    "id, teacher_id, student_id, student_name, destination, position, time_joined";

pub fn list_queue(conn: &Connection, teacher_id: &str) -> rusqlite::Result<Vec<QueueRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM queue WHERE teacher_id = ? ORDER BY position",
        QUEUE_COLUMNS
    ))?;
    let rows = stmt.query_map([teacher_id], |r| row_to_queue_entry(r))?;
    rows.collect()
}

pub fn get_queue_entry(conn: &Connection, entry_id: &str) -> rusqlite::Result<Option<QueueRow>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM queue WHERE id = ?", QUEUE_COLUMNS))?;
    stmt.query_row([entry_id], |r| row_to_queue_entry(r))
        .optional()
}

/// Appends at the line's tail. The position is assigned inside the INSERT
/// (max + 1 scoped to the teacher) so a concurrent client sharing the workspace
/// can never mint the same position. Returns the assigned position.
pub fn append_queue_entry(
    conn: &Connection,
    id: &str,
    teacher_id: &str,
    student_id: Option<&str>,
    student_name: &str,
    destination: &str,
    time_joined: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO queue(id, teacher_id, student_id, student_name, destination, position, time_joined)
         SELECT ?1, ?2, ?3, ?4, ?5, COALESCE(MAX(position), 0) + 1, ?6
         FROM queue WHERE teacher_id = ?2",
        (
            id,
            teacher_id,
            student_id,
            student_name,
            destination,
            format_ts(time_joined),
        ),
    )?;
    conn.query_row("SELECT position FROM queue WHERE id = ?", [id], |r| {
        r.get(0)
    })
}

pub fn delete_queue_entry(conn: &Connection, entry_id: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM queue WHERE id = ?", [entry_id])
}

/// Decrements every position after a removed slot, restoring 1..=N. Runs as a
/// single statement; callers wrap it in the same transaction as the delete.
pub fn close_queue_gap(
    conn: &Connection,
    teacher_id: &str,
    removed_position: i64,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE queue SET position = position - 1 WHERE teacher_id = ? AND position > ?",
        (teacher_id, removed_position),
    )
}

// --- change feed ---

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeEvent {
    pub seq: i64,
    #[serde(rename = "table")]
    pub tbl: String,
    pub op: String,
    #[serde(rename = "rowId")]
    pub row_id: String,
    pub at: String,
}

/// Appends one event to the change feed and returns its sequence number.
/// Must run inside the same transaction as the mutation it describes.
pub fn record_change(
    conn: &Connection,
    teacher_id: &str,
    tbl: &str,
    op: &str,
    row_id: &str,
    at: DateTime<Utc>,
) -> rusqlite::Result<i64> {
    conn.execute(
        "INSERT INTO changes(teacher_id, tbl, op, row_id, at) VALUES(?, ?, ?, ?, ?)",
        (teacher_id, tbl, op, row_id, format_ts(at)),
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn latest_seq(conn: &Connection, teacher_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) FROM changes WHERE teacher_id = ?",
        [teacher_id],
        |r| r.get(0),
    )
}

pub fn changes_since(
    conn: &Connection,
    teacher_id: &str,
    since_seq: i64,
) -> rusqlite::Result<Vec<ChangeEvent>> {
    let mut stmt = conn.prepare(
        "SELECT seq, tbl, op, row_id, at FROM changes
         WHERE teacher_id = ? AND seq > ? ORDER BY seq",
    )?;
    let rows = stmt.query_map((teacher_id, since_seq), |r| {
        Ok(ChangeEvent {
            seq: r.get(0)?,
            tbl: r.get(1)?,
            op: r.get(2)?,
            row_id: r.get(3)?,
            at: r.get(4)?,
        })
    })?;
    rows.collect()
}
