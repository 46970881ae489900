use crate::calc::{self, InvalidInterval};
use crate::ipc::error::err;
use crate::pass::PassRow;
use crate::queue::QueueRow;
use crate::store::TeacherStore;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn bad_params(message: impl Into<String>) -> HandlerErr {
    HandlerErr::new("bad_params", message)
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| bad_params(format!("missing {}", key)))
}

/// Absent and null both mean "not supplied"; anything else must be a string.
pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| bad_params(format!("{} must be a string", key))),
    }
}

pub fn get_opt_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| bad_params(format!("{} must be a boolean", key))),
    }
}

pub fn parse_ts_param(raw: &str, key: &str) -> Result<DateTime<Utc>, HandlerErr> {
    calc::parse_ts(raw).ok_or_else(|| bad_params(format!("{} must be an RFC 3339 timestamp", key)))
}

pub fn get_opt_ts(
    params: &serde_json::Value,
    key: &str,
) -> Result<Option<DateTime<Utc>>, HandlerErr> {
    match get_opt_str(params, key)? {
        None => Ok(None),
        Some(raw) => parse_ts_param(&raw, key).map(Some),
    }
}

pub fn interval_err(interval: &InvalidInterval) -> HandlerErr {
    HandlerErr {
        code: "invalid_interval",
        message: "time in is before time out".to_string(),
        details: Some(json!({
            "startMs": interval.start_ms,
            "endMs": interval.end_ms,
        })),
    }
}

/// Lazily opens (and caches) the reconciliation store for a teacher.
pub fn ensure_store<'a>(
    stores: &'a mut HashMap<String, TeacherStore>,
    conn: &Connection,
    teacher_id: &str,
) -> Result<&'a mut TeacherStore, HandlerErr> {
    if !stores.contains_key(teacher_id) {
        let store = TeacherStore::open(conn, teacher_id)
            .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?;
        stores.insert(teacher_id.to_string(), store);
    }
    stores
        .get_mut(teacher_id)
        .ok_or_else(|| HandlerErr::new("db_query_failed", "store unavailable"))
}

pub fn pass_to_json(pass: &PassRow, now: DateTime<Utc>) -> serde_json::Value {
    // A foreign writer can persist a reversed interval; render it as an error
    // state instead of clamping.
    let (total_time_spent, total_minutes, is_final) =
        match calc::pass_duration(pass.time_out, pass.time_in, now) {
            Ok(dur) => (
                json!(dur.compact()),
                json!(dur.total_minutes()),
                json!(dur.is_final),
            ),
            Err(_) => (json!("Invalid"), serde_json::Value::Null, json!(false)),
        };
    json!({
        "id": pass.id,
        "teacherId": pass.teacher_id,
        "studentId": pass.student_id,
        "studentName": pass.student_name,
        "destination": pass.destination,
        "timeOut": calc::format_ts(pass.time_out),
        "timeIn": pass.time_in.map(calc::format_ts),
        "isTabletUser": pass.is_tablet_user,
        "createdAt": calc::format_ts(pass.created_at),
        "totalTimeSpent": total_time_spent,
        "totalMinutes": total_minutes,
        "durationIsFinal": is_final,
    })
}

pub fn queue_entry_to_json(entry: &QueueRow, now: DateTime<Utc>) -> serde_json::Value {
    json!({
        "id": entry.id,
        "teacherId": entry.teacher_id,
        "studentId": entry.student_id,
        "studentName": entry.student_name,
        "destination": entry.destination,
        "position": entry.position,
        "timeJoined": calc::format_ts(entry.time_joined),
        "timeWaiting": calc::waiting_compact(entry.time_joined, now),
    })
}

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

pub fn parse_csv_record(line: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();
    let mut in_quotes = false;
    let chars: Vec<char> = line.chars().collect();
    let mut i = 0usize;
    while i < chars.len() {
        let ch = chars[i];
        if ch == '"' {
            if in_quotes && i + 1 < chars.len() && chars[i + 1] == '"' {
                buf.push('"');
                i += 2;
                continue;
            }
            in_quotes = !in_quotes;
            i += 1;
            continue;
        }
        if ch == ',' && !in_quotes {
            out.push(buf);
            buf = String::new();
            i += 1;
            continue;
        }
        buf.push(ch);
        i += 1;
    }
    out.push(buf);
    out
}
