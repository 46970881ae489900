use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{bad_params, get_opt_bool, get_opt_str, get_required_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];

fn parse_day(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    WEEKDAYS
        .iter()
        .find(|d| d.eq_ignore_ascii_case(t))
        .map(|d| d.to_string())
        .ok_or_else(|| bad_params("day must be a weekday name"))
}

/// Accepts HH:MM or HH:MM:SS, stored normalized as HH:MM:SS so plain string
/// comparison orders correctly.
fn parse_clock_time(raw: &str, key: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    let parts: Vec<&str> = t.split(':').collect();
    if parts.len() < 2 || parts.len() > 3 {
        return Err(bad_params(format!("{} must be HH:MM or HH:MM:SS", key)));
    }
    let hour: u32 = parts[0]
        .parse()
        .map_err(|_| bad_params(format!("{} hour must be numeric", key)))?;
    let minute: u32 = parts[1]
        .parse()
        .map_err(|_| bad_params(format!("{} minute must be numeric", key)))?;
    let second: u32 = if parts.len() == 3 {
        parts[2]
            .parse()
            .map_err(|_| bad_params(format!("{} second must be numeric", key)))?
    } else {
        0
    };
    if hour > 23 || minute > 59 || second > 59 {
        return Err(bad_params(format!("{} is out of range", key)));
    }
    Ok(format!("{:02}:{:02}:{:02}", hour, minute, second))
}

fn parse_date_param(raw: &str, key: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map(|d| d.format("%Y-%m-%d").to_string())
        .map_err(|_| bad_params(format!("{} must be YYYY-MM-DD", key)))
}

fn class_exists(conn: &Connection, teacher_id: &str, class_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM classes WHERE id = ? AND teacher_id = ?",
        (class_id, teacher_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_name = match get_required_str(&req.params, "className") {
        Ok(v) => v.trim().to_string(),
        Err(e) => return e.response(&req.id),
    };
    if class_name.is_empty() {
        return err(&req.id, "bad_params", "className must not be empty", None);
    }

    let class_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO classes(id, teacher_id, class_name) VALUES(?, ?, ?)",
        (&class_id, &teacher_id, &class_name),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "classes" })),
        );
    }
    ok(&req.id, json!({ "classId": class_id, "className": class_name }))
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, class_name FROM classes WHERE teacher_id = ? ORDER BY class_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&teacher_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            Ok(json!({ "id": id, "className": name }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(classes) => ok(&req.id, json!({ "classes": classes })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_schedule_add_slot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let parsed = (|| -> Result<(String, String, String, String, String, bool), HandlerErr> {
        let teacher_id = get_required_str(&req.params, "teacherId")?;
        let class_id = get_required_str(&req.params, "classId")?;
        let day = parse_day(&get_required_str(&req.params, "day")?)?;
        let start_time = parse_clock_time(&get_required_str(&req.params, "startTime")?, "startTime")?;
        let end_time = parse_clock_time(&get_required_str(&req.params, "endTime")?, "endTime")?;
        if end_time <= start_time {
            return Err(bad_params("endTime must be after startTime"));
        }
        let is_active = get_opt_bool(&req.params, "isActive")?.unwrap_or(true);
        Ok((teacher_id, class_id, day, start_time, end_time, is_active))
    })();
    let (teacher_id, class_id, day, start_time, end_time, is_active) = match parsed {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match class_exists(conn, &teacher_id, &class_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "class not found", None),
        Err(e) => return e.response(&req.id),
    }

    let slot_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_schedule(id, teacher_id, class_id, day, start_time, end_time, is_active)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &slot_id,
            &teacher_id,
            &class_id,
            &day,
            &start_time,
            &end_time,
            is_active as i64,
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "slotId": slot_id }))
}

fn handle_schedule_remove_slot(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let slot_id = match get_required_str(&req.params, "slotId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    match conn.execute("DELETE FROM class_schedule WHERE id = ?", [&slot_id]) {
        Ok(n) => ok(&req.id, json!({ "removed": n > 0 })),
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

fn handle_schedule_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let day = match get_opt_str(&req.params, "day") {
        Ok(Some(raw)) => match parse_day(&raw) {
            Ok(d) => Some(d),
            Err(e) => return e.response(&req.id),
        },
        Ok(None) => None,
        Err(e) => return e.response(&req.id),
    };

    let sql = "SELECT s.id, s.class_id, c.class_name, s.day, s.start_time, s.end_time, s.is_active
               FROM class_schedule s
               JOIN classes c ON c.id = s.class_id
               WHERE s.teacher_id = ?1 AND (?2 IS NULL OR s.day = ?2)
               ORDER BY s.day, s.start_time";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&teacher_id, &day), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "classId": row.get::<_, String>(1)?,
                "className": row.get::<_, String>(2)?,
                "day": row.get::<_, String>(3)?,
                "startTime": row.get::<_, String>(4)?,
                "endTime": row.get::<_, String>(5)?,
                "isActive": row.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(slots) => ok(&req.id, json!({ "slots": slots })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Sets the learning objective shown in TV mode. Class CLOs replace any prior
/// CLO for the same class; the out-of-class CLO is a singleton per teacher.
fn handle_clo_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let parsed = (|| -> Result<(String, String, Option<String>, bool, Option<String>, Option<String>), HandlerErr> {
        let teacher_id = get_required_str(&req.params, "teacherId")?;
        let clo_text = get_required_str(&req.params, "cloText")?.trim().to_string();
        if clo_text.is_empty() {
            return Err(bad_params("cloText must not be empty"));
        }
        let class_id = get_opt_str(&req.params, "classId")?;
        let is_out_of_class = get_opt_bool(&req.params, "isOutOfClass")?.unwrap_or(false);
        if is_out_of_class && class_id.is_some() {
            return Err(bad_params("an out-of-class CLO cannot name a class"));
        }
        if !is_out_of_class && class_id.is_none() {
            return Err(bad_params("a class CLO needs a classId"));
        }
        let start_date = match get_opt_str(&req.params, "startDate")? {
            Some(raw) => Some(parse_date_param(&raw, "startDate")?),
            None => None,
        };
        let end_date = match get_opt_str(&req.params, "endDate")? {
            Some(raw) => Some(parse_date_param(&raw, "endDate")?),
            None => None,
        };
        if let (Some(s), Some(e)) = (&start_date, &end_date) {
            if e < s {
                return Err(bad_params("endDate must not be before startDate"));
            }
        }
        Ok((teacher_id, clo_text, class_id, is_out_of_class, start_date, end_date))
    })();
    let (teacher_id, clo_text, class_id, is_out_of_class, start_date, end_date) = match parsed {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Some(cid) = &class_id {
        match class_exists(conn, &teacher_id, cid) {
            Ok(true) => {}
            Ok(false) => return err(&req.id, "not_found", "class not found", None),
            Err(e) => return e.response(&req.id),
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let cleared = if is_out_of_class {
        tx.execute(
            "DELETE FROM clos WHERE teacher_id = ? AND is_out_of_class = 1",
            [&teacher_id],
        )
    } else {
        tx.execute(
            "DELETE FROM clos WHERE teacher_id = ? AND class_id = ?",
            (&teacher_id, class_id.as_deref().unwrap_or("")),
        )
    };
    if let Err(e) = cleared {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let clo_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO clos(id, teacher_id, class_id, clo_text, is_out_of_class, start_date, end_date)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &clo_id,
            &teacher_id,
            &class_id,
            &clo_text,
            is_out_of_class as i64,
            &start_date,
            &end_date,
        ),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "cloId": clo_id }))
}

/// Resolves the active schedule slot, the next upcoming slot, and the CLO to
/// show: the current class's CLO inside its date window, else the teacher's
/// out-of-class CLO when no class is running.
fn handle_schedule_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let now = match get_opt_str(&req.params, "now") {
        Ok(Some(raw)) => match calc::parse_ts(&raw) {
            Some(t) => t,
            None => return err(&req.id, "bad_params", "now must be an RFC 3339 timestamp", None),
        },
        Ok(None) => Utc::now(),
        Err(e) => return e.response(&req.id),
    };
    let day_of_week = now.format("%A").to_string();
    let current_time = now.format("%H:%M:%S").to_string();
    let today = now.format("%Y-%m-%d").to_string();

    let mut stmt = match conn.prepare(
        "SELECT s.class_id, c.class_name, s.start_time, s.end_time
         FROM class_schedule s
         JOIN classes c ON c.id = s.class_id
         WHERE s.teacher_id = ? AND s.day = ? AND s.is_active = 1
         ORDER BY s.start_time",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let slots = stmt
        .query_map((&teacher_id, &day_of_week), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let slots = match slots {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let slot_json = |slot: &(String, String, String, String)| {
        json!({
            "classId": slot.0,
            "className": slot.1,
            "startTime": slot.2,
            "endTime": slot.3,
        })
    };

    let mut current_slot: Option<&(String, String, String, String)> = None;
    let mut next_slot: Option<&(String, String, String, String)> = None;
    for slot in &slots {
        if current_time >= slot.2 && current_time < slot.3 {
            current_slot = Some(slot);
        }
        if current_time < slot.2 && next_slot.is_none() && current_slot.is_none() {
            next_slot = Some(slot);
        }
    }

    let clo = if let Some(slot) = current_slot {
        conn.query_row(
            "SELECT clo_text, is_out_of_class FROM clos
             WHERE teacher_id = ? AND class_id = ?
               AND (start_date IS NULL OR start_date <= ?3)
               AND (end_date IS NULL OR end_date >= ?3)
             LIMIT 1",
            (&teacher_id, &slot.0, &today),
            |row| {
                Ok(json!({
                    "cloText": row.get::<_, String>(0)?,
                    "isOutOfClass": row.get::<_, i64>(1)? != 0,
                }))
            },
        )
        .optional()
    } else {
        conn.query_row(
            "SELECT clo_text, is_out_of_class FROM clos
             WHERE teacher_id = ? AND is_out_of_class = 1
             LIMIT 1",
            [&teacher_id],
            |row| {
                Ok(json!({
                    "cloText": row.get::<_, String>(0)?,
                    "isOutOfClass": row.get::<_, i64>(1)? != 0,
                }))
            },
        )
        .optional()
    };
    let clo = match clo {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "currentClass": current_slot.map(slot_json),
            "nextClass": next_slot.map(slot_json),
            "currentClo": clo,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "schedule.addSlot" => Some(handle_schedule_add_slot(state, req)),
        "schedule.removeSlot" => Some(handle_schedule_remove_slot(state, req)),
        "schedule.list" => Some(handle_schedule_list(state, req)),
        "schedule.current" => Some(handle_schedule_current(state, req)),
        "clo.set" => Some(handle_clo_set(state, req)),
        _ => None,
    }
}
