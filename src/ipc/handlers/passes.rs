use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok, ok_with_warnings};
use crate::ipc::helpers::{
    bad_params, ensure_store, get_opt_bool, get_opt_str, get_opt_ts, get_required_str,
    interval_err, parse_csv_record, parse_ts_param, pass_to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::pass::{self, PassEdit, PassError, PassRow};
use crate::store::Mutation;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;

fn pass_error(e: PassError) -> HandlerErr {
    match e {
        PassError::EmptyName => bad_params("studentName must not be empty"),
        PassError::Interval(interval) => interval_err(&interval),
    }
}

fn load_pass(conn: &Connection, pass_id: &str) -> Result<PassRow, HandlerErr> {
    db::get_pass(conn, pass_id)
        .map_err(|e| HandlerErr::new("db_query_failed", e.to_string()))?
        .ok_or_else(|| HandlerErr::new("not_found", "pass not found"))
}

fn persist_insert(conn: &Connection, row: &PassRow, now: DateTime<Utc>) -> Result<i64, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    db::insert_pass(&tx, row).map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    let seq = db::record_change(&tx, &row.teacher_id, "passes", "insert", &row.id, now)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(seq)
}

fn persist_update(conn: &Connection, row: &PassRow, now: DateTime<Utc>) -> Result<i64, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let updated =
        db::update_pass(&tx, row).map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if updated == 0 {
        // Deleted from under us by a concurrent client.
        return Err(HandlerErr::new("not_found", "pass not found"));
    }
    let seq = db::record_change(&tx, &row.teacher_id, "passes", "update", &row.id, now)
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok(seq)
}

fn handle_passes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let scope = req
        .params
        .get("scope")
        .and_then(|v| v.as_str())
        .unwrap_or("all");
    if !matches!(scope, "all" | "active" | "history") {
        return err(
            &req.id,
            "bad_params",
            "scope must be one of: all, active, history",
            None,
        );
    }

    let now = Utc::now();
    let store = match ensure_store(&mut state.stores, conn, &teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = store.sync(conn) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let snapshot = store.snapshot();
    let passes: Vec<serde_json::Value> = snapshot
        .passes
        .iter()
        .filter(|p| match scope {
            "active" => p.is_open(),
            "history" => !p.is_open(),
            _ => true,
        })
        .map(|p| pass_to_json(p, now))
        .collect();

    ok_with_warnings(&req.id, json!({ "passes": passes }), &snapshot.warnings)
}

fn handle_passes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let parsed = (|| -> Result<(String, PassRow), HandlerErr> {
        let teacher_id = get_required_str(&req.params, "teacherId")?;
        let student_name = get_required_str(&req.params, "studentName")?;
        let destination = get_opt_str(&req.params, "destination")?;
        let student_id = get_opt_str(&req.params, "studentId")?;
        let is_tablet_user = get_opt_bool(&req.params, "isTabletUser")?.unwrap_or(false);
        let time_out = get_opt_ts(&req.params, "timeOut")?;
        let now = Utc::now();
        let row = pass::new_pass(
            &teacher_id,
            student_id,
            &student_name,
            destination,
            is_tablet_user,
            time_out,
            now,
        )
        .map_err(pass_error)?;
        Ok((teacher_id, row))
    })();
    let (teacher_id, row) = match parsed {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let store = match ensure_store(&mut state.stores, conn, &teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let staged = store.stage(&[Mutation::InsertPass(row.clone())]);
    match persist_insert(conn, &row, row.created_at) {
        Ok(seq) => {
            store.commit(staged, &[seq]);
            ok(
                &req.id,
                json!({ "pass": pass_to_json(&row, row.created_at), "seq": seq }),
            )
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

fn handle_passes_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let pass_id = match get_required_str(&req.params, "passId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let now = Utc::now();
    let time_in = match get_opt_ts(&req.params, "timeIn") {
        Ok(v) => v.unwrap_or(now),
        Err(e) => return e.response(&req.id),
    };

    let current = match load_pass(conn, &pass_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let closed = match pass::close(&current, time_in) {
        Ok(v) => v,
        Err(e) => return pass_error(e).response(&req.id),
    };

    let store = match ensure_store(&mut state.stores, conn, &closed.teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let staged = store.stage(&[Mutation::ReplacePass(closed.clone())]);
    match persist_update(conn, &closed, now) {
        Ok(seq) => {
            store.commit(staged, &[seq]);
            ok(
                &req.id,
                json!({ "pass": pass_to_json(&closed, now), "seq": seq }),
            )
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

fn parse_edits(params: &serde_json::Value) -> Result<Vec<PassEdit>, HandlerErr> {
    let Some(raw) = params.get("edits").and_then(|v| v.as_array()) else {
        return Err(bad_params("edits must be an array"));
    };
    if raw.is_empty() {
        return Err(bad_params("edits must not be empty"));
    }
    let mut edits = Vec::with_capacity(raw.len());
    for item in raw {
        let op = item
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or_else(|| bad_params("each edit needs an op"))?;
        let value = item.get("value").cloned().unwrap_or(serde_json::Value::Null);
        let edit = match op {
            "renameStudent" => {
                let name = value
                    .as_str()
                    .ok_or_else(|| bad_params("renameStudent needs a string value"))?;
                PassEdit::RenameStudent(name.to_string())
            }
            "setDestination" => {
                if value.is_null() {
                    PassEdit::SetDestination(None)
                } else {
                    let d = value
                        .as_str()
                        .ok_or_else(|| bad_params("setDestination needs a string or null"))?;
                    PassEdit::SetDestination(Some(d.to_string()))
                }
            }
            "setTimeOut" => {
                let raw_ts = value
                    .as_str()
                    .ok_or_else(|| bad_params("setTimeOut needs a timestamp value"))?;
                PassEdit::SetTimeOut(parse_ts_param(raw_ts, "setTimeOut")?)
            }
            "setTimeIn" => {
                let raw_ts = value.as_str().ok_or_else(|| {
                    bad_params("setTimeIn needs a timestamp value; use passes.reopen to clear it")
                })?;
                PassEdit::SetTimeIn(parse_ts_param(raw_ts, "setTimeIn")?)
            }
            other => return Err(bad_params(format!("unknown edit op: {}", other))),
        };
        edits.push(edit);
    }
    Ok(edits)
}

fn handle_passes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let pass_id = match get_required_str(&req.params, "passId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let edits = match parse_edits(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let current = match load_pass(conn, &pass_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let next = match pass::apply_edits(&current, &edits) {
        Ok(v) => v,
        Err(e) => return pass_error(e).response(&req.id),
    };

    let now = Utc::now();
    let store = match ensure_store(&mut state.stores, conn, &next.teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let staged = store.stage(&[Mutation::ReplacePass(next.clone())]);
    match persist_update(conn, &next, now) {
        Ok(seq) => {
            store.commit(staged, &[seq]);
            ok(
                &req.id,
                json!({ "pass": pass_to_json(&next, now), "seq": seq }),
            )
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

fn handle_passes_reopen(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let pass_id = match get_required_str(&req.params, "passId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let current = match load_pass(conn, &pass_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let reopened = pass::reopen(&current);

    let now = Utc::now();
    let store = match ensure_store(&mut state.stores, conn, &reopened.teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let staged = store.stage(&[Mutation::ReplacePass(reopened.clone())]);
    match persist_update(conn, &reopened, now) {
        Ok(seq) => {
            store.commit(staged, &[seq]);
            ok(
                &req.id,
                json!({ "pass": pass_to_json(&reopened, now), "seq": seq }),
            )
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

fn handle_passes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let pass_id = match get_required_str(&req.params, "passId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    // Concurrent deletion is expected; a missing id is a soft no-op.
    let current = match db::get_pass(conn, &pass_id) {
        Ok(Some(v)) => v,
        Ok(None) => {
            return ok(
                &req.id,
                json!({ "deleted": false, "notice": "pass already removed" }),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = Utc::now();
    let store = match ensure_store(&mut state.stores, conn, &current.teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let staged = store.stage(&[Mutation::RemovePass(pass_id.clone())]);

    let deleted = (|| -> Result<i64, HandlerErr> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        db::delete_pass(&tx, &pass_id)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        let seq = db::record_change(&tx, &current.teacher_id, "passes", "delete", &pass_id, now)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        Ok(seq)
    })();

    match deleted {
        Ok(seq) => {
            store.commit(staged, &[seq]);
            ok(&req.id, json!({ "deleted": true, "seq": seq }))
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

fn handle_passes_import_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let in_path = match get_required_str(&req.params, "inPath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let text = match std::fs::read_to_string(&in_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": in_path })),
            )
        }
    };
    let mut lines = text.lines();
    let Some(header_line) = lines.next() else {
        return err(&req.id, "bad_params", "csv file is empty", None);
    };
    let header = parse_csv_record(header_line);
    let col = |name: &str| header.iter().position(|h| h.trim() == name);
    let (Some(name_col), Some(out_col)) = (col("student_name"), col("time_out")) else {
        return err(
            &req.id,
            "bad_params",
            "csv header must include student_name and time_out",
            None,
        );
    };
    let destination_col = col("destination");
    let in_col = col("time_in");

    let now = Utc::now();
    let mut imported: Vec<PassRow> = Vec::new();
    let mut skipped = 0usize;
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields = parse_csv_record(line);
        let field = |idx: Option<usize>| -> Option<String> {
            idx.and_then(|i| fields.get(i)).map(|s| s.trim().to_string())
        };
        let Some(name) = field(Some(name_col)).filter(|s| !s.is_empty()) else {
            skipped += 1;
            continue;
        };
        let Some(time_out) = field(Some(out_col)).and_then(|raw| calc::parse_ts(&raw)) else {
            skipped += 1;
            continue;
        };
        let destination = field(destination_col).filter(|s| !s.is_empty());
        let time_in = field(in_col).filter(|s| !s.is_empty());

        let row = match pass::new_pass(
            &teacher_id,
            None,
            &name,
            destination,
            false,
            Some(time_out),
            now,
        ) {
            Ok(r) => r,
            Err(_) => {
                skipped += 1;
                continue;
            }
        };
        let row = match time_in {
            Some(raw) => {
                let Some(t) = calc::parse_ts(&raw) else {
                    skipped += 1;
                    continue;
                };
                match pass::close(&row, t) {
                    Ok(r) => r,
                    Err(_) => {
                        skipped += 1;
                        continue;
                    }
                }
            }
            None => row,
        };
        imported.push(row);
    }

    let persisted = (|| -> Result<usize, HandlerErr> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        for row in &imported {
            db::insert_pass(&tx, row)
                .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
            db::record_change(&tx, &teacher_id, "passes", "insert", &row.id, now)
                .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        Ok(imported.len())
    })();
    let imported_count = match persisted {
        Ok(n) => n,
        Err(e) => return e.response(&req.id),
    };

    // Bulk ingest skips the optimistic path; reload the snapshot wholesale.
    if let Some(store) = state.stores.get_mut(&teacher_id) {
        if let Err(e) = store.refresh(conn) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }

    ok(
        &req.id,
        json!({ "imported": imported_count, "skipped": skipped }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "passes.list" => Some(handle_passes_list(state, req)),
        "passes.create" => Some(handle_passes_create(state, req)),
        "passes.close" => Some(handle_passes_close(state, req)),
        "passes.update" => Some(handle_passes_update(state, req)),
        "passes.reopen" => Some(handle_passes_reopen(state, req)),
        "passes.delete" => Some(handle_passes_delete(state, req)),
        "passes.importCsv" => Some(handle_passes_import_csv(state, req)),
        _ => None,
    }
}
