use crate::db;
use crate::ipc::error::{err, ok, ok_with_warnings};
use crate::ipc::helpers::{
    bad_params, ensure_store, get_opt_bool, get_opt_str, get_required_str, interval_err,
    pass_to_json, queue_entry_to_json, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::pass::{self, PassError, PassRow};
use crate::queue::{next_position, QueueRow};
use crate::store::Mutation;
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

struct JoinParams {
    teacher_id: String,
    student_id: Option<String>,
    student_name: String,
    destination: String,
    is_tablet_user: bool,
}

fn parse_join_params(params: &serde_json::Value) -> Result<JoinParams, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let student_name = get_required_str(params, "studentName")?;
    let student_name = student_name.trim().to_string();
    if student_name.is_empty() {
        return Err(bad_params("studentName must not be empty"));
    }
    let destination = get_required_str(params, "destination")?;
    let destination = destination.trim().to_string();
    if destination.is_empty() {
        return Err(bad_params("destination must not be empty"));
    }
    Ok(JoinParams {
        teacher_id,
        student_id: get_opt_str(params, "studentId")?,
        student_name,
        destination,
        is_tablet_user: get_opt_bool(params, "isTabletUser")?.unwrap_or(false),
    })
}

fn persist_append(
    conn: &Connection,
    row: &QueueRow,
    now: DateTime<Utc>,
) -> Result<(i64, i64), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    let position = db::append_queue_entry(
        &tx,
        &row.id,
        &row.teacher_id,
        row.student_id.as_deref(),
        &row.student_name,
        &row.destination,
        row.time_joined,
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    let seq = db::record_change(&tx, &row.teacher_id, "queue", "insert", &row.id, now)
        .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    Ok((seq, position))
}

fn persist_pass_insert(
    conn: &Connection,
    row: &PassRow,
    now: DateTime<Utc>,
) -> Result<i64, HandlerErr> {
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

fn pass_error(e: PassError) -> HandlerErr {
    match e {
        PassError::EmptyName => bad_params("studentName must not be empty"),
        PassError::Interval(interval) => interval_err(&interval),
    }
}

fn handle_queue_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let now = Utc::now();
    let store = match ensure_store(&mut state.stores, conn, &teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = store.sync(conn) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }
    let snapshot = store.snapshot();
    let entries: Vec<serde_json::Value> = snapshot
        .queue
        .iter()
        .map(|entry| queue_entry_to_json(entry, now))
        .collect();
    ok_with_warnings(&req.id, json!({ "queue": entries }), &snapshot.warnings)
}

/// Student flow. An empty line means "go now": no queue write at all, the pass
/// opens immediately. A non-empty line appends at the tail.
fn handle_queue_join(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = match parse_join_params(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let now = Utc::now();
    let store = match ensure_store(&mut state.stores, conn, &params.teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = store.sync(conn) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    if store.snapshot().queue.is_empty() {
        let row = match pass::new_pass(
            &params.teacher_id,
            params.student_id,
            &params.student_name,
            Some(params.destination),
            params.is_tablet_user,
            None,
            now,
        ) {
            Ok(r) => r,
            Err(e) => return pass_error(e).response(&req.id),
        };
        let staged = store.stage(&[Mutation::InsertPass(row.clone())]);
        return match persist_pass_insert(conn, &row, now) {
            Ok(seq) => {
                store.commit(staged, &[seq]);
                ok(
                    &req.id,
                    json!({ "queued": false, "pass": pass_to_json(&row, now), "seq": seq }),
                )
            }
            Err(e) => {
                store.rollback(staged);
                e.response(&req.id)
            }
        };
    }

    let entry = QueueRow {
        id: Uuid::new_v4().to_string(),
        teacher_id: params.teacher_id.clone(),
        student_id: params.student_id,
        student_name: params.student_name,
        destination: params.destination,
        position: next_position(&store.snapshot().queue),
        time_joined: now,
    };
    let staged = store.stage(&[Mutation::AppendQueueEntry(entry.clone())]);
    match persist_append(conn, &entry, now) {
        Ok((seq, position)) => {
            store.commit(staged, &[seq]);
            if position != entry.position {
                // Another client appended between our snapshot and the insert.
                store.set_queue_position(&entry.id, position);
            }
            let mut authoritative = entry.clone();
            authoritative.position = position;
            ok(
                &req.id,
                json!({ "queued": true, "entry": queue_entry_to_json(&authoritative, now), "seq": seq }),
            )
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

/// Teacher flow: always appends, even to an empty line.
fn handle_queue_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let params = match parse_join_params(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let now = Utc::now();
    let store = match ensure_store(&mut state.stores, conn, &params.teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = store.sync(conn) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let entry = QueueRow {
        id: Uuid::new_v4().to_string(),
        teacher_id: params.teacher_id.clone(),
        student_id: params.student_id,
        student_name: params.student_name,
        destination: params.destination,
        position: next_position(&store.snapshot().queue),
        time_joined: now,
    };
    let staged = store.stage(&[Mutation::AppendQueueEntry(entry.clone())]);
    match persist_append(conn, &entry, now) {
        Ok((seq, position)) => {
            store.commit(staged, &[seq]);
            if position != entry.position {
                store.set_queue_position(&entry.id, position);
            }
            let mut authoritative = entry.clone();
            authoritative.position = position;
            ok(
                &req.id,
                json!({ "entry": queue_entry_to_json(&authoritative, now), "seq": seq }),
            )
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

/// Starts a pass for the named entry and removes it from the line. The pass
/// insert, entry delete, gap closure, and both change events commit in one
/// transaction, so a half-applied promote can never be persisted from here.
fn handle_queue_promote(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let entry_id = match get_required_str(&req.params, "entryId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let entry = match db::get_queue_entry(conn, &entry_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "queue entry not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = Utc::now();
    let pass_row = match pass::new_pass(
        &entry.teacher_id,
        entry.student_id.clone(),
        &entry.student_name,
        Some(entry.destination.clone()),
        false,
        None,
        now,
    ) {
        Ok(r) => r,
        Err(e) => return pass_error(e).response(&req.id),
    };

    let store = match ensure_store(&mut state.stores, conn, &entry.teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let staged = store.stage(&[
        Mutation::RemoveQueueEntry(entry_id.clone()),
        Mutation::InsertPass(pass_row.clone()),
    ]);

    let persisted = (|| -> Result<(i64, i64), HandlerErr> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        db::insert_pass(&tx, &pass_row)
            .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        let removed = db::delete_queue_entry(&tx, &entry_id)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        if removed == 0 {
            // Concurrently removed; abandon the whole promote.
            return Err(HandlerErr::new("not_found", "queue entry not found"));
        }
        db::close_queue_gap(&tx, &entry.teacher_id, entry.position)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        let pass_seq =
            db::record_change(&tx, &entry.teacher_id, "passes", "insert", &pass_row.id, now)
                .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        let queue_seq =
            db::record_change(&tx, &entry.teacher_id, "queue", "delete", &entry_id, now)
                .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        Ok((pass_seq, queue_seq))
    })();

    match persisted {
        Ok((pass_seq, queue_seq)) => {
            store.commit(staged, &[pass_seq, queue_seq]);
            ok(
                &req.id,
                json!({
                    "pass": pass_to_json(&pass_row, now),
                    "removedEntryId": entry_id,
                    "seq": queue_seq.max(pass_seq),
                }),
            )
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

fn handle_queue_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let entry_id = match get_required_str(&req.params, "entryId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let entry = match db::get_queue_entry(conn, &entry_id) {
        Ok(Some(v)) => v,
        Ok(None) => {
            return ok(
                &req.id,
                json!({ "removed": false, "notice": "entry already removed" }),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = Utc::now();
    let store = match ensure_store(&mut state.stores, conn, &entry.teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let staged = store.stage(&[Mutation::RemoveQueueEntry(entry_id.clone())]);

    let persisted = (|| -> Result<i64, HandlerErr> {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let removed = db::delete_queue_entry(&tx, &entry_id)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        if removed > 0 {
            db::close_queue_gap(&tx, &entry.teacher_id, entry.position)
                .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        }
        let seq = db::record_change(&tx, &entry.teacher_id, "queue", "delete", &entry_id, now)
            .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
        tx.commit()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        Ok(seq)
    })();

    match persisted {
        Ok(seq) => {
            store.commit(staged, &[seq]);
            ok(&req.id, json!({ "removed": true, "seq": seq }))
        }
        Err(e) => {
            store.rollback(staged);
            e.response(&req.id)
        }
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "queue.list" => Some(handle_queue_list(state, req)),
        "queue.join" => Some(handle_queue_join(state, req)),
        "queue.add" => Some(handle_queue_add(state, req)),
        "queue.promote" => Some(handle_queue_promote(state, req)),
        "queue.remove" => Some(handle_queue_remove(state, req)),
        _ => None,
    }
}
