use crate::db;
use crate::ipc::error::{err, ok, ok_with_warnings};
use crate::ipc::helpers::{ensure_store, get_required_str};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

/// Poll-based change notification: the UI keeps its last seen sequence number
/// and asks for anything newer. The call also reconciles the daemon-side
/// snapshot, so warnings reflect the state the events describe.
fn handle_changes_poll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let since_seq = req
        .params
        .get("sinceSeq")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);

    let events = match db::changes_since(conn, &teacher_id, since_seq) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let latest_seq = match db::latest_seq(conn, &teacher_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let store = match ensure_store(&mut state.stores, conn, &teacher_id) {
        Ok(s) => s,
        Err(e) => return e.response(&req.id),
    };
    let refreshed = match store.sync(conn) {
        Ok((_, reloaded)) => reloaded,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let warnings = store.snapshot().warnings.clone();
    ok_with_warnings(
        &req.id,
        json!({
            "events": events,
            "latestSeq": latest_seq,
            "refreshed": refreshed,
        }),
        &warnings,
    )
}

/// Drops the cached snapshot for a teacher once the owning view goes away;
/// the teardown half of the subscription. The next poll rebuilds it.
fn handle_changes_release(state: &mut AppState, req: &Request) -> serde_json::Value {
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let released = state.stores.remove(&teacher_id).is_some();
    ok(&req.id, json!({ "released": released }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "changes.poll" => Some(handle_changes_poll(state, req)),
        "changes.release" => Some(handle_changes_release(state, req)),
        _ => None,
    }
}
