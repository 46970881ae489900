use crate::calc;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{csv_quote, get_required_str};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use serde_json::json;
use std::collections::HashSet;
use std::path::PathBuf;

fn handle_exports_passes_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let out_path = match req.params.get("outPath").and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing outPath", None),
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
    let selected: Option<HashSet<String>> = req.params.get("ids").and_then(|v| v.as_array()).map(
        |arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        },
    );

    let rows = match db::list_passes(conn, &teacher_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = Utc::now();
    let mut csv = String::from("student_name,destination,time_out,time_in,total_time_spent\n");
    let mut rows_exported = 0usize;
    for p in rows.iter().filter(|p| {
        let in_scope = match scope {
            "active" => p.is_open(),
            "history" => !p.is_open(),
            _ => true,
        };
        let in_selection = selected.as_ref().map(|ids| ids.contains(&p.id)).unwrap_or(true);
        in_scope && in_selection
    }) {
        // Open passes export the N/A sentinel, never a live (provisional) total.
        let total = if p.is_open() {
            "N/A".to_string()
        } else {
            match calc::pass_duration(p.time_out, p.time_in, now) {
                Ok(d) => d.compact(),
                Err(_) => "Invalid".to_string(),
            }
        };
        csv.push_str(&format!(
            "{},{},{},{},{}\n",
            csv_quote(&p.student_name),
            csv_quote(p.destination.as_deref().unwrap_or("")),
            csv_quote(&calc::format_ts(p.time_out)),
            csv_quote(&p.time_in.map(calc::format_ts).unwrap_or_default()),
            csv_quote(&total)
        ));
        rows_exported += 1;
    }

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out, csv) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        );
    }

    ok(
        &req.id,
        json!({ "rowsExported": rows_exported, "path": out_path }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exports.passesCsv" => Some(handle_exports_passes_csv(state, req)),
        _ => None,
    }
}
