use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_hallpassd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn hallpassd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

#[test]
fn create_close_reports_exact_final_duration() {
    let workspace = temp_dir("hallpass-lifecycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "passes.create",
        json!({
            "teacherId": "t-1",
            "studentName": "Alice",
            "destination": "Restroom",
            "timeOut": "2025-03-10T09:00:00Z"
        }),
    );
    let pass = created.get("pass").expect("pass");
    let pass_id = pass.get("id").and_then(|v| v.as_str()).expect("id").to_string();
    assert_eq!(pass.get("timeIn"), Some(&serde_json::Value::Null));
    assert_eq!(
        pass.get("durationIsFinal").and_then(|v| v.as_bool()),
        Some(false)
    );

    let closed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "passes.close",
        json!({ "passId": pass_id, "timeIn": "2025-03-10T09:07:00Z" }),
    );
    let pass = closed.get("pass").expect("pass");
    assert_eq!(
        pass.get("totalTimeSpent").and_then(|v| v.as_str()),
        Some("7m 0s")
    );
    assert_eq!(
        pass.get("durationIsFinal").and_then(|v| v.as_bool()),
        Some(true)
    );

    // Closed passes land in history, not active.
    let active = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "passes.list",
        json!({ "teacherId": "t-1", "scope": "active" }),
    );
    assert_eq!(
        active.get("passes").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    let history = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "passes.list",
        json!({ "teacherId": "t-1", "scope": "history" }),
    );
    assert_eq!(
        history
            .get("passes")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn reopen_is_explicit_and_returns_pass_to_active() {
    let workspace = temp_dir("hallpass-reopen");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "passes.create",
        json!({
            "teacherId": "t-1",
            "studentName": "Bob",
            "timeOut": "2025-03-10T09:00:00Z"
        }),
    );
    let pass_id = created
        .get("pass")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("id")
        .to_string();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "passes.close",
        json!({ "passId": pass_id, "timeIn": "2025-03-10T09:05:00Z" }),
    );
    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "passes.reopen",
        json!({ "passId": pass_id }),
    );
    let pass = reopened.get("pass").expect("pass");
    assert_eq!(pass.get("timeIn"), Some(&serde_json::Value::Null));
    assert_eq!(
        pass.get("durationIsFinal").and_then(|v| v.as_bool()),
        Some(false)
    );

    let active = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "passes.list",
        json!({ "teacherId": "t-1", "scope": "active" }),
    );
    assert_eq!(
        active.get("passes").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn delete_is_idempotent_and_leaves_other_rows_alone() {
    let workspace = temp_dir("hallpass-delete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "passes.create",
        json!({ "teacherId": "t-1", "studentName": "Alice", "timeOut": "2025-03-10T09:00:00Z" }),
    );
    let keep = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "passes.create",
        json!({ "teacherId": "t-1", "studentName": "Bob", "timeOut": "2025-03-10T09:01:00Z" }),
    );
    let first_id = first
        .get("pass")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("id")
        .to_string();
    let keep_id = keep
        .get("pass")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("id")
        .to_string();

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "passes.delete",
        json!({ "passId": first_id }),
    );
    assert_eq!(deleted.get("deleted").and_then(|v| v.as_bool()), Some(true));

    // Second delete of the same id is a soft no-op, not an error.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "passes.delete",
        json!({ "passId": first_id }),
    );
    assert_eq!(again.get("deleted").and_then(|v| v.as_bool()), Some(false));

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "passes.list",
        json!({ "teacherId": "t-1" }),
    );
    let passes = listed.get("passes").and_then(|v| v.as_array()).expect("passes");
    assert_eq!(passes.len(), 1);
    assert_eq!(
        passes[0].get("id").and_then(|v| v.as_str()),
        Some(keep_id.as_str())
    );

    let _ = std::fs::remove_dir_all(workspace);
}
