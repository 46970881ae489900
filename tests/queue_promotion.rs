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

fn add_to_line(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
) -> String {
    let added = request_ok(
        stdin,
        reader,
        id,
        "queue.add",
        json!({ "teacherId": "t-1", "studentName": name, "destination": "Restroom" }),
    );
    added
        .get("entry")
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("entry id")
        .to_string()
}

fn line_view(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
) -> Vec<(String, i64)> {
    let listed = request_ok(stdin, reader, id, "queue.list", json!({ "teacherId": "t-1" }));
    listed
        .get("queue")
        .and_then(|v| v.as_array())
        .expect("queue")
        .iter()
        .map(|e| {
            (
                e.get("studentName")
                    .and_then(|v| v.as_str())
                    .expect("name")
                    .to_string(),
                e.get("position").and_then(|v| v.as_i64()).expect("position"),
            )
        })
        .collect()
}

#[test]
fn promoting_the_head_starts_a_pass_and_renumbers() {
    let workspace = temp_dir("hallpass-promote");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let bob_id = add_to_line(&mut stdin, &mut reader, "2", "Bob");
    let _cara_id = add_to_line(&mut stdin, &mut reader, "3", "Cara");
    assert_eq!(
        line_view(&mut stdin, &mut reader, "4"),
        vec![("Bob".to_string(), 1), ("Cara".to_string(), 2)]
    );

    let promoted = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "queue.promote",
        json!({ "entryId": bob_id }),
    );
    let pass = promoted.get("pass").expect("pass");
    assert_eq!(pass.get("studentName").and_then(|v| v.as_str()), Some("Bob"));
    assert_eq!(pass.get("timeIn"), Some(&serde_json::Value::Null));

    // Cara moves up to the head; positions stay contiguous.
    assert_eq!(
        line_view(&mut stdin, &mut reader, "6"),
        vec![("Cara".to_string(), 1)]
    );

    let active = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "passes.list",
        json!({ "teacherId": "t-1", "scope": "active" }),
    );
    let passes = active.get("passes").and_then(|v| v.as_array()).expect("passes");
    assert_eq!(passes.len(), 1);
    assert_eq!(
        passes[0].get("studentName").and_then(|v| v.as_str()),
        Some("Bob")
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn promoting_mid_line_closes_the_gap() {
    let workspace = temp_dir("hallpass-promote-mid");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _bob = add_to_line(&mut stdin, &mut reader, "2", "Bob");
    let cara = add_to_line(&mut stdin, &mut reader, "3", "Cara");
    let _dev = add_to_line(&mut stdin, &mut reader, "4", "Dev");

    // The dashboard allows starting a pass for anyone in line, not just the
    // head.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "queue.promote",
        json!({ "entryId": cara }),
    );
    assert_eq!(
        line_view(&mut stdin, &mut reader, "6"),
        vec![("Bob".to_string(), 1), ("Dev".to_string(), 2)]
    );

    // A fresh join lands at the previous max, never a recycled slot.
    let _eve = add_to_line(&mut stdin, &mut reader, "7", "Eve");
    assert_eq!(
        line_view(&mut stdin, &mut reader, "8"),
        vec![
            ("Bob".to_string(), 1),
            ("Dev".to_string(), 2),
            ("Eve".to_string(), 3)
        ]
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn promoting_a_missing_entry_is_not_found_and_changes_nothing() {
    let workspace = temp_dir("hallpass-promote-missing");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _bob = add_to_line(&mut stdin, &mut reader, "2", "Bob");

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "queue.promote",
        json!({ "entryId": "does-not-exist" }),
    );
    assert_eq!(resp.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_found")
    );

    assert_eq!(
        line_view(&mut stdin, &mut reader, "4"),
        vec![("Bob".to_string(), 1)]
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
        Some(0)
    );

    let _ = std::fs::remove_dir_all(workspace);
}
