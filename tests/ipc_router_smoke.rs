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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("hallpass-router-smoke");
    let bundle_out = workspace.join("smoke-backup.hpbackup.zip");
    let csv_out = workspace.join("smoke-export.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request(
        &mut stdin,
        &mut reader,
        "3",
        "passes.create",
        json!({ "teacherId": "t-smoke", "studentName": "Smoke Student", "destination": "Library" }),
    );
    let pass_id = created
        .get("result")
        .and_then(|v| v.get("pass"))
        .and_then(|v| v.get("id"))
        .and_then(|v| v.as_str())
        .expect("pass id")
        .to_string();

    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "passes.list",
        json!({ "teacherId": "t-smoke" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "passes.close",
        json!({ "passId": pass_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "queue.add",
        json!({ "teacherId": "t-smoke", "studentName": "Waiting Student", "destination": "Restroom" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "queue.list",
        json!({ "teacherId": "t-smoke" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "changes.poll",
        json!({ "teacherId": "t-smoke", "sinceSeq": 0 }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8b",
        "changes.release",
        json!({ "teacherId": "t-smoke" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "exports.passesCsv",
        json!({ "teacherId": "t-smoke", "outPath": csv_out.to_string_lossy() }),
    );
    let created_class = request(
        &mut stdin,
        &mut reader,
        "10",
        "classes.create",
        json!({ "teacherId": "t-smoke", "className": "Period 1" }),
    );
    let class_id = created_class
        .get("result")
        .and_then(|v| v.get("classId"))
        .and_then(|v| v.as_str())
        .expect("classId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "schedule.addSlot",
        json!({
            "teacherId": "t-smoke",
            "classId": class_id,
            "day": "Monday",
            "startTime": "09:00",
            "endTime": "10:00"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "schedule.list",
        json!({ "teacherId": "t-smoke" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "schedule.current",
        json!({ "teacherId": "t-smoke" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "clo.set",
        json!({ "teacherId": "t-smoke", "cloText": "Read chapter 4", "classId": class_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "setup.get",
        json!({ "teacherId": "t-smoke" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "setup.update",
        json!({ "teacherId": "t-smoke", "section": "tv", "patch": { "tvModeEnabled": true } }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "auth.verifyKey",
        json!({ "teacherId": "t-smoke", "key": "nope" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "backgrounds.list",
        json!({ "teacherId": "t-smoke" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "21",
        "passes.delete",
        json!({ "passId": pass_id }),
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
