use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

fn backgrounds_dir(workspace: &Path, teacher_id: &str) -> PathBuf {
    workspace.join("backgrounds").join(teacher_id)
}

/// File names are minted here from the content hash; anything with a path
/// separator is a caller trying to escape the backgrounds directory.
fn valid_file_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

fn handle_backgrounds_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let source_path = match get_required_str(&req.params, "sourcePath") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let bytes = match std::fs::read(&source_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": source_path })),
            )
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = format!("{:x}", hasher.finalize());

    let ext = Path::new(&source_path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .filter(|e| matches!(e.as_str(), "png" | "jpg" | "jpeg" | "gif" | "webp"))
        .unwrap_or_else(|| "img".to_string());
    let file_name = format!("{}.{}", &digest[..16], ext);

    let dir = backgrounds_dir(workspace, &teacher_id);
    if let Err(e) = std::fs::create_dir_all(&dir) {
        return err(&req.id, "io_failed", e.to_string(), None);
    }
    let target = dir.join(&file_name);
    // Content-addressed: re-adding the same image is a no-op.
    let already_exists = target.is_file();
    if !already_exists {
        if let Err(e) = std::fs::write(&target, &bytes) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": target.to_string_lossy() })),
            );
        }
    }

    ok(
        &req.id,
        json!({
            "fileName": file_name,
            "digest": digest,
            "byteSize": bytes.len(),
            "alreadyExists": already_exists,
        }),
    )
}

fn handle_backgrounds_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let dir = backgrounds_dir(workspace, &teacher_id);
    let mut files: Vec<serde_json::Value> = Vec::new();
    if dir.is_dir() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(v) => v,
            Err(e) => return err(&req.id, "io_failed", e.to_string(), None),
        };
        let mut collected: Vec<(String, u64)> = Vec::new();
        for ent in entries.flatten() {
            let p = ent.path();
            if !p.is_file() {
                continue;
            }
            let name = ent.file_name().to_string_lossy().to_string();
            let size = ent.metadata().map(|m| m.len()).unwrap_or(0);
            collected.push((name, size));
        }
        collected.sort();
        files = collected
            .into_iter()
            .map(|(name, size)| json!({ "fileName": name, "byteSize": size }))
            .collect();
    }

    ok(&req.id, json!({ "backgrounds": files }))
}

fn handle_backgrounds_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let file_name = match get_required_str(&req.params, "fileName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if !valid_file_name(&file_name) {
        return err(&req.id, "bad_params", "invalid fileName", None);
    }

    let target = backgrounds_dir(workspace, &teacher_id).join(&file_name);
    let removed = if target.is_file() {
        match std::fs::remove_file(&target) {
            Ok(()) => true,
            Err(e) => return err(&req.id, "io_failed", e.to_string(), None),
        }
    } else {
        false
    };

    // Removing the selected background clears the selection too.
    if removed {
        if let Some(conn) = state.db.as_ref() {
            let key = format!("setup.tv.{}", teacher_id);
            if let Ok(Some(mut stored)) = db::settings_get_json(conn, &key) {
                let selected = stored.get("background").and_then(|v| v.as_str()) == Some(file_name.as_str());
                if selected {
                    if let Some(obj) = stored.as_object_mut() {
                        obj.insert("background".to_string(), serde_json::Value::Null);
                    }
                    let _ = db::settings_set_json(conn, &key, &stored);
                }
            }
        }
    }

    ok(&req.id, json!({ "removed": removed }))
}

fn handle_backgrounds_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let file_name = match req.params.get("fileName") {
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => return err(&req.id, "bad_params", "fileName must be a string or null", None),
        },
        None => return err(&req.id, "bad_params", "missing fileName", None),
    };

    if let Some(name) = &file_name {
        if !valid_file_name(name) {
            return err(&req.id, "bad_params", "invalid fileName", None);
        }
        let target = backgrounds_dir(workspace, &teacher_id).join(name);
        if !target.is_file() {
            return err(&req.id, "not_found", "background not found", None);
        }
    }

    let key = format!("setup.tv.{}", teacher_id);
    let mut stored = match db::settings_get_json(conn, &key) {
        Ok(Some(v)) => v,
        Ok(None) => json!({}),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(obj) = stored.as_object_mut() {
        obj.insert(
            "background".to_string(),
            file_name
                .clone()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        );
    }
    if let Err(e) = db::settings_set_json(conn, &key, &stored) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "background": file_name }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backgrounds.add" => Some(handle_backgrounds_add(state, req)),
        "backgrounds.list" => Some(handle_backgrounds_list(state, req)),
        "backgrounds.remove" => Some(handle_backgrounds_remove(state, req)),
        "backgrounds.select" => Some(handle_backgrounds_select(state, req)),
        _ => None,
    }
}
