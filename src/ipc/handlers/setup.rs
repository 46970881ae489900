use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Tv,
    Security,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "tv" => Some(Self::Tv),
            "security" => Some(Self::Security),
            _ => None,
        }
    }

    fn key(self, teacher_id: &str) -> String {
        match self {
            Self::Tv => format!("setup.tv.{}", teacher_id),
            Self::Security => format!("setup.security.{}", teacher_id),
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Tv => json!({
            "tvModeEnabled": false,
            "rotationSeconds": 30,
            "showLine": true,
            "showSchedule": true,
            "showClo": true,
            "background": null
        }),
        SetupSection::Security => json!({
            "verificationKey": null,
            "confirmDeletes": true
        }),
    }
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_nullable_string_max(v: &Value, key: &str, max_len: usize) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(Value::String(s.to_string()))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Tv => match k.as_str() {
                "tvModeEnabled" | "showLine" | "showSchedule" | "showClo" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                "rotationSeconds" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 5, 600)?));
                }
                "background" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 200)?);
                }
                _ => return Err(format!("unknown tv field: {}", k)),
            },
            SetupSection::Security => match k.as_str() {
                "verificationKey" => {
                    obj.insert(k.clone(), parse_nullable_string_max(v, k, 128)?);
                }
                "confirmDeletes" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown security field: {}", k)),
            },
        }
    }
    Ok(())
}

/// Stored sections overlay the defaults so older workspaces pick up fields
/// added since they were written.
fn load_section(
    conn: &rusqlite::Connection,
    teacher_id: &str,
    section: SetupSection,
) -> anyhow::Result<Value> {
    let mut merged = default_section(section);
    if let Some(stored) = db::settings_get_json(conn, &section.key(teacher_id))? {
        if let (Some(target), Some(source)) = (merged.as_object_mut(), stored.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
    }
    Ok(merged)
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    if let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) {
        let Some(section) = SetupSection::parse(section_raw) else {
            return err(&req.id, "bad_params", "unknown section", None);
        };
        return match load_section(conn, &teacher_id, section) {
            Ok(v) => ok(&req.id, json!({ section_raw: v })),
            Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
        };
    }

    let tv = match load_section(conn, &teacher_id, SetupSection::Tv) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let security = match load_section(conn, &teacher_id, SetupSection::Security) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "tv": tv, "security": security }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, &teacher_id, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, &section.key(&teacher_id), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, section_raw: current }))
}

/// Shared-key teacher verification for the tablet kiosk flow. The key itself
/// lives in the security section; auth proper stays with the session layer.
fn handle_auth_verify_key(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let teacher_id = match get_required_str(&req.params, "teacherId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let key = match get_required_str(&req.params, "key") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let section = match load_section(conn, &teacher_id, SetupSection::Security) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let configured = section
        .get("verificationKey")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let valid = configured.as_deref() == Some(key.as_str());
    ok(
        &req.id,
        json!({ "valid": valid, "configured": configured.is_some() }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        "auth.verifyKey" => Some(handle_auth_verify_key(state, req)),
        _ => None,
    }
}
