use crate::store::Inconsistency;
use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

/// Success response that carries snapshot-level warnings alongside the result.
/// Warnings describe durable inconsistent state (partial promotes from crashed
/// clients, position holes), never the outcome of this request.
pub fn ok_with_warnings(
    id: &str,
    mut result: serde_json::Value,
    warnings: &[Inconsistency],
) -> serde_json::Value {
    if !warnings.is_empty() {
        if let Some(obj) = result.as_object_mut() {
            obj.insert(
                "warnings".to_string(),
                serde_json::to_value(warnings).unwrap_or_else(|_| json!([])),
            );
        }
    }
    ok(id, result)
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}
