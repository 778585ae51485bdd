use rusqlite::types::ValueRef;

/// Convert a SQLite value to a properly typed JSON value.
pub(super) fn sqlite_value_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(n) => serde_json::json!(n),
        ValueRef::Real(n) => {
            if n.is_finite() {
                serde_json::json!(n)
            } else {
                serde_json::Value::String(n.to_string())
            }
        }
        ValueRef::Text(bytes) => {
            serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
        ValueRef::Blob(bytes) => serde_json::Value::String(format!("<{} bytes>", bytes.len())),
    }
}

/// Read a column that should hold an integer but may have been stored as
/// real or text by the converter. Anything unparseable reads as `None`.
pub(super) fn sqlite_value_to_i64(value: ValueRef<'_>) -> Option<i64> {
    match value {
        ValueRef::Integer(n) => Some(n),
        ValueRef::Real(n) if n.is_finite() => Some(n as i64),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
        _ => None,
    }
}

/// Render integers as a comma-separated SQL placeholder list (`?,?,?`).
pub(super) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}
