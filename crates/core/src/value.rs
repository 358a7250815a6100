use serde_json::{Map, Value};

pub type Record = Map<String, Value>;

/// Strict equality, falling back to comparing string renderings when both sides are non-null.
///
/// A grid editor hands back text, so `42` and `"42"` must count as the same cell value.
#[must_use]
pub fn values_match(left: &Value, right: &Value) -> bool {
    if left == right {
        return true;
    }
    if left.is_null() || right.is_null() {
        return false;
    }
    coerce_to_string(left) == coerce_to_string(right)
}

#[must_use]
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

fn quote_sql_string(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[must_use]
pub fn display_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => quote_sql_string(text),
        Value::Array(_) | Value::Object(_) => quote_sql_string(&value.to_string()),
    }
}
