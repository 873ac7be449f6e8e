//! Shaping raw model output into schema-conformant JSON.

use serde_json::{Map, Value};

/// Pull a JSON object out of a model response.
///
/// Tries the whole response first, then the span from the first `{` to the
/// last `}` (models like to wrap JSON in prose or code fences).
pub fn salvage_json(response: &str) -> Option<Map<String, Value>> {
    let text = response.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(text) {
        return Some(map);
    }

    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&text[start..=end]) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Normalize a table-like value into an array of row objects.
///
/// - objects keyed by row numbers (`{"1": {...}, "2": {...}}`) become an
///   array in row order; rows whose values are all null are dropped
/// - objects whose values are all objects become an array of those values
/// - lists of scalars become lists of `{"data": value}`
///
/// Anything else is returned unchanged.
pub fn normalize_table(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut numbered: Vec<(u64, Value)> = Vec::new();
            for (key, row) in &map {
                if let Ok(n) = key.trim().parse::<u64>() {
                    numbered.push((n, row.clone()));
                }
            }

            if !numbered.is_empty() {
                numbered.sort_by_key(|(n, _)| *n);
                let rows = numbered
                    .into_iter()
                    .filter(|(_, row)| !is_empty_row(row))
                    .map(|(_, row)| wrap_scalar(row))
                    .collect();
                return Value::Array(rows);
            }

            if !map.is_empty() && map.values().all(Value::is_object) {
                return Value::Array(map.into_iter().map(|(_, v)| v).collect());
            }
            Value::Object(map)
        }
        Value::Array(items) => {
            if items.iter().all(Value::is_object) {
                Value::Array(items)
            } else {
                Value::Array(items.into_iter().map(wrap_scalar).collect())
            }
        }
        other => other,
    }
}

fn is_empty_row(row: &Value) -> bool {
    match row {
        Value::Null => true,
        Value::Object(cells) => cells.values().all(Value::is_null),
        _ => false,
    }
}

fn wrap_scalar(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        let mut row = Map::new();
        row.insert("data".to_string(), value);
        Value::Object(row)
    }
}
