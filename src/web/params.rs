//! Turning submitted driver parameters into a session record.

use crate::core::state::FIELD_DATETIME;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Keys only meaningful to the submitting form, never persisted.
pub const FORM_ONLY_KEYS: [&str; 5] = ["action_set", "action_start", "SecurityID", "url", "flush"];

const DEFAULT_TIME: &str = "00:00:00";

/// One-shot instructions carried alongside the state fields.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionCommands {
    pub fixture: Option<String>,
    pub import_database_path: Option<PathBuf>,
    pub import_database_filename: Option<String>,
    pub require_default_records: bool,
    pub global_session: bool,
}

impl SessionCommands {
    /// Removes the command keys from `params`.
    pub fn extract(params: &mut Map<String, Value>) -> Self {
        Self {
            fixture: take_string(params, "fixture"),
            import_database_path: take_string(params, "importDatabasePath").map(PathBuf::from),
            import_database_filename: take_string(params, "importDatabaseFilename"),
            require_default_records: params
                .remove("requireDefaultRecords")
                .map(|v| truthy(&v))
                .unwrap_or(false),
            global_session: params
                .remove("globalTestSession")
                .map(|v| truthy(&v))
                .unwrap_or(false),
        }
    }
}

/// Nests `key[sub]` form keys, joins a `{date, time}` datetime into one string
/// and drops form-only keys.
pub fn normalize_params(params: Map<String, Value>) -> Map<String, Value> {
    let mut params = fold_bracket_keys(params);
    fix_datetime(&mut params);
    for key in FORM_ONLY_KEYS {
        params.remove(key);
    }
    params
}

fn fix_datetime(params: &mut Map<String, Value>) {
    let joined = match params.get(FIELD_DATETIME) {
        Some(Value::Object(parts)) => {
            let date = parts.get("date").and_then(Value::as_str).unwrap_or_default();
            if date.is_empty() {
                None
            } else {
                let time = parts
                    .get("time")
                    .and_then(Value::as_str)
                    .filter(|time| !time.is_empty())
                    .unwrap_or(DEFAULT_TIME);
                Some(format!("{} {}", date, time))
            }
        }
        Some(Value::String(raw)) if raw.is_empty() => None,
        _ => return,
    };

    match joined {
        Some(datetime) => {
            params.insert(FIELD_DATETIME.to_string(), Value::String(datetime));
        }
        None => {
            params.remove(FIELD_DATETIME);
        }
    }
}

fn fold_bracket_keys(params: Map<String, Value>) -> Map<String, Value> {
    let mut folded = Map::new();
    for (key, value) in params {
        let nested = key
            .strip_suffix(']')
            .and_then(|rest| rest.split_once('['))
            .filter(|(outer, inner)| !outer.is_empty() && !inner.is_empty());

        match nested {
            Some((outer, inner)) => {
                let entry = folded
                    .entry(outer.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !entry.is_object() {
                    *entry = Value::Object(Map::new());
                }
                if let Value::Object(inner_map) = entry {
                    inner_map.insert(inner.to_string(), value);
                }
            }
            None => {
                folded.insert(key, value);
            }
        }
    }
    folded
}

fn take_string(params: &mut Map<String, Value>, key: &str) -> Option<String> {
    match params.remove(key) {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}
