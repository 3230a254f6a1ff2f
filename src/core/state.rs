//! The persisted session record.
//!
//! A [`SessionState`] is a JSON object. Known fields get typed accessors, every
//! other key is carried through untouched so collaborators can stash their own
//! data in the record.

use crate::core::{Result, SessionError};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Format accepted for the mocked `datetime` field (`yyyy-MM-dd HH:mm:ss`).
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const FIELD_DATABASE: &str = "database";
pub const FIELD_DATETIME: &str = "datetime";
pub const FIELD_MAILER: &str = "mailer";
pub const FIELD_STUBFILE: &str = "stubfile";
pub const FIELD_FIXTURES: &str = "fixtures";
pub const FIELD_SESSION: &str = "session";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState {
    fields: Map<String, Value>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builds a record from an arbitrary JSON value. Only objects are records.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            Value::Null => Ok(Self::default()),
            other => Err(SessionError::InvalidArgument(format!(
                "session state must be a JSON object, got {}",
                type_name(&other)
            ))),
        }
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// A key counts as set only when it holds a non-null value.
    pub fn is_set(&self, key: &str) -> bool {
        matches!(self.fields.get(key), Some(value) if !value.is_null())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    pub fn database(&self) -> Option<&str> {
        self.non_empty_str(FIELD_DATABASE)
    }

    pub fn set_database(&mut self, name: impl Into<String>) {
        self.fields
            .insert(FIELD_DATABASE.to_string(), Value::String(name.into()));
    }

    pub fn datetime(&self) -> Option<&str> {
        self.non_empty_str(FIELD_DATETIME)
    }

    pub fn mailer(&self) -> Option<&str> {
        self.non_empty_str(FIELD_MAILER)
    }

    pub fn stubfile(&self) -> Option<&str> {
        self.non_empty_str(FIELD_STUBFILE)
    }

    pub fn fixtures(&self) -> Vec<String> {
        match self.fields.get(FIELD_FIXTURES) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Appends to the `fixtures` log, creating it on first use.
    pub fn push_fixture(&mut self, path: impl Into<String>) {
        let entry = self
            .fields
            .entry(FIELD_FIXTURES.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !entry.is_array() {
            *entry = Value::Array(Vec::new());
        }
        if let Value::Array(items) = entry {
            items.push(Value::String(path.into()));
        }
    }

    /// Snapshot of the browser session store, empty when none was captured.
    pub fn session(&self) -> Map<String, Value> {
        match self.fields.get(FIELD_SESSION) {
            Some(Value::Object(values)) => values.clone(),
            _ => Map::new(),
        }
    }

    pub fn set_session(&mut self, values: Map<String, Value>) {
        self.fields
            .insert(FIELD_SESSION.to_string(), Value::Object(values));
    }

    /// Parsed mock clock, if `datetime` is set and well-formed.
    pub fn mock_now(&self) -> Option<NaiveDateTime> {
        self.datetime().and_then(|raw| parse_datetime(raw).ok())
    }

    /// Fills every key that is unset here from `existing`. Keys already set on
    /// `self` win.
    pub fn fill_from(&mut self, existing: &SessionState) {
        for (key, value) in &existing.fields {
            if !self.is_set(key) {
                self.fields.insert(key.clone(), value.clone());
            }
        }
    }

    fn non_empty_str(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
    }
}

impl From<Map<String, Value>> for SessionState {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl From<SessionState> for Value {
    fn from(state: SessionState) -> Self {
        Value::Object(state.fields)
    }
}

/// Right-biased shallow merge: `incoming` wins on conflicting keys, keys only
/// present in `existing` are preserved.
pub fn merge_states(existing: &SessionState, incoming: SessionState) -> SessionState {
    let mut merged = incoming;
    merged.fill_from(existing);
    merged
}

pub fn parse_datetime(raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT).map_err(|_| {
        SessionError::InvalidArgument(format!(
            "Invalid date format \"{}\", use yyyy-MM-dd HH:mm:ss",
            raw
        ))
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
