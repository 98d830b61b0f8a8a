//! Collection identity.

use chrono_tz::Tz;
use rawflow_protocol::naming::validate_raw_table_name;
use rawflow_protocol::TaskInfo;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{CollectError, Result};

/// Identifies one collection unit. Immutable once a run starts.
///
/// The connector's time zone is part of the identity: the same options
/// collected with day-granular filters in two zones cover different windows.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionParams {
    pub plugin_name: String,
    pub connection_id: String,
    /// Raw table name, `<source>_api_<entity>`
    pub table: String,
    /// Caller-supplied options (workspace id, project id, ...). Always a JSON object.
    pub options: Value,
    pub zone: Tz,
}

#[derive(Serialize)]
struct Canonical<'a> {
    plugin: &'a str,
    connection: &'a str,
    table: &'a str,
    options: &'a Value,
    zone: &'a str,
}

impl CollectionParams {
    pub fn new(
        plugin_name: impl Into<String>,
        connection_id: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            plugin_name: plugin_name.into(),
            connection_id: connection_id.into(),
            table: table.into(),
            options: Value::Object(Map::new()),
            zone: Tz::UTC,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        if let Value::Object(map) = &mut self.options {
            map.insert(key.to_string(), value.into());
        }
        self
    }

    pub fn in_zone(mut self, zone: Tz) -> Self {
        self.zone = zone;
        self
    }

    /// Build params from a task's options.
    ///
    /// `connection_id` (string or number) is required and moves out of the
    /// options into the identity; everything else stays as options.
    pub fn from_task(task: &TaskInfo, table: &str, zone: Tz) -> Result<Self> {
        let mut options = match &task.options {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(CollectError::InvalidParams(format!(
                    "task options must be an object, got {}",
                    other
                )))
            }
        };

        let connection_id = match options.remove("connection_id") {
            Some(Value::String(s)) => s,
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(CollectError::InvalidParams(
                    "task options are missing connection_id".to_string(),
                ))
            }
        };

        let params = Self::new(task.plugin_name.clone(), connection_id, table)
            .with_options(Value::Object(options))
            .in_zone(zone);
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.plugin_name.is_empty() {
            return Err(CollectError::InvalidParams("plugin name is empty".into()));
        }
        if self.connection_id.is_empty() {
            return Err(CollectError::InvalidParams("connection id is empty".into()));
        }
        if !self.options.is_object() {
            return Err(CollectError::InvalidParams("options must be a JSON object".into()));
        }
        validate_raw_table_name(&self.table)
            .map_err(|e| CollectError::InvalidParams(e.to_string()))
    }

    /// Canonical JSON form: fixed field order, object keys sorted.
    pub fn canonical_json(&self) -> String {
        let options = sorted(&self.options);
        let canonical = Canonical {
            plugin: &self.plugin_name,
            connection: &self.connection_id,
            table: &self.table,
            options: &options,
            zone: self.zone.name(),
        };
        // A struct of strings and a Value cannot fail to serialize.
        serde_json::to_string(&canonical).unwrap_or_default()
    }

    /// Stable key identifying these params in checkpoint and raw storage.
    pub fn params_key(&self) -> String {
        blake3::hash(self.canonical_json().as_bytes()).to_hex().to_string()
    }

    /// Hash of the options alone, for log lines.
    pub fn options_hash(&self) -> String {
        let json = serde_json::to_string(&sorted(&self.options)).unwrap_or_default();
        let hex = blake3::hash(json.as_bytes()).to_hex();
        hex[..12].to_string()
    }
}

/// Rebuild objects with keys inserted in sorted order, so the output does not
/// depend on whether serde_json preserves insertion order.
fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            Value::Object(
                keys.into_iter()
                    .map(|k| (k.clone(), sorted(&map[k])))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}
