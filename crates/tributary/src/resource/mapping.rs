use serde::Deserialize;
use serde_json::Value;

use crate::record::{self, DELETED_KEY, Record};

/// Declares which properties of an upstream object end up in the output.
///
/// ```toml
/// [resources.mapping]
/// fields = ["email", "currency"]
/// timestamps = ["created"]
/// flatten = ["metadata"]
/// references = ["default_source"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FieldMapping {
    /// Copied verbatim, `null` when absent.
    pub fields: Vec<String>,
    /// Unix seconds rendered as `YYYY-MM-DDTHH:MM:SS.000Z`, `null` when absent.
    pub timestamps: Vec<String>,
    /// Nested maps flattened into `<name>_<key>` properties.
    pub flatten: Vec<String>,
    /// Nested objects (or bare id strings) stored as `<name>_id`.
    pub references: Vec<String>,
}

impl FieldMapping {
    /// Transform `object` into `(id, properties)`.
    ///
    /// Objects without an id produce nothing.
    pub fn apply(&self, object: &Record) -> Option<(String, Record)> {
        let id = record::get_str(object, "id").filter(|id| !id.is_empty())?;

        let mut properties = Record::new();
        properties.insert("id".to_string(), Value::String(id.to_string()));

        for field in &self.fields {
            properties.insert(field.clone(), object.get(field).cloned().unwrap_or(Value::Null));
        }

        for field in &self.timestamps {
            let value = record::get_timestamp(object, field).map_or(Value::Null, Value::String);
            properties.insert(field.clone(), value);
        }

        for field in &self.flatten {
            if let Some(nested) = record::get_map(object, field) {
                record::flatten_into(nested, &format!("{field}_"), &mut properties);
            }
        }

        for field in &self.references {
            let reference = match object.get(field) {
                Some(Value::String(id)) => Some(id.as_str()),
                Some(Value::Object(nested)) => record::get_str(nested, "id"),
                _ => None,
            };
            properties.insert(
                format!("{field}_id"),
                reference.map_or(Value::Null, |id| Value::String(id.to_string())),
            );
        }

        if record::get_bool(object, DELETED_KEY) {
            properties.insert(DELETED_KEY.to_string(), Value::Bool(true));
        }

        Some((id.to_string(), properties))
    }
}
