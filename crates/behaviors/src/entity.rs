//! Entity abstraction used by listeners
//!
//! Listeners never see concrete entity types. They read and write fields
//! through [`Entity`], with values represented as `serde_json::Value` the same
//! way models expose themselves through `to_fields()`.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BehaviorResult;

/// Field name to value map
pub type Fields = BTreeMap<String, Value>;

/// Dynamic field access over a persistent object
pub trait Entity: Debug + Send + Sync {
    /// Mapped class this instance belongs to
    fn class_name(&self) -> &str;

    /// Current value of a field, `None` when the object has no such field
    fn field(&self, name: &str) -> Option<Value>;

    /// Overwrite a field value
    fn set_field(&mut self, name: &str, value: Value) -> BehaviorResult<()>;

    /// Snapshot of every field the object carries
    fn to_fields(&self) -> Fields;
}

/// Schemaless entity holding its fields in a map
///
/// Used for companion rows (log entries) and for objects rehydrated from
/// storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    class: String,
    fields: Fields,
}

impl Record {
    /// Create an empty record of the given class
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            fields: Fields::new(),
        }
    }

    /// Create a record from stored fields
    pub fn from_fields(class: impl Into<String>, fields: Fields) -> Self {
        Self {
            class: class.into(),
            fields,
        }
    }

    /// Builder-style field assignment
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Borrow the field map
    pub fn fields(&self) -> &Fields {
        &self.fields
    }
}

impl Entity for Record {
    fn class_name(&self) -> &str {
        &self.class
    }

    fn field(&self, name: &str) -> Option<Value> {
        self.fields.get(name).cloned()
    }

    fn set_field(&mut self, name: &str, value: Value) -> BehaviorResult<()> {
        self.fields.insert(name.to_string(), value);
        Ok(())
    }

    fn to_fields(&self) -> Fields {
        self.fields.clone()
    }
}

/// Whether a value counts as "not set" for behaviors that only fill blanks
pub fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}

/// Render a scalar value as plain text
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_field_access() {
        let mut record = Record::new("app::Article").with("title", "Title");
        assert_eq!(record.class_name(), "app::Article");
        assert_eq!(record.field("title"), Some(json!("Title")));
        assert_eq!(record.field("missing"), None);

        record.set_field("title", json!("New")).unwrap();
        assert_eq!(record.to_fields().get("title"), Some(&json!("New")));
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(None));
        assert!(is_blank(Some(&Value::Null)));
        assert!(is_blank(Some(&json!(""))));
        assert!(!is_blank(Some(&json!(0))));
        assert!(!is_blank(Some(&json!("x"))));
    }

    #[test]
    fn test_value_to_text() {
        assert_eq!(value_to_text(&json!("abc")), Some("abc".to_string()));
        assert_eq!(value_to_text(&json!(42)), Some("42".to_string()));
        assert_eq!(value_to_text(&Value::Null), None);
    }
}
