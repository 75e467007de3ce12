use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Where a record lives and whether it leaves this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordScope {
    /// Persistent document content, mirrored into the replicated log.
    Document,
    /// Local live state (cursor, selection). Never mirrored.
    Session,
    /// Remote participants' ephemeral overlay. Never mirrored.
    Presence,
}

/// Record identifier of the form `<type>:<key>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(type_name: &str, key: &str) -> Self {
        Self(format!("{type_name}:{key}"))
    }

    /// Fresh id with a random key.
    pub fn unique(type_name: &str) -> Self {
        Self::new(type_name, &Uuid::new_v4().simple().to_string())
    }

    /// Wrap an already formatted id (e.g. a replicated log key).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The type prefix. Ids without a `:` are their own type name.
    pub fn type_name(&self) -> &str {
        self.0.split_once(':').map(|(t, _)| t).unwrap_or(&self.0)
    }

    pub fn key(&self) -> &str {
        self.0.split_once(':').map(|(_, k)| k).unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// A typed document entity.
///
/// `props` holds the type-specific fields; their shape is versioned per
/// record type by the store schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    #[serde(rename = "typeName")]
    pub type_name: String,
    pub props: Value,
}

impl Record {
    pub fn new(id: RecordId, props: Value) -> Self {
        let type_name = id.type_name().to_string();
        Self { id, type_name, props }
    }

    /// Shorthand for `Record::new(RecordId::new(type_name, key), props)`.
    pub fn with_key(type_name: &str, key: &str, props: Value) -> Self {
        Self::new(RecordId::new(type_name, key), props)
    }

    pub fn prop(&self, name: &str) -> Option<&Value> {
        self.props.get(name)
    }

    /// Encode as the JSON string mirrored into the replicated log.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_id_parts() {
        let id = RecordId::new("shape", "abc");
        assert_eq!(id.as_str(), "shape:abc");
        assert_eq!(id.type_name(), "shape");
        assert_eq!(id.key(), "abc");
    }

    #[test]
    fn test_record_id_without_separator() {
        let id = RecordId::from_raw("document");
        assert_eq!(id.type_name(), "document");
        assert_eq!(id.key(), "");
    }

    #[test]
    fn test_unique_ids_differ() {
        let a = RecordId::unique("shape");
        let b = RecordId::unique("shape");
        assert_ne!(a, b);
        assert_eq!(a.type_name(), "shape");
    }

    #[test]
    fn test_record_type_follows_id() {
        let rec = Record::with_key("page", "p1", json!({ "name": "Page 1" }));
        assert_eq!(rec.type_name, "page");
        assert_eq!(rec.prop("name"), Some(&json!("Page 1")));
    }

    #[test]
    fn test_record_json_shape() {
        let rec = Record::with_key("shape", "s1", json!({ "x": 10 }));
        let encoded = rec.to_json().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["id"], json!("shape:s1"));
        assert_eq!(value["typeName"], json!("shape"));
        assert_eq!(Record::from_json(&encoded).unwrap(), rec);
    }

    #[test]
    fn test_record_from_malformed_json() {
        assert!(Record::from_json("{\"id\": 4}").is_err());
        assert!(Record::from_json("not json").is_err());
    }
}
