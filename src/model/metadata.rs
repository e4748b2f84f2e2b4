use crate::error::{Error, Result};
use crate::model::enums::MetadataType;
use crate::model::json::Json;
use crate::schema::{metadata, metadata_registry};
use crate::string::SmallString;
use crate::time::DateTime;
use diesel::prelude::*;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};

/// One typed metadata value. The discriminant is persisted alongside the
/// value so rows decode without consulting the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataValue {
    Text(SmallString),
    Int(i64),
    Float(f64),
    Datetime(DateTime),
    Json(Json),
    /// Reference to another asset.
    Relation(i64),
    /// Reference to an asset collection.
    Collection(i64),
}

impl MetadataValue {
    pub fn value_type(&self) -> MetadataType {
        match self {
            Self::Text(_) => MetadataType::String,
            Self::Int(_) => MetadataType::Int,
            Self::Float(_) => MetadataType::Float,
            Self::Datetime(_) => MetadataType::Datetime,
            Self::Json(_) => MetadataType::Json,
            Self::Relation(_) => MetadataType::Relation,
            Self::Collection(_) => MetadataType::Collection,
        }
    }

    /// Values that skip-false / clear-on-false policies treat as "off".
    pub fn is_falsey(&self) -> bool {
        matches!(self, Self::Int(0)) || matches!(self, Self::Float(value) if *value == 0.0)
    }

    /// Stable canonical encoding used for change detection and dedup. The
    /// type prefix keeps values of different types from colliding.
    pub fn fingerprint(&self) -> Fingerprint {
        let encoded = match self {
            Self::Text(text) => format!("s:{text}"),
            Self::Int(value) => format!("i:{value}"),
            Self::Float(value) => format!("f:{value}"),
            Self::Datetime(value) => format!("d:{}", value.to_rfc3339()),
            Self::Json(value) => format!("j:{}", value.canonical()),
            Self::Relation(id) => format!("r:{id}"),
            Self::Collection(id) => format!("c:{id}"),
        };
        Fingerprint(SmallString::new(encoded))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime> {
        match self {
            Self::Datetime(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&Json> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    /// Folds the typed value into plain JSON, for changeset data payloads and
    /// decoded row listings.
    pub fn to_json_value(&self) -> serde_json::Value {
        match self {
            Self::Text(text) => serde_json::Value::String(text.to_string()),
            Self::Int(value) => serde_json::Value::from(*value),
            Self::Float(value) => serde_json::Value::from(*value),
            Self::Datetime(value) => serde_json::Value::String(value.to_rfc3339()),
            Self::Json(value) => value.0.clone(),
            Self::Relation(id) | Self::Collection(id) => serde_json::Value::from(*id),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(SmallString::new(value))
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value.into())
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<DateTime> for MetadataValue {
    fn from(value: DateTime) -> Self {
        Self::Datetime(value)
    }
}

impl From<serde_json::Value> for MetadataValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(Json(value))
    }
}

/// Canonical encoding of a metadata value, comparable and hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(SmallString);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One observation of one key for one asset by one actor in one changeset.
/// `id`, `asset_id` and `changeset_id` stay unset while the observation is
/// staged and are bound during persistence.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub id: Option<i64>,
    pub asset_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub changeset_id: Option<i64>,
    pub key_id: i64,
    pub value_type: MetadataType,
    pub value: Option<MetadataValue>,
    pub removed: bool,
    pub confidence: Option<f64>,
}

impl Metadata {
    /// Canonical encoding of the carried value; `None` means "no value",
    /// which on a non-removed entry is a request to clear the key.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.value.as_ref().map(MetadataValue::fingerprint)
    }

    /// A tombstone for `entry`, carrying the value being erased, bound to the
    /// given changeset.
    pub fn tombstone_of(entry: &Metadata, changeset_id: i64) -> Metadata {
        Metadata {
            id: None,
            asset_id: entry.asset_id,
            actor_id: entry.actor_id,
            changeset_id: Some(changeset_id),
            key_id: entry.key_id,
            value_type: entry.value_type,
            value: entry.value.clone(),
            removed: true,
            confidence: None,
        }
    }

    pub(crate) fn to_row(&self) -> Result<NewMetadataRow<'_>> {
        let asset_id = self.asset_id.ok_or(Error::IncompleteMetadata("asset_id"))?;
        let actor_id = self.actor_id.ok_or(Error::IncompleteMetadata("actor_id"))?;
        let changeset_id = self
            .changeset_id
            .ok_or(Error::IncompleteMetadata("changeset_id"))?;

        let mut row = NewMetadataRow {
            asset_id,
            actor_id,
            changeset_id,
            metadata_key_id: self.key_id,
            value_type: self.value_type,
            value_text: None,
            value_int: None,
            value_real: None,
            value_datetime: None,
            value_json: None,
            value_relation_id: None,
            value_collection_id: None,
            removed: self.removed,
            confidence: self.confidence,
        };
        match &self.value {
            None => {}
            Some(MetadataValue::Text(text)) => row.value_text = Some(text.as_str()),
            Some(MetadataValue::Int(value)) => row.value_int = Some(*value),
            Some(MetadataValue::Float(value)) => row.value_real = Some(*value),
            Some(MetadataValue::Datetime(value)) => row.value_datetime = Some(*value),
            Some(MetadataValue::Json(value)) => row.value_json = Some(value),
            Some(MetadataValue::Relation(id)) => row.value_relation_id = Some(*id),
            Some(MetadataValue::Collection(id)) => row.value_collection_id = Some(*id),
        }
        Ok(row)
    }
}

#[derive(Debug, Clone, Queryable, QueryableByName, Selectable)]
#[diesel(table_name = metadata)]
#[diesel(check_for_backend(Sqlite))]
pub struct MetadataRow {
    pub id: i64,
    pub asset_id: i64,
    pub actor_id: i64,
    pub changeset_id: i64,
    pub metadata_key_id: i64,
    pub value_type: MetadataType,
    pub value_text: Option<String>,
    pub value_int: Option<i64>,
    pub value_real: Option<f64>,
    pub value_datetime: Option<DateTime>,
    pub value_json: Option<Json>,
    pub value_relation_id: Option<i64>,
    pub value_collection_id: Option<i64>,
    pub removed: bool,
    pub confidence: Option<f64>,
}

impl From<MetadataRow> for Metadata {
    fn from(row: MetadataRow) -> Self {
        let value = match row.value_type {
            MetadataType::String => row.value_text.map(MetadataValue::from),
            MetadataType::Int => row.value_int.map(MetadataValue::Int),
            MetadataType::Float => row.value_real.map(MetadataValue::Float),
            MetadataType::Datetime => row.value_datetime.map(MetadataValue::Datetime),
            MetadataType::Json => row.value_json.map(MetadataValue::Json),
            MetadataType::Relation => row.value_relation_id.map(MetadataValue::Relation),
            MetadataType::Collection => row.value_collection_id.map(MetadataValue::Collection),
        };
        Metadata {
            id: Some(row.id),
            asset_id: Some(row.asset_id),
            actor_id: Some(row.actor_id),
            changeset_id: Some(row.changeset_id),
            key_id: row.metadata_key_id,
            value_type: row.value_type,
            value,
            removed: row.removed,
            confidence: row.confidence,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = metadata)]
#[diesel(check_for_backend(Sqlite))]
pub struct NewMetadataRow<'a> {
    pub asset_id: i64,
    pub actor_id: i64,
    pub changeset_id: i64,
    pub metadata_key_id: i64,
    pub value_type: MetadataType,
    pub value_text: Option<&'a str>,
    pub value_int: Option<i64>,
    pub value_real: Option<f64>,
    pub value_datetime: Option<DateTime>,
    pub value_json: Option<&'a Json>,
    pub value_relation_id: Option<i64>,
    pub value_collection_id: Option<i64>,
    pub removed: bool,
    pub confidence: Option<f64>,
}

/// A synced registry row mapping a key string to its stable integer id.
#[derive(Debug, Clone, Identifiable, Queryable, Selectable)]
#[diesel(table_name = metadata_registry)]
#[diesel(check_for_backend(Sqlite))]
pub struct MetadataRegistryRow {
    pub id: i64,
    pub plugin_id: SmallString,
    pub key: SmallString,
    pub value_type: MetadataType,
    pub title: SmallString,
    pub description: String,
    pub width: Option<i32>,
}

#[derive(Insertable)]
#[diesel(table_name = metadata_registry)]
#[diesel(check_for_backend(Sqlite))]
pub struct NewMetadataRegistryRow<'a> {
    pub plugin_id: &'a str,
    pub key: &'a str,
    pub value_type: MetadataType,
    pub title: &'a str,
    pub description: &'a str,
    pub width: Option<i32>,
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprints_are_type_tagged() {
        assert_ne!(
            MetadataValue::Int(1).fingerprint(),
            MetadataValue::from("1").fingerprint()
        );
        assert_ne!(
            MetadataValue::Relation(5).fingerprint(),
            MetadataValue::Collection(5).fingerprint()
        );
    }

    #[test]
    fn json_fingerprint_ignores_key_order() {
        let left: serde_json::Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let right: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(
            MetadataValue::from(left).fingerprint(),
            MetadataValue::from(right).fingerprint()
        );
    }

    #[test]
    fn equal_lists_collapse() {
        let left = MetadataValue::from(json!(["a", "b"]));
        let right = MetadataValue::from(json!(["a", "b"]));
        assert_eq!(left.fingerprint(), right.fingerprint());
        assert_ne!(
            left.fingerprint(),
            MetadataValue::from(json!(["b", "a"])).fingerprint()
        );
    }

    #[test]
    fn falsey_values() {
        assert!(MetadataValue::Int(0).is_falsey());
        assert!(MetadataValue::Float(0.0).is_falsey());
        assert!(!MetadataValue::Int(1).is_falsey());
        assert!(!MetadataValue::from("").is_falsey());
        assert!(!MetadataValue::from(json!(0)).is_falsey());
    }
}
