use diesel::deserialize::{self, FromSql, FromSqlRow};
use diesel::expression::AsExpression;
use diesel::serialize::{self, IsNull, Output, ToSql};
use diesel::sql_types::Text;
use diesel::sqlite::{Sqlite, SqliteValue};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

// JSON payload stored as canonical text: object keys sorted, compact
// separators. serde_json's default map is ordered, so serializing a Value is
// already canonical; equality of two payloads is equality of their encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, AsExpression, FromSqlRow)]
#[diesel(sql_type = Text)]
#[serde(transparent)]
pub struct Json(pub serde_json::Value);

impl Json {
    pub fn object() -> Self {
        Self(serde_json::Value::Object(serde_json::Map::new()))
    }

    /// The canonical encoding this value is stored and compared as.
    pub fn canonical(&self) -> String {
        self.0.to_string()
    }
}

impl Deref for Json {
    type Target = serde_json::Value;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Json {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<serde_json::Value> for Json {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

impl ToSql<Text, Sqlite> for Json {
    fn to_sql<'a>(&'a self, out: &mut Output<'a, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.canonical());
        Ok(IsNull::No)
    }
}

impl FromSql<Text, Sqlite> for Json {
    fn from_sql(value: SqliteValue<'_, '_, '_>) -> deserialize::Result<Self> {
        let text = <String as FromSql<Text, Sqlite>>::from_sql(value)?;
        serde_json::from_str(&text).map(Json).map_err(Box::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_encoding_sorts_keys() {
        let scrambled: serde_json::Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(Json(scrambled).canonical(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn canonical_encoding_is_compact() {
        let value = json!({"list": [1, 2], "nested": {"y": null, "x": true}});
        assert_eq!(Json(value).canonical(), r#"{"list":[1,2],"nested":{"x":true,"y":null}}"#);
    }
}
