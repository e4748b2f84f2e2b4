use crate::model::enums::ActorType;
use crate::model::json::Json;
use crate::schema::{actors, changeset_actors};
use crate::string::SmallString;
use crate::time::DateTime;
use diesel::prelude::*;
use diesel::sqlite::Sqlite;

/// A registered participant: a source, processor, analyzer, editor or
/// exporter. Two actors with the same `(type, identity_key)` are the same
/// logical actor regardless of their human-friendly name.
#[derive(Debug, Clone, AsChangeset, Identifiable, Queryable, Selectable)]
#[diesel(treat_none_as_null = true)]
#[diesel(table_name = actors)]
#[diesel(check_for_backend(Sqlite))]
pub struct Actor {
    pub id: i64,
    pub name: SmallString,
    pub plugin_id: Option<SmallString>,
    pub identity_key: Option<SmallString>,
    pub config: Option<Json>,
    pub type_: ActorType,
    pub disabled: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl Actor {
    /// Scheduling hints read from the actor config: an explicit `order`
    /// followed by a `_sequence` tiebreaker defaulting to the actor id.
    pub fn order_hint(&self) -> (i64, i64) {
        let field = |name: &str| {
            self.config
                .as_ref()
                .and_then(|config| config.get(name))
                .and_then(serde_json::Value::as_i64)
        };
        (field("order").unwrap_or(0), field("_sequence").unwrap_or(self.id))
    }

    pub fn config_value(&self) -> serde_json::Value {
        self.config
            .as_ref()
            .map(|config| config.0.clone())
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()))
    }
}

#[derive(Insertable)]
#[diesel(table_name = actors)]
#[diesel(check_for_backend(Sqlite))]
pub struct NewActor<'a> {
    pub name: &'a str,
    pub plugin_id: Option<&'a str>,
    pub identity_key: Option<&'a str>,
    pub config: Option<&'a Json>,
    pub type_: ActorType,
    pub disabled: bool,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Associations, Identifiable, Queryable, Selectable)]
#[diesel(belongs_to(Actor))]
#[diesel(table_name = changeset_actors)]
#[diesel(check_for_backend(Sqlite))]
pub struct ChangesetActor {
    pub id: i64,
    pub changeset_id: i64,
    pub actor_id: i64,
}

#[derive(Insertable)]
#[diesel(table_name = changeset_actors)]
#[diesel(check_for_backend(Sqlite))]
pub struct NewChangesetActor {
    pub changeset_id: i64,
    pub actor_id: i64,
}
