use crate::error::Result;
use crate::model::actor::{Actor, NewActor};
use crate::model::enums::ActorType;
use crate::model::json::Json;
use crate::plugin::registry::identity_key;
use crate::schema::actors;
use crate::time::DateTime;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

/// Creates an actor, or returns the existing one sharing its computed
/// `(type, identity_key)`. Names are labels, not identity.
pub fn create(
    conn: &mut SqliteConnection,
    name: &str,
    actor_type: ActorType,
    plugin_id: Option<&str>,
    config: Option<serde_json::Value>,
) -> Result<Actor> {
    let config = config.map(Json);
    let identity = plugin_id.map(|plugin_id| {
        identity_key(
            actor_type,
            plugin_id,
            config.as_deref().unwrap_or(&serde_json::Value::Null),
        )
    });

    if let Some(identity) = &identity {
        let existing: Option<Actor> = actors::table
            .select(Actor::as_select())
            .filter(actors::type_.eq(actor_type))
            .filter(actors::identity_key.eq(identity.as_str()))
            .first(conn)
            .optional()?;
        if let Some(actor) = existing {
            return Ok(actor);
        }
    }

    let now = DateTime::now();
    let actor = diesel::insert_into(actors::table)
        .values(NewActor {
            name,
            plugin_id,
            identity_key: identity.as_deref(),
            config: config.as_ref(),
            type_: actor_type,
            disabled: false,
            created_at: now,
            updated_at: now,
        })
        .returning(Actor::as_returning())
        .get_result(conn)?;
    Ok(actor)
}

pub fn get(conn: &mut SqliteConnection, actor_id: i64) -> Result<Actor> {
    actors::table
        .find(actor_id)
        .select(Actor::as_select())
        .first(conn)
        .map_err(Into::into)
}

/// Enabled actors of one type, ordered by id.
pub fn list_enabled(conn: &mut SqliteConnection, actor_type: ActorType) -> Result<Vec<Actor>> {
    actors::table
        .select(Actor::as_select())
        .filter(actors::type_.eq(actor_type))
        .filter(actors::disabled.eq(false))
        .order(actors::id.asc())
        .load(conn)
        .map_err(Into::into)
}

/// Enabled actors of one type restricted to the given ids, ordered by id.
pub fn list_enabled_by_ids(
    conn: &mut SqliteConnection,
    actor_type: ActorType,
    actor_ids: &[i64],
) -> Result<Vec<Actor>> {
    actors::table
        .select(Actor::as_select())
        .filter(actors::type_.eq(actor_type))
        .filter(actors::disabled.eq(false))
        .filter(actors::id.eq_any(actor_ids))
        .order(actors::id.asc())
        .load(conn)
        .map_err(Into::into)
}

pub fn set_disabled(conn: &mut SqliteConnection, actor_id: i64, disabled: bool) -> Result<()> {
    diesel::update(actors::table.find(actor_id))
        .set((actors::disabled.eq(disabled), actors::updated_at.eq(DateTime::now())))
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;
    use serde_json::json;

    #[test]
    fn same_identity_collapses_to_one_actor() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let first = create(
            &mut conn,
            "drive scanner",
            ActorType::Source,
            Some("katalog.sources.fs"),
            Some(json!({"root": "/data"})),
        )
        .unwrap();
        let second = create(
            &mut conn,
            "a different name",
            ActorType::Source,
            Some("katalog.sources.fs"),
            Some(json!({"root": "/data"})),
        )
        .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name.as_str(), "drive scanner");

        let third = create(
            &mut conn,
            "other root",
            ActorType::Source,
            Some("katalog.sources.fs"),
            Some(json!({"root": "/other"})),
        )
        .unwrap();
        assert_ne!(first.id, third.id);
    }
}
