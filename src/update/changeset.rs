use crate::error::Result;
use crate::model::actor::NewChangesetActor;
use crate::model::changeset::{Changeset, NewChangeset};
use crate::model::enums::OpStatus;
use crate::schema::{changeset_actors, changesets};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

pub fn create(conn: &mut SqliteConnection, new: NewChangeset) -> Result<Changeset> {
    diesel::insert_into(changesets::table)
        .values(new)
        .returning(Changeset::as_returning())
        .get_result(conn)
        .map_err(Into::into)
}

/// Creates an already-finalized changeset for a one-shot edit (API metadata
/// writes, collection refreshes). It never holds the in-progress slot, so it
/// may run alongside a scan. The id collision window is one millisecond;
/// callers retry.
pub fn create_auto(conn: &mut SqliteConnection, actor_ids: &[i64], message: Option<&str>) -> Result<Changeset> {
    let id = crate::time::now_ms();
    if get(conn, id).optional()?.is_some() {
        return Err(crate::error::Error::ChangesetIdCollision(id));
    }
    let changeset = create(
        conn,
        NewChangeset {
            id,
            message,
            status: OpStatus::Completed,
            data: None,
        },
    )?;
    add_actors(conn, id, actor_ids)?;
    Ok(changeset)
}

pub fn get(conn: &mut SqliteConnection, changeset_id: i64) -> QueryResult<Changeset> {
    changesets::table
        .find(changeset_id)
        .select(Changeset::as_select())
        .first(conn)
}

/// The changeset currently holding the global single-in-progress slot.
pub fn find_in_progress(conn: &mut SqliteConnection) -> Result<Option<Changeset>> {
    changesets::table
        .select(Changeset::as_select())
        .filter(changesets::status.eq(OpStatus::InProgress))
        .first(conn)
        .optional()
        .map_err(Into::into)
}

/// Binds actors to a changeset, ignoring ones already bound.
pub fn add_actors(conn: &mut SqliteConnection, changeset_id: i64, actor_ids: &[i64]) -> Result<usize> {
    if actor_ids.is_empty() {
        return Ok(0);
    }
    let existing: Vec<i64> = changeset_actors::table
        .select(changeset_actors::actor_id)
        .filter(changeset_actors::changeset_id.eq(changeset_id))
        .load(conn)?;
    let new_links: Vec<NewChangesetActor> = actor_ids
        .iter()
        .filter(|actor_id| !existing.contains(actor_id))
        .map(|&actor_id| NewChangesetActor {
            changeset_id,
            actor_id,
        })
        .collect();
    if new_links.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(changeset_actors::table)
        .values(&new_links)
        .execute(conn)
        .map_err(Into::into)
}

pub fn load_actor_ids(conn: &mut SqliteConnection, changeset_id: i64) -> Result<Vec<i64>> {
    changeset_actors::table
        .select(changeset_actors::actor_id)
        .filter(changeset_actors::changeset_id.eq(changeset_id))
        .order(changeset_actors::actor_id.asc())
        .load(conn)
        .map_err(Into::into)
}

pub fn save(conn: &mut SqliteConnection, changeset: &Changeset) -> Result<()> {
    diesel::update(changesets::table.find(changeset.id))
        .set(changeset)
        .execute(conn)?;
    Ok(())
}

/// Deletes a changeset. The metadata rows it owns go with it (enforced by
/// the cascading foreign key), which is the supported way to undo a run.
pub fn delete(conn: &mut SqliteConnection, changeset_id: i64) -> Result<usize> {
    diesel::delete(changesets::table.find(changeset_id))
        .execute(conn)
        .map_err(Into::into)
}

/// For resuming interrupted scans: the most recent PARTIAL changeset newer
/// than the actor's latest COMPLETED one, or that COMPLETED changeset when no
/// newer partial exists. `None` means no completed baseline (full scan).
pub fn find_partial_resume_point(conn: &mut SqliteConnection, actor_id: i64) -> Result<Option<Changeset>> {
    let history: Vec<Changeset> = changesets::table
        .inner_join(changeset_actors::table)
        .filter(changeset_actors::actor_id.eq(actor_id))
        .select(Changeset::as_select())
        .order(changesets::id.desc())
        .load(conn)?;

    let Some(last_full_index) = history.iter().position(|cs| cs.status == OpStatus::Completed) else {
        return Ok(None);
    };
    let newer_partial = history[..last_full_index]
        .iter()
        .find(|cs| cs.status == OpStatus::Partial);
    Ok(Some(
        newer_partial.unwrap_or(&history[last_full_index]).clone(),
    ))
}
