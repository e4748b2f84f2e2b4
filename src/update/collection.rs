use crate::error::{Error, Result};
use crate::model::collection::{AssetCollection, NewAssetCollection};
use crate::model::enums::{MetadataType, RefreshMode};
use crate::model::json::Json;
use crate::model::metadata::{Metadata, MetadataValue};
use crate::registry::{COLLECTION_MEMBER, MetadataRegistry};
use crate::schema::asset_collections;
use crate::search::AssetQuery;
use crate::search::asset::asset_ids_for_query;
use crate::time::DateTime;
use crate::update::metadata::bulk_create;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel::sqlite::SqliteConnection;
use std::collections::HashSet;
use tracing::info;

pub fn create(
    conn: &mut SqliteConnection,
    registry: &MetadataRegistry,
    name: &str,
    description: Option<&str>,
    source: Option<&AssetQuery>,
    refresh_mode: RefreshMode,
) -> Result<AssetCollection> {
    let membership_key_id = registry.id_of(&COLLECTION_MEMBER)?;
    let source = source.map(|query| serde_json::to_value(query).map(Json)).transpose()?;
    let now = DateTime::now();
    diesel::insert_into(asset_collections::table)
        .values(NewAssetCollection {
            name,
            description,
            source: source.as_ref(),
            membership_key_id: Some(membership_key_id),
            item_count: 0,
            refresh_mode,
            created_at: now,
            updated_at: now,
        })
        .returning(AssetCollection::as_returning())
        .get_result(conn)
        .map_err(Into::into)
}

pub fn get(conn: &mut SqliteConnection, collection_id: i64) -> Result<AssetCollection> {
    asset_collections::table
        .find(collection_id)
        .select(AssetCollection::as_select())
        .first(conn)
        .optional()?
        .ok_or(Error::CollectionNotFound(collection_id))
}

pub fn save(conn: &mut SqliteConnection, collection: &AssetCollection) -> Result<()> {
    diesel::update(asset_collections::table.find(collection.id))
        .set(collection)
        .execute(conn)?;
    Ok(())
}

pub fn delete(conn: &mut SqliteConnection, collection_id: i64) -> Result<usize> {
    diesel::delete(asset_collections::table.find(collection_id))
        .execute(conn)
        .map_err(Into::into)
}

#[derive(QueryableByName)]
struct IdRow {
    #[diesel(sql_type = BigInt)]
    asset_id: i64,
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

/// Asset ids whose newest membership row for this collection is live.
pub fn active_member_ids(
    conn: &mut SqliteConnection,
    membership_key_id: i64,
    collection_id: i64,
) -> Result<Vec<i64>> {
    let rows: Vec<IdRow> = diesel::sql_query(
        "WITH latest AS (\
             SELECT m.asset_id, m.removed, \
                    ROW_NUMBER() OVER (\
                        PARTITION BY m.asset_id, m.value_collection_id \
                        ORDER BY m.changeset_id DESC, m.id DESC) AS rn \
             FROM metadata m \
             WHERE m.metadata_key_id = ? AND m.value_collection_id = ?) \
         SELECT asset_id FROM latest WHERE rn = 1 AND removed = 0",
    )
    .bind::<BigInt, _>(membership_key_id)
    .bind::<BigInt, _>(collection_id)
    .load(conn)?;
    Ok(rows.into_iter().map(|row| row.asset_id).collect())
}

/// Members whose membership was tombstoned by the given actor within one
/// changeset. Used to report what a refresh removed.
pub fn removed_member_ids(
    conn: &mut SqliteConnection,
    membership_key_id: i64,
    collection_id: i64,
    actor_id: i64,
    changeset_id: i64,
) -> Result<Vec<i64>> {
    use crate::schema::metadata;

    metadata::table
        .select(metadata::asset_id)
        .filter(metadata::metadata_key_id.eq(membership_key_id))
        .filter(metadata::value_collection_id.eq(collection_id))
        .filter(metadata::actor_id.eq(actor_id))
        .filter(metadata::changeset_id.eq(changeset_id))
        .filter(metadata::removed.eq(true))
        .order(metadata::asset_id.asc())
        .load(conn)
        .map_err(Into::into)
}

pub fn count_active_members(
    conn: &mut SqliteConnection,
    membership_key_id: i64,
    collection_id: i64,
) -> Result<i64> {
    let row: CountRow = diesel::sql_query(
        "WITH latest AS (\
             SELECT m.asset_id, m.removed, \
                    ROW_NUMBER() OVER (\
                        PARTITION BY m.asset_id, m.value_collection_id \
                        ORDER BY m.changeset_id DESC, m.id DESC) AS rn \
             FROM metadata m \
             WHERE m.metadata_key_id = ? AND m.value_collection_id = ?) \
         SELECT COUNT(*) AS count FROM latest WHERE rn = 1 AND removed = 0",
    )
    .bind::<BigInt, _>(membership_key_id)
    .bind::<BigInt, _>(collection_id)
    .get_result(conn)?;
    Ok(row.count)
}

fn membership_row(
    membership_key_id: i64,
    collection_id: i64,
    asset_id: i64,
    actor_id: i64,
    changeset_id: i64,
    removed: bool,
) -> Metadata {
    Metadata {
        id: None,
        asset_id: Some(asset_id),
        actor_id: Some(actor_id),
        changeset_id: Some(changeset_id),
        key_id: membership_key_id,
        value_type: MetadataType::Collection,
        value: Some(MetadataValue::Collection(collection_id)),
        removed,
        confidence: None,
    }
}

/// Refreshes a query-backed collection's membership from its stored query:
/// assets matching the query gain a membership row, live members that no
/// longer match are tombstoned. Returns `(added, removed)`.
pub fn refresh_members_for_query(
    conn: &mut SqliteConnection,
    registry: &MetadataRegistry,
    collection: &AssetCollection,
    query: &AssetQuery,
    actor_id: i64,
    changeset_id: i64,
) -> Result<(u64, u64)> {
    let membership_key_id = collection
        .membership_key_id
        .map_or_else(|| registry.id_of(&COLLECTION_MEMBER), Ok)?;

    let matched: HashSet<i64> = asset_ids_for_query(conn, registry, query)?.into_iter().collect();
    let active: HashSet<i64> = active_member_ids(conn, membership_key_id, collection.id)?
        .into_iter()
        .collect();

    let rows: Vec<Metadata> = matched
        .difference(&active)
        .map(|&asset_id| membership_row(membership_key_id, collection.id, asset_id, actor_id, changeset_id, false))
        .chain(
            active
                .difference(&matched)
                .map(|&asset_id| membership_row(membership_key_id, collection.id, asset_id, actor_id, changeset_id, true)),
        )
        .collect();
    let added = matched.difference(&active).count() as u64;
    let removed = active.difference(&matched).count() as u64;

    conn.transaction(|conn| -> Result<()> {
        bulk_create(conn, &rows)?;
        let item_count = count_active_members(conn, membership_key_id, collection.id)?;
        diesel::update(asset_collections::table.find(collection.id))
            .set((
                asset_collections::item_count.eq(item_count),
                asset_collections::updated_at.eq(DateTime::now()),
            ))
            .execute(conn)?;
        Ok(())
    })?;
    info!(
        collection_id = collection.id,
        added, removed, "Refreshed collection membership",
    );
    Ok((added, removed))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::FILE_SIZE;
    use crate::search::{AssetFilter, Criteria, FilterField};
    use crate::test::*;
    use crate::update::metadata::persist_changes;
    use serde_json::json;

    fn size_query(min: i64) -> AssetQuery {
        AssetQuery::filtered(vec![AssetFilter {
            field: FilterField::Metadata(FILE_SIZE),
            criteria: Criteria::GreaterEq(json!(min)),
            negated: false,
        }])
    }

    #[test]
    fn query_backed_membership_round_trip() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let registry = fx.catalog.registry();

        let big = fx.make_asset(&mut conn, "fs", "/big");
        let small = fx.make_asset(&mut conn, "fs", "/small");
        let first = fx.insert_changeset(&mut conn, 1000);
        for (asset, size) in [(&big, 5000i64), (&small, 10)] {
            let changes = fx.changes_for(asset, vec![], vec![fx.meta(&FILE_SIZE, Some(size.into()))]);
            persist_changes(&mut conn, &changes, first).unwrap();
        }

        let collection = create(
            &mut conn,
            registry,
            "large files",
            None,
            Some(&size_query(1000)),
            RefreshMode::OnDemand,
        )
        .unwrap();

        let (added, removed) =
            refresh_members_for_query(&mut conn, registry, &collection, &size_query(1000), fx.actor.id, first).unwrap();
        assert_eq!((added, removed), (1, 0));
        let membership_key_id = collection.membership_key_id.unwrap();
        assert_eq!(active_member_ids(&mut conn, membership_key_id, collection.id).unwrap(), vec![big.id]);
        assert_eq!(get(&mut conn, collection.id).unwrap().item_count, 1);

        // The big file shrinks; a later refresh tombstones its membership.
        let second = fx.insert_changeset(&mut conn, 1001);
        let loaded = crate::update::metadata::for_asset(&mut conn, big.id, true).unwrap();
        let changes = fx.changes_for(&big, loaded, vec![fx.meta(&FILE_SIZE, Some(1.into()))]);
        persist_changes(&mut conn, &changes, second).unwrap();

        let (added, removed) =
            refresh_members_for_query(&mut conn, registry, &collection, &size_query(1000), fx.actor.id, second).unwrap();
        assert_eq!((added, removed), (0, 1));
        assert!(active_member_ids(&mut conn, membership_key_id, collection.id).unwrap().is_empty());
        assert_eq!(get(&mut conn, collection.id).unwrap().item_count, 0);
        assert_eq!(
            removed_member_ids(&mut conn, membership_key_id, collection.id, fx.actor.id, second).unwrap(),
            vec![big.id],
        );
    }

    #[test]
    fn collection_names_are_unique() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let registry = fx.catalog.registry();
        create(&mut conn, registry, "dupes", None, None, RefreshMode::OnDemand).unwrap();
        assert!(create(&mut conn, registry, "dupes", None, None, RefreshMode::OnDemand).is_err());
    }
}
