use crate::changes::MetadataChanges;
use crate::error::{Error, Result};
use crate::model::enums::MetadataType;
use crate::model::metadata::{Metadata, MetadataRow, MetadataValue, NewMetadataRow};
use crate::registry::{ASSET_LOST, ASSET_SEARCH_DOC, MetadataRegistry};
use crate::schema::{asset_search, metadata};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use std::collections::{HashMap, HashSet};

/// Full metadata history of one asset, oldest row first per key.
pub fn for_asset(conn: &mut SqliteConnection, asset_id: i64, include_removed: bool) -> Result<Vec<Metadata>> {
    let mut query = metadata::table
        .select(MetadataRow::as_select())
        .filter(metadata::asset_id.eq(asset_id))
        .order((metadata::metadata_key_id.asc(), metadata::id.asc()))
        .into_boxed();
    if !include_removed {
        query = query.filter(metadata::removed.eq(false));
    }
    let rows: Vec<MetadataRow> = query.load(conn)?;
    Ok(rows.into_iter().map(Metadata::from).collect())
}

/// Bulk-loads metadata for many assets in one query.
pub fn for_assets(
    conn: &mut SqliteConnection,
    asset_ids: &[i64],
    include_removed: bool,
) -> Result<HashMap<i64, Vec<Metadata>>> {
    if asset_ids.is_empty() {
        return Ok(HashMap::new());
    }
    let mut query = metadata::table
        .select(MetadataRow::as_select())
        .filter(metadata::asset_id.eq_any(asset_ids))
        .order((metadata::asset_id.asc(), metadata::metadata_key_id.asc(), metadata::id.asc()))
        .into_boxed();
    if !include_removed {
        query = query.filter(metadata::removed.eq(false));
    }
    let rows: Vec<MetadataRow> = query.load(conn)?;
    let mut grouped: HashMap<i64, Vec<Metadata>> = HashMap::new();
    for row in rows {
        grouped.entry(row.asset_id).or_default().push(row.into());
    }
    Ok(grouped)
}

/// Appends rows to the metadata log. This is the only insertion path; rows
/// are never updated in place.
pub fn bulk_create(conn: &mut SqliteConnection, entries: &[Metadata]) -> Result<usize> {
    if entries.is_empty() {
        return Ok(0);
    }
    let rows: Vec<NewMetadataRow<'_>> = entries.iter().map(Metadata::to_row).collect::<Result<_>>()?;
    diesel::insert_into(metadata::table)
        .values(&rows)
        .execute(conn)
        .map_err(Into::into)
}

/// Rows produced by `prepare_persist`, split by destination: the metadata
/// log, search-document upserts and search-document deletes.
struct RoutedRows {
    normal: Vec<Metadata>,
    search_upserts: Vec<(i64, String)>,
    search_deletes: Vec<i64>,
}

/// `asset/search_doc` entries never land in the metadata log; they become
/// upserts or deletes against the full-text companion table.
fn route_rows(registry: &MetadataRegistry, entries: Vec<Metadata>) -> Result<RoutedRows> {
    let search_doc_id = registry.id_of(&ASSET_SEARCH_DOC)?;
    let mut routed = RoutedRows {
        normal: Vec::new(),
        search_upserts: Vec::new(),
        search_deletes: Vec::new(),
    };
    for entry in entries {
        if entry.key_id != search_doc_id {
            routed.normal.push(entry);
            continue;
        }
        let asset_id = entry.asset_id.ok_or(Error::IncompleteMetadata("asset_id"))?;
        match (&entry.value, entry.removed) {
            (Some(MetadataValue::Text(doc)), false) => {
                routed.search_upserts.push((asset_id, doc.to_string()));
            }
            _ => routed.search_deletes.push(asset_id),
        }
    }
    Ok(routed)
}

fn write_routed(conn: &mut SqliteConnection, routed: &RoutedRows) -> Result<()> {
    bulk_create(conn, &routed.normal)?;
    for (asset_id, doc) in &routed.search_upserts {
        diesel::replace_into(asset_search::table)
            .values((asset_search::rowid.eq(asset_id), asset_search::doc.eq(doc)))
            .execute(conn)?;
    }
    if !routed.search_deletes.is_empty() {
        diesel::delete(asset_search::table.filter(asset_search::rowid.eq_any(&routed.search_deletes)))
            .execute(conn)?;
    }
    Ok(())
}

/// Persists one asset's staged changes in a single transaction, loading the
/// authoritative metadata snapshot first. Returns the affected key ids.
pub fn persist_changes(
    conn: &mut SqliteConnection,
    changes: &MetadataChanges,
    changeset_id: i64,
) -> Result<HashSet<i64>> {
    conn.transaction(|conn| {
        let existing = for_asset(conn, changes.asset().id, true)?;
        let (to_create, changed_keys) = changes.prepare_persist(changeset_id, &existing)?;
        if to_create.is_empty() {
            return Ok(changed_keys);
        }
        let routed = route_rows(changes.registry(), to_create)?;
        write_routed(conn, &routed)?;
        Ok(changed_keys)
    })
}

/// Persists a batch of per-asset change sets inside one transaction, using
/// pre-fetched snapshots. A failure rolls the whole batch back. Returns
/// `(log_rows, search_upserts, search_deletes)`.
pub fn persist_changes_batch(
    conn: &mut SqliteConnection,
    changeset_id: i64,
    changes_list: &[MetadataChanges],
    existing_by_asset: &HashMap<i64, Vec<Metadata>>,
) -> Result<(usize, usize, usize)> {
    conn.transaction(|conn| {
        let mut normal = 0;
        let mut upserts = 0;
        let mut deletes = 0;
        for changes in changes_list {
            let asset_id = changes.asset().id;
            let empty = Vec::new();
            let existing = existing_by_asset.get(&asset_id).unwrap_or(&empty);
            let (to_create, _changed) = changes.prepare_persist(changeset_id, existing)?;
            if to_create.is_empty() {
                continue;
            }
            let routed = route_rows(changes.registry(), to_create)?;
            write_routed(conn, &routed)?;
            normal += routed.normal.len();
            upserts += routed.search_upserts.len();
            deletes += routed.search_deletes.len();
        }
        Ok((normal, upserts, deletes))
    })
}

/// For each actor, writes an `asset/lost = 1` marker for every asset the
/// actor has previously touched but did not see in this scan. Returns the
/// number of markers written.
pub fn mark_unseen_as_lost(
    conn: &mut SqliteConnection,
    registry: &MetadataRegistry,
    changeset_id: i64,
    actor_ids: &[i64],
    seen_asset_ids: &HashSet<i64>,
) -> Result<u64> {
    if actor_ids.is_empty() {
        return Ok(0);
    }
    let lost_key_id = registry.id_of(&ASSET_LOST)?;
    let seen: Vec<i64> = seen_asset_ids.iter().copied().collect();

    let mut affected = 0u64;
    for &actor_id in actor_ids {
        let unseen: Vec<i64> = metadata::table
            .select(metadata::asset_id)
            .distinct()
            .filter(metadata::actor_id.eq(actor_id))
            .filter(metadata::asset_id.ne_all(&seen))
            .load(conn)?;
        if unseen.is_empty() {
            continue;
        }
        let markers: Vec<Metadata> = unseen
            .iter()
            .map(|&asset_id| Metadata {
                id: None,
                asset_id: Some(asset_id),
                actor_id: Some(actor_id),
                changeset_id: Some(changeset_id),
                key_id: lost_key_id,
                value_type: MetadataType::Int,
                value: Some(MetadataValue::Int(1)),
                removed: false,
                confidence: None,
            })
            .collect();
        affected += bulk_create(conn, &markers)? as u64;
    }
    Ok(affected)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::{FILE_NAME, FILE_SIZE};
    use crate::test::*;

    #[test]
    fn first_observation_persists_typed_rows() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let changeset_id = fx.insert_changeset(&mut conn, 1000);

        let changes = fx.changes_for(
            &fx.asset,
            vec![],
            vec![
                fx.meta(&FILE_NAME, Some("foo.txt".into())),
                fx.meta(&FILE_SIZE, Some(42.into())),
            ],
        );
        let changed = persist_changes(&mut conn, &changes, changeset_id).unwrap();
        assert_eq!(changed.len(), 2);

        let stored = for_asset(&mut conn, fx.asset.id, true).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|entry| entry.changeset_id == Some(changeset_id)));
        assert!(stored.iter().all(|entry| !entry.removed));
        let size = stored
            .iter()
            .find(|entry| entry.key_id == fx.key_id(&FILE_SIZE))
            .unwrap();
        assert_eq!(size.value, Some(MetadataValue::Int(42)));
    }

    #[test]
    fn rescan_with_same_values_writes_nothing() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let first = fx.insert_changeset(&mut conn, 1000);
        let changes = fx.changes_for(&fx.asset, vec![], vec![fx.meta(&FILE_NAME, Some("foo.txt".into()))]);
        persist_changes(&mut conn, &changes, first).unwrap();

        let second = fx.insert_changeset(&mut conn, 1001);
        let loaded = for_asset(&mut conn, fx.asset.id, true).unwrap();
        let rescan = fx.changes_for(&fx.asset, loaded, vec![fx.meta(&FILE_NAME, Some("foo.txt".into()))]);
        let changed = persist_changes(&mut conn, &rescan, second).unwrap();
        assert!(changed.is_empty());
        assert_eq!(for_asset(&mut conn, fx.asset.id, true).unwrap().len(), 1);
    }

    #[test]
    fn search_doc_rows_bypass_the_log() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let changeset_id = fx.insert_changeset(&mut conn, 1000);

        let changes = fx.changes_for(
            &fx.asset,
            vec![],
            vec![fx.meta(&ASSET_SEARCH_DOC, Some("quarterly report draft".into()))],
        );
        persist_changes(&mut conn, &changes, changeset_id).unwrap();

        assert!(for_asset(&mut conn, fx.asset.id, true).unwrap().is_empty());
        let docs: Vec<String> = asset_search::table.select(asset_search::doc).load(&mut conn).unwrap();
        assert_eq!(docs, vec!["quarterly report draft".to_owned()]);

        // A clear request deletes the search row.
        let clear = fx.changes_for(&fx.asset, vec![], vec![fx.meta(&ASSET_SEARCH_DOC, None)]);
        persist_changes(&mut conn, &clear, changeset_id).unwrap();
        let count: i64 = asset_search::table.count().get_result(&mut conn).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn lost_markers_target_only_unseen_assets() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let first = fx.insert_changeset(&mut conn, 2000);

        let asset_x = fx.make_asset(&mut conn, "fs", "/tmp/x");
        let asset_y = fx.make_asset(&mut conn, "fs", "/tmp/y");
        for asset in [&asset_x, &asset_y] {
            let changes = fx.changes_for(asset, vec![], vec![fx.meta(&FILE_NAME, Some("name".into()))]);
            persist_changes(&mut conn, &changes, first).unwrap();
        }

        let second = fx.insert_changeset(&mut conn, 2001);
        let seen: HashSet<i64> = [asset_x.id].into_iter().collect();
        let lost = mark_unseen_as_lost(
            &mut conn,
            fx.catalog.registry(),
            second,
            &[fx.actor.id],
            &seen,
        )
        .unwrap();
        assert_eq!(lost, 1);

        let lost_key = fx.key_id(&ASSET_LOST);
        let y_rows = for_asset(&mut conn, asset_y.id, true).unwrap();
        let marker = y_rows.iter().find(|entry| entry.key_id == lost_key).unwrap();
        assert_eq!(marker.value, Some(MetadataValue::Int(1)));
        assert_eq!(marker.changeset_id, Some(second));
        assert_eq!(marker.actor_id, Some(fx.actor.id));

        let x_rows = for_asset(&mut conn, asset_x.id, true).unwrap();
        assert!(x_rows.iter().all(|entry| entry.key_id != lost_key));
    }

    #[test]
    fn batch_persist_rolls_back_on_failure() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let changeset_id = fx.insert_changeset(&mut conn, 1000);

        // Second change set references an asset id that violates the metadata
        // foreign key, so the whole batch must roll back.
        let good = fx.changes_for(&fx.asset, vec![], vec![fx.meta(&FILE_NAME, Some("ok".into()))]);
        let mut bogus_asset = fx.asset.clone();
        bogus_asset.id = 999_999;
        let bad = fx.changes_for(&bogus_asset, vec![], vec![fx.meta(&FILE_NAME, Some("bad".into()))]);

        let result = persist_changes_batch(
            &mut conn,
            changeset_id,
            &[good, bad],
            &HashMap::new(),
        );
        assert!(result.is_err());
        assert!(for_asset(&mut conn, fx.asset.id, true).unwrap().is_empty());
    }
}
