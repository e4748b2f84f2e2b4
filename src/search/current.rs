use crate::error::Result;
use crate::model::asset::Asset;
use crate::model::metadata::{Metadata, MetadataRow};
use crate::registry::{MetadataKey, MetadataRegistry};
use crate::schema::{assets, metadata};
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use std::collections::HashMap;

/// Latest live metadata per `(asset, key)` for the given assets and keys.
///
/// Shadow assets (those with a canonical pointer) are answered from their
/// canonical asset's log. The reconstruction picks, per key, the newest
/// non-tombstone changeset and the newest row within it.
pub fn current_metadata(
    conn: &mut SqliteConnection,
    asset_ids: &[i64],
    key_ids: &[i64],
) -> Result<HashMap<(i64, i64), Metadata>> {
    if asset_ids.is_empty() || key_ids.is_empty() {
        return Ok(HashMap::new());
    }

    // Resolve the canonical-merge redirection first.
    let loaded: Vec<Asset> = assets::table
        .select(Asset::as_select())
        .filter(assets::id.eq_any(asset_ids))
        .load(conn)?;
    let effective_of: HashMap<i64, i64> = loaded
        .iter()
        .map(|asset| (asset.id, asset.effective_id()))
        .collect();
    let mut effective_ids: Vec<i64> = effective_of.values().copied().collect();
    effective_ids.sort_unstable();
    effective_ids.dedup();

    let asset_placeholders: Vec<&str> = effective_ids.iter().map(|_| "?").collect();
    let key_placeholders: Vec<&str> = key_ids.iter().map(|_| "?").collect();
    let sql = format!(
        "WITH latest_snap AS (\
             SELECT m.asset_id, m.metadata_key_id, MAX(m.changeset_id) AS changeset_id \
             FROM metadata m \
             WHERE m.removed = 0 \
               AND m.asset_id IN ({assets}) \
               AND m.metadata_key_id IN ({keys}) \
             GROUP BY m.asset_id, m.metadata_key_id), \
         latest_id AS (\
             SELECT m.asset_id, m.metadata_key_id, MAX(m.id) AS id \
             FROM metadata m \
             JOIN latest_snap ls \
               ON ls.asset_id = m.asset_id \
              AND ls.metadata_key_id = m.metadata_key_id \
              AND ls.changeset_id = m.changeset_id \
             WHERE m.removed = 0 \
             GROUP BY m.asset_id, m.metadata_key_id) \
         SELECT m.* FROM metadata m JOIN latest_id li ON li.id = m.id",
        assets = asset_placeholders.join(", "),
        keys = key_placeholders.join(", "),
    );
    let mut query = diesel::sql_query(sql).into_boxed();
    for &asset_id in &effective_ids {
        query = query.bind::<BigInt, _>(asset_id);
    }
    for &key_id in key_ids {
        query = query.bind::<BigInt, _>(key_id);
    }
    let rows: Vec<MetadataRow> = query.load(conn)?;

    let mut by_effective: HashMap<(i64, i64), Metadata> = HashMap::new();
    for row in rows {
        by_effective.insert((row.asset_id, row.metadata_key_id), row.into());
    }

    let mut result = HashMap::new();
    for &asset_id in asset_ids {
        let Some(&effective_id) = effective_of.get(&asset_id) else {
            continue;
        };
        for &key_id in key_ids {
            if let Some(entry) = by_effective.get(&(effective_id, key_id)) {
                result.insert((asset_id, key_id), entry.clone());
            }
        }
    }
    Ok(result)
}

/// One decoded row of a changeset's metadata listing.
#[derive(Debug, Serialize)]
pub struct ChangesetMetadataChange {
    pub id: i64,
    pub asset_id: i64,
    pub actor_id: i64,
    pub key: MetadataKey,
    pub value: serde_json::Value,
    pub removed: bool,
    pub confidence: Option<f64>,
}

pub struct ChangesetMetadataPage {
    pub items: Vec<ChangesetMetadataChange>,
    pub total: Option<i64>,
}

/// Paginated, decoded listing of the metadata rows one changeset wrote.
pub fn list_changeset_metadata_changes(
    conn: &mut SqliteConnection,
    registry: &MetadataRegistry,
    changeset_id: i64,
    offset: i64,
    limit: i64,
    include_total: bool,
) -> Result<ChangesetMetadataPage> {
    if offset < 0 || limit < 0 {
        return Err(crate::error::Error::InvalidQuery(
            "offset and limit must be non-negative".into(),
        ));
    }
    let rows: Vec<MetadataRow> = metadata::table
        .select(MetadataRow::as_select())
        .filter(metadata::changeset_id.eq(changeset_id))
        .order(metadata::id.asc())
        .offset(offset)
        .limit(limit)
        .load(conn)?;

    let mut items = Vec::with_capacity(rows.len());
    for row in rows {
        let entry: Metadata = row.into();
        let key = registry.key_of(entry.key_id)?.clone();
        items.push(ChangesetMetadataChange {
            id: entry.id.unwrap_or_default(),
            asset_id: entry.asset_id.unwrap_or_default(),
            actor_id: entry.actor_id.unwrap_or_default(),
            key,
            value: entry
                .value
                .as_ref()
                .map(|value| value.to_json_value())
                .unwrap_or(serde_json::Value::Null),
            removed: entry.removed,
            confidence: entry.confidence,
        });
    }

    let total = if include_total {
        Some(
            metadata::table
                .filter(metadata::changeset_id.eq(changeset_id))
                .count()
                .get_result(conn)?,
        )
    } else {
        None
    };
    Ok(ChangesetMetadataPage { items, total })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::{FILE_NAME, FILE_SIZE};
    use crate::test::*;
    use crate::update::metadata::{for_asset, persist_changes};

    #[test]
    fn latest_row_wins_per_key() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let size_key = fx.key_id(&FILE_SIZE);
        let name_key = fx.key_id(&FILE_NAME);

        let first = fx.insert_changeset(&mut conn, 1000);
        let changes = fx.changes_for(
            &fx.asset,
            vec![],
            vec![
                fx.meta(&FILE_SIZE, Some(42.into())),
                fx.meta(&FILE_NAME, Some("foo.txt".into())),
            ],
        );
        persist_changes(&mut conn, &changes, first).unwrap();

        let second = fx.insert_changeset(&mut conn, 1001);
        let loaded = for_asset(&mut conn, fx.asset.id, true).unwrap();
        let changes = fx.changes_for(&fx.asset, loaded, vec![fx.meta(&FILE_SIZE, Some(100.into()))]);
        persist_changes(&mut conn, &changes, second).unwrap();

        let current = current_metadata(&mut conn, &[fx.asset.id], &[size_key, name_key]).unwrap();
        let size = current.get(&(fx.asset.id, size_key)).unwrap();
        assert_eq!(size.value.as_ref().and_then(|value| value.as_int()), Some(100));
        assert_eq!(size.changeset_id, Some(second));
        let name = current.get(&(fx.asset.id, name_key)).unwrap();
        assert_eq!(name.changeset_id, Some(first));
    }

    #[test]
    fn tombstoned_key_disappears() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let name_key = fx.key_id(&FILE_NAME);

        let first = fx.insert_changeset(&mut conn, 1000);
        let changes = fx.changes_for(&fx.asset, vec![], vec![fx.meta(&FILE_NAME, Some("foo".into()))]);
        persist_changes(&mut conn, &changes, first).unwrap();

        let second = fx.insert_changeset(&mut conn, 1001);
        let loaded = for_asset(&mut conn, fx.asset.id, true).unwrap();
        let clear = fx.changes_for(&fx.asset, loaded, vec![fx.meta(&FILE_NAME, None)]);
        persist_changes(&mut conn, &clear, second).unwrap();

        let current = current_metadata(&mut conn, &[fx.asset.id], &[name_key]).unwrap();
        assert!(current.is_empty());
    }

    #[test]
    fn shadow_assets_answer_from_canonical() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let name_key = fx.key_id(&FILE_NAME);

        let canonical = fx.make_asset(&mut conn, "fs", "/canonical");
        let shadow = fx.make_shadow_asset(&mut conn, "fs", "/shadow", canonical.id);

        let changeset_id = fx.insert_changeset(&mut conn, 1000);
        let changes = fx.changes_for(&canonical, vec![], vec![fx.meta(&FILE_NAME, Some("primary".into()))]);
        persist_changes(&mut conn, &changes, changeset_id).unwrap();

        let current = current_metadata(&mut conn, &[shadow.id], &[name_key]).unwrap();
        let entry = current.get(&(shadow.id, name_key)).unwrap();
        assert_eq!(entry.value.as_ref().and_then(|value| value.as_text().map(str::to_owned)), Some("primary".into()));
    }

    #[test]
    fn changeset_listing_decodes_rows() {
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
        persist_changes(&mut conn, &changes, changeset_id).unwrap();

        let page =
            list_changeset_metadata_changes(&mut conn, fx.catalog.registry(), changeset_id, 0, 10, true).unwrap();
        assert_eq!(page.total, Some(2));
        assert_eq!(page.items.len(), 2);
        let size = page.items.iter().find(|item| item.key == FILE_SIZE).unwrap();
        assert_eq!(size.value, serde_json::json!(42));
        assert!(!size.removed);

        let paged = list_changeset_metadata_changes(&mut conn, fx.catalog.registry(), changeset_id, 1, 10, false).unwrap();
        assert_eq!(paged.items.len(), 1);
        assert!(paged.total.is_none());
    }
}
