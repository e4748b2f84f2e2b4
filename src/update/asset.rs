use crate::error::Result;
use crate::model::actor::Actor;
use crate::model::asset::{Asset, AssetIdentity, NewAsset};
use crate::schema::assets;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

/// Finds or creates the asset row for a scanned identity. Re-found assets
/// keep their stored canonical pointer and origin actor; new assets record
/// the scanning actor as their origin. Returns `(asset, was_created)`.
pub fn save_record(
    conn: &mut SqliteConnection,
    identity: &AssetIdentity,
    actor: &Actor,
) -> Result<(Asset, bool)> {
    let existing: Option<Asset> = assets::table
        .select(Asset::as_select())
        .filter(assets::namespace.eq(identity.namespace.as_str()))
        .filter(assets::external_id.eq(identity.external_id.as_str()))
        .first(conn)
        .optional()?;
    if let Some(asset) = existing {
        return Ok((asset, false));
    }

    let asset = diesel::insert_into(assets::table)
        .values(NewAsset {
            canonical_asset_id: None,
            actor_id: Some(actor.id),
            namespace: &identity.namespace,
            external_id: &identity.external_id,
            canonical_uri: &identity.canonical_uri,
        })
        .returning(Asset::as_returning())
        .get_result(conn)?;
    Ok((asset, true))
}

pub fn get(conn: &mut SqliteConnection, asset_id: i64) -> Result<Asset> {
    assets::table
        .find(asset_id)
        .select(Asset::as_select())
        .first(conn)
        .map_err(Into::into)
}

pub fn list_by_ids(conn: &mut SqliteConnection, asset_ids: &[i64]) -> Result<Vec<Asset>> {
    assets::table
        .select(Asset::as_select())
        .filter(assets::id.eq_any(asset_ids))
        .order(assets::id.asc())
        .load(conn)
        .map_err(Into::into)
}

/// One page of the whole catalog, ordered by id.
pub fn list_page(conn: &mut SqliteConnection, offset: i64, limit: i64) -> Result<Vec<Asset>> {
    assets::table
        .select(Asset::as_select())
        .order(assets::id.asc())
        .offset(offset)
        .limit(limit)
        .load(conn)
        .map_err(Into::into)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;

    #[test]
    fn save_record_is_idempotent() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let identity = AssetIdentity::new("fs", "/tmp/foo.txt", "file:///tmp/foo.txt");

        let (first, created) = save_record(&mut conn, &identity, &fx.actor).unwrap();
        assert!(created);
        assert_eq!(first.actor_id, Some(fx.actor.id));

        let (second, created) = save_record(&mut conn, &identity, &fx.actor).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
    }

    #[test]
    fn different_namespace_is_a_different_asset() {
        let fx = CatalogFixture::new();
        let mut conn = fx.catalog.connection().unwrap();
        let (first, _) =
            save_record(&mut conn, &AssetIdentity::new("fs", "x", "file:///x"), &fx.actor).unwrap();
        let (second, created) =
            save_record(&mut conn, &AssetIdentity::new("web", "x", "https://x"), &fx.actor).unwrap();
        assert!(created);
        assert_ne!(first.id, second.id);
    }
}
