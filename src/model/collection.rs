use crate::model::enums::RefreshMode;
use crate::model::json::Json;
use crate::schema::asset_collections;
use crate::string::SmallString;
use crate::time::DateTime;
use diesel::prelude::*;
use diesel::sqlite::Sqlite;

/// A named set of assets. Membership is not a join table: it is encoded as
/// append-only `collection/member` metadata rows pointing at the collection,
/// so membership history participates in changesets like any other fact.
#[derive(Debug, Clone, AsChangeset, Identifiable, Queryable, Selectable)]
#[diesel(treat_none_as_null = true)]
#[diesel(table_name = asset_collections)]
#[diesel(check_for_backend(Sqlite))]
pub struct AssetCollection {
    pub id: i64,
    pub name: SmallString,
    pub description: Option<String>,
    /// Stored query for query-backed collections.
    pub source: Option<Json>,
    pub membership_key_id: Option<i64>,
    /// Cached count of live members, refreshed after membership updates.
    pub item_count: i64,
    pub refresh_mode: RefreshMode,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Insertable)]
#[diesel(table_name = asset_collections)]
#[diesel(check_for_backend(Sqlite))]
pub struct NewAssetCollection<'a> {
    pub name: &'a str,
    pub description: Option<&'a str>,
    pub source: Option<&'a Json>,
    pub membership_key_id: Option<i64>,
    pub item_count: i64,
    pub refresh_mode: RefreshMode,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}
