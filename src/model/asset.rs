use crate::schema::assets;
use crate::string::SmallString;
use diesel::prelude::*;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};

/// A cataloged thing, unique per `(namespace, external_id)`. An asset with a
/// `canonical_asset_id` is a shadow: current-value queries redirect its
/// metadata fold to the canonical asset.
#[derive(Debug, Clone, AsChangeset, Identifiable, Queryable, QueryableByName, Selectable, Serialize)]
#[diesel(treat_none_as_null = true)]
#[diesel(table_name = assets)]
#[diesel(check_for_backend(Sqlite))]
pub struct Asset {
    pub id: i64,
    pub canonical_asset_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub namespace: SmallString,
    pub external_id: SmallString,
    pub canonical_uri: SmallString,
}

impl Asset {
    /// The asset whose metadata log answers current-value questions for this
    /// one.
    pub fn effective_id(&self) -> i64 {
        self.canonical_asset_id.unwrap_or(self.id)
    }
}

/// The identity a source reports for a discovered asset, before the store has
/// assigned (or re-found) a row for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetIdentity {
    pub namespace: SmallString,
    pub external_id: SmallString,
    pub canonical_uri: SmallString,
}

impl AssetIdentity {
    pub fn new(
        namespace: impl Into<SmallString>,
        external_id: impl Into<SmallString>,
        canonical_uri: impl Into<SmallString>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            external_id: external_id.into(),
            canonical_uri: canonical_uri.into(),
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = assets)]
#[diesel(check_for_backend(Sqlite))]
pub struct NewAsset<'a> {
    pub canonical_asset_id: Option<i64>,
    pub actor_id: Option<i64>,
    pub namespace: &'a str,
    pub external_id: &'a str,
    pub canonical_uri: &'a str,
}
