pub mod asset;
pub mod current;

use crate::registry::MetadataKey;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Directly-filterable asset columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AssetColumn {
    Id,
    Namespace,
    ExternalId,
    CanonicalUri,
    ActorId,
}

impl AssetColumn {
    pub(crate) fn sql(self) -> &'static str {
        match self {
            AssetColumn::Id => "a.id",
            AssetColumn::Namespace => "a.namespace",
            AssetColumn::ExternalId => "a.external_id",
            AssetColumn::CanonicalUri => "a.canonical_uri",
            AssetColumn::ActorId => "a.actor_id",
        }
    }
}

/// What a filter applies to: an asset column, or the latest live value of a
/// metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterField {
    Column(AssetColumn),
    Metadata(MetadataKey),
}

/// Comparison applied by a filter. An empty `Values` list means "has any
/// value at all" for metadata fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criteria {
    Values(Vec<serde_json::Value>),
    GreaterEq(serde_json::Value),
    LessEq(serde_json::Value),
    Range(serde_json::Value, serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetFilter {
    pub field: FilterField,
    pub criteria: Criteria,
    #[serde(default)]
    pub negated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetSort {
    pub column: AssetColumn,
    #[serde(default)]
    pub descending: bool,
}

/// Bucketing for grouped listings: by asset column, or by the latest text
/// rendering of a metadata key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    Column(AssetColumn),
    Metadata(MetadataKey),
}

/// A stored or ad-hoc asset listing query. Also the payload of a
/// query-backed collection's `source`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetQuery {
    #[serde(default)]
    pub filters: Vec<AssetFilter>,
    #[serde(default)]
    pub sort: Option<AssetSort>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub include_total: bool,
}

fn default_limit() -> i64 {
    100
}

impl AssetQuery {
    pub fn all() -> Self {
        Self {
            limit: i64::MAX,
            ..Self::default()
        }
    }

    pub fn filtered(filters: Vec<AssetFilter>) -> Self {
        Self {
            filters,
            ..Self::all()
        }
    }

    pub fn has_filter(&self) -> bool {
        !self.filters.is_empty()
    }
}
