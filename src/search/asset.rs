use crate::error::{Error, Result};
use crate::model::asset::Asset;
use crate::model::enums::MetadataType;
use crate::registry::MetadataRegistry;
use crate::search::{AssetColumn, AssetQuery, AssetSort, Criteria, FilterField, GroupBy};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Double, Text};
use diesel::sqlite::SqliteConnection;

/// A bound SQL parameter accumulated while building a dynamic query.
#[derive(Debug, Clone)]
enum Bind {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Bind {
    fn from_json(value: &serde_json::Value) -> Result<Bind> {
        match value {
            serde_json::Value::Number(number) if number.is_i64() => Ok(Bind::Int(number.as_i64().unwrap())),
            serde_json::Value::Number(number) => Ok(Bind::Float(number.as_f64().unwrap_or(0.0))),
            serde_json::Value::String(text) => Ok(Bind::Text(text.clone())),
            serde_json::Value::Bool(flag) => Ok(Bind::Int(i64::from(*flag))),
            other => Err(Error::InvalidQuery(format!("unsupported filter value {other}"))),
        }
    }
}

struct SqlBuilder {
    conditions: Vec<String>,
    binds: Vec<Bind>,
}

impl SqlBuilder {
    fn new() -> Self {
        Self {
            conditions: Vec::new(),
            binds: Vec::new(),
        }
    }

    fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }

    fn push_filter(&mut self, registry: &MetadataRegistry, query: &AssetQuery) -> Result<()> {
        for filter in &query.filters {
            match &filter.field {
                FilterField::Column(column) => self.push_column_filter(*column, &filter.criteria, filter.negated)?,
                FilterField::Metadata(key) => {
                    let def = registry.def(key)?;
                    let key_id = registry.id_of(key)?;
                    self.push_metadata_filter(key_id, def.value_type, &filter.criteria, filter.negated)?;
                }
            }
        }
        Ok(())
    }

    fn push_column_filter(&mut self, column: AssetColumn, criteria: &Criteria, negated: bool) -> Result<()> {
        let expression = column.sql();
        let condition = self.render_criteria(expression, criteria, negated)?;
        self.conditions.push(condition);
        Ok(())
    }

    /// Renders a metadata filter as an EXISTS probe against the latest-row
    /// projection, redirected through the canonical-merge pointer.
    fn push_metadata_filter(
        &mut self,
        key_id: i64,
        value_type: MetadataType,
        criteria: &Criteria,
        negated: bool,
    ) -> Result<()> {
        let value_column = match value_type {
            MetadataType::String => "m.value_text",
            MetadataType::Int => "m.value_int",
            MetadataType::Float => "m.value_real",
            MetadataType::Datetime => "m.value_datetime",
            MetadataType::Json => "m.value_json",
            MetadataType::Relation => "m.value_relation_id",
            MetadataType::Collection => "m.value_collection_id",
        };
        // Existence probe when no concrete values are given.
        let value_condition = match criteria {
            Criteria::Values(values) if values.is_empty() => String::new(),
            _ => {
                let rendered = self.render_criteria(value_column, criteria, false)?;
                format!(" AND {rendered}")
            }
        };
        let exists = format!(
            "EXISTS (SELECT 1 FROM metadata m \
             WHERE m.asset_id = COALESCE(a.canonical_asset_id, a.id) \
               AND m.metadata_key_id = {key_id} \
               AND m.removed = 0 \
               AND m.changeset_id = (\
                   SELECT MAX(m2.changeset_id) FROM metadata m2 \
                   WHERE m2.asset_id = m.asset_id \
                     AND m2.metadata_key_id = m.metadata_key_id \
                     AND m2.removed = 0)\
             {value_condition})"
        );
        self.conditions
            .push(if negated { format!("NOT {exists}") } else { exists });
        Ok(())
    }

    fn render_criteria(&mut self, expression: &str, criteria: &Criteria, negated: bool) -> Result<String> {
        let condition = match criteria {
            Criteria::Values(values) if values.is_empty() => format!("{expression} IS NOT NULL"),
            Criteria::Values(values) => {
                let placeholders: Vec<&str> = values.iter().map(|_| "?").collect();
                for value in values {
                    self.binds.push(Bind::from_json(value)?);
                }
                format!("{expression} IN ({})", placeholders.join(", "))
            }
            Criteria::GreaterEq(value) => {
                self.binds.push(Bind::from_json(value)?);
                format!("{expression} >= ?")
            }
            Criteria::LessEq(value) => {
                self.binds.push(Bind::from_json(value)?);
                format!("{expression} <= ?")
            }
            Criteria::Range(start, end) => {
                self.binds.push(Bind::from_json(start)?);
                self.binds.push(Bind::from_json(end)?);
                format!("{expression} BETWEEN ? AND ?")
            }
        };
        Ok(if negated { format!("NOT ({condition})") } else { condition })
    }
}

fn order_clause(sort: Option<AssetSort>) -> String {
    match sort {
        Some(AssetSort { column, descending }) => {
            let direction = if descending { "DESC" } else { "ASC" };
            format!("ORDER BY {} {direction}, a.id ASC", column.sql())
        }
        None => "ORDER BY a.id ASC".to_owned(),
    }
}

fn load_assets(conn: &mut SqliteConnection, sql: String, binds: Vec<Bind>) -> Result<Vec<Asset>> {
    let mut query = diesel::sql_query(sql).into_boxed();
    for bind in binds {
        query = match bind {
            Bind::Int(value) => query.bind::<BigInt, _>(value),
            Bind::Float(value) => query.bind::<Double, _>(value),
            Bind::Text(value) => query.bind::<Text, _>(value),
        };
    }
    query.load(conn).map_err(Into::into)
}

#[derive(QueryableByName)]
struct CountRow {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(Debug, Clone, PartialEq, QueryableByName, serde::Serialize)]
pub struct GroupBucket {
    #[diesel(sql_type = diesel::sql_types::Nullable<Text>)]
    pub value: Option<String>,
    #[diesel(sql_type = BigInt)]
    pub count: i64,
}

pub struct AssetPage {
    pub assets: Vec<Asset>,
    pub total: Option<i64>,
}

/// Runs a listing query: asset-column predicates directly, metadata
/// predicates through latest-row EXISTS probes, plus sort and paging.
pub fn list_assets(conn: &mut SqliteConnection, registry: &MetadataRegistry, query: &AssetQuery) -> Result<AssetPage> {
    if query.offset < 0 || query.limit < 0 {
        return Err(Error::InvalidQuery("offset and limit must be non-negative".into()));
    }
    let mut builder = SqlBuilder::new();
    builder.push_filter(registry, query)?;
    let where_clause = builder.where_clause();
    let order = order_clause(query.sort);

    let sql = format!(
        "SELECT a.id, a.canonical_asset_id, a.actor_id, a.namespace, a.external_id, a.canonical_uri \
         FROM assets a {where_clause} {order} LIMIT {} OFFSET {}",
        query.limit, query.offset,
    );
    let assets = load_assets(conn, sql, builder.binds.clone())?;

    let total = if query.include_total {
        let count_sql =
            format!("SELECT COUNT(DISTINCT COALESCE(a.canonical_asset_id, a.id)) AS count FROM assets a {where_clause}");
        let mut count_query = diesel::sql_query(count_sql).into_boxed();
        for bind in builder.binds {
            count_query = match bind {
                Bind::Int(value) => count_query.bind::<BigInt, _>(value),
                Bind::Float(value) => count_query.bind::<Double, _>(value),
                Bind::Text(value) => count_query.bind::<Text, _>(value),
            };
        }
        let row: CountRow = count_query.get_result(conn)?;
        Some(row.count)
    } else {
        None
    };

    Ok(AssetPage { assets, total })
}

/// Ids of every asset matching the query's filters, unpaged.
pub fn asset_ids_for_query(
    conn: &mut SqliteConnection,
    registry: &MetadataRegistry,
    query: &AssetQuery,
) -> Result<Vec<i64>> {
    let unpaged = AssetQuery {
        offset: 0,
        limit: i64::MAX,
        include_total: false,
        ..query.clone()
    };
    Ok(list_assets(conn, registry, &unpaged)?
        .assets
        .into_iter()
        .map(|asset| asset.id)
        .collect())
}

/// Groups matching assets by an asset column or by the latest text rendering
/// of a metadata key. Buckets are ordered by descending size.
pub fn list_grouped_assets(
    conn: &mut SqliteConnection,
    registry: &MetadataRegistry,
    group_by: &GroupBy,
    query: &AssetQuery,
) -> Result<Vec<GroupBucket>> {
    let mut builder = SqlBuilder::new();
    builder.push_filter(registry, query)?;
    let where_clause = builder.where_clause();

    let sql = match group_by {
        GroupBy::Column(column) => format!(
            "SELECT CAST({column} AS TEXT) AS value, \
                    COUNT(DISTINCT COALESCE(a.canonical_asset_id, a.id)) AS count \
             FROM assets a {where_clause} GROUP BY {column} ORDER BY count DESC, value ASC",
            column = column.sql(),
        ),
        GroupBy::Metadata(key) => {
            let key_id = registry.id_of(key)?;
            // The bare `rendered` column rides along with MAX(m.id), which in
            // SQLite selects it from the max-id row of each group.
            format!(
                "WITH latest_snap AS (\
                     SELECT m.asset_id, MAX(m.changeset_id) AS changeset_id \
                     FROM metadata m \
                     WHERE m.removed = 0 AND m.metadata_key_id = {key_id} \
                     GROUP BY m.asset_id), \
                 latest_rows AS (\
                     SELECT m.asset_id, \
                            COALESCE(m.value_text, \
                                     CAST(m.value_int AS TEXT), \
                                     CAST(m.value_real AS TEXT), \
                                     CAST(m.value_datetime AS TEXT), \
                                     m.value_json, \
                                     CAST(m.value_relation_id AS TEXT), \
                                     CAST(m.value_collection_id AS TEXT)) AS rendered, \
                            MAX(m.id) \
                     FROM metadata m \
                     JOIN latest_snap ls \
                       ON ls.asset_id = m.asset_id AND ls.changeset_id = m.changeset_id \
                     WHERE m.removed = 0 AND m.metadata_key_id = {key_id} \
                     GROUP BY m.asset_id) \
                 SELECT lr.rendered AS value, \
                        COUNT(DISTINCT COALESCE(a.canonical_asset_id, a.id)) AS count \
                 FROM assets a \
                 LEFT JOIN latest_rows lr ON lr.asset_id = COALESCE(a.canonical_asset_id, a.id) \
                 {where_clause} GROUP BY lr.rendered ORDER BY count DESC, value ASC"
            )
        }
    };

    let mut grouped = diesel::sql_query(sql).into_boxed();
    for bind in builder.binds {
        grouped = match bind {
            Bind::Int(value) => grouped.bind::<BigInt, _>(value),
            Bind::Float(value) => grouped.bind::<Double, _>(value),
            Bind::Text(value) => grouped.bind::<Text, _>(value),
        };
    }
    grouped.load(conn).map_err(Into::into)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::{FILE_NAME, FILE_SIZE};
    use crate::search::AssetFilter;
    use crate::test::*;
    use crate::update::metadata::persist_changes;
    use serde_json::json;

    fn seed(fx: &CatalogFixture) -> (Asset, Asset, Asset) {
        let mut conn = fx.catalog.connection().unwrap();
        let changeset_id = fx.insert_changeset(&mut conn, 1000);
        let small = fx.make_asset(&mut conn, "fs", "/a");
        let large = fx.make_asset(&mut conn, "fs", "/b");
        let web = fx.make_asset(&mut conn, "web", "https://c");
        for (asset, size, name) in [(&small, 10, "a.txt"), (&large, 5000, "b.txt"), (&web, 70, "c.html")] {
            let changes = fx.changes_for(
                asset,
                vec![],
                vec![
                    fx.meta(&FILE_SIZE, Some(size.into())),
                    fx.meta(&FILE_NAME, Some(name.into())),
                ],
            );
            persist_changes(&mut conn, &changes, changeset_id).unwrap();
        }
        (small, large, web)
    }

    fn column_filter(column: AssetColumn, criteria: Criteria) -> AssetFilter {
        AssetFilter {
            field: FilterField::Column(column),
            criteria,
            negated: false,
        }
    }

    fn metadata_filter(key: &crate::registry::MetadataKey, criteria: Criteria) -> AssetFilter {
        AssetFilter {
            field: FilterField::Metadata(key.clone()),
            criteria,
            negated: false,
        }
    }

    #[test]
    fn column_filter_and_total() {
        let fx = CatalogFixture::new();
        let (small, large, _web) = seed(&fx);
        let mut conn = fx.catalog.connection().unwrap();
        let mut query =
            AssetQuery::filtered(vec![column_filter(AssetColumn::Namespace, Criteria::Values(vec![json!("fs")]))]);
        query.include_total = true;
        let page = list_assets(&mut conn, fx.catalog.registry(), &query).unwrap();
        assert_eq!(page.total, Some(2));
        let ids: Vec<i64> = page.assets.iter().map(|asset| asset.id).collect();
        assert_eq!(ids, vec![small.id, large.id]);
    }

    #[test]
    fn metadata_filter_hits_latest_value() {
        let fx = CatalogFixture::new();
        let (_small, large, _web) = seed(&fx);
        let mut conn = fx.catalog.connection().unwrap();

        let query = AssetQuery::filtered(vec![metadata_filter(&FILE_SIZE, Criteria::GreaterEq(json!(1000)))]);
        let page = list_assets(&mut conn, fx.catalog.registry(), &query).unwrap();
        assert_eq!(page.assets.len(), 1);
        assert_eq!(page.assets[0].id, large.id);

        // A newer changeset shrinks the file; the filter follows the latest value.
        let newer = fx.insert_changeset(&mut conn, 1001);
        let loaded = crate::update::metadata::for_asset(&mut conn, large.id, true).unwrap();
        let changes = fx.changes_for(&large, loaded, vec![fx.meta(&FILE_SIZE, Some(1.into()))]);
        persist_changes(&mut conn, &changes, newer).unwrap();
        let page = list_assets(&mut conn, fx.catalog.registry(), &query).unwrap();
        assert!(page.assets.is_empty());
    }

    #[test]
    fn existence_filter_and_negation() {
        let fx = CatalogFixture::new();
        let (_small, _large, _web) = seed(&fx);
        let mut conn = fx.catalog.connection().unwrap();
        let bare = fx.make_asset(&mut conn, "fs", "/bare");

        let query = AssetQuery::filtered(vec![metadata_filter(&FILE_NAME, Criteria::Values(vec![]))]);
        let with_name = list_assets(&mut conn, fx.catalog.registry(), &query).unwrap();
        assert_eq!(with_name.assets.len(), 3);

        // Negated existence returns the assets with no name at all: the bare
        // one and the fixture asset.
        let mut negated = metadata_filter(&FILE_NAME, Criteria::Values(vec![]));
        negated.negated = true;
        let query = AssetQuery::filtered(vec![negated]);
        let without_name = list_assets(&mut conn, fx.catalog.registry(), &query).unwrap();
        assert_eq!(without_name.assets.len(), 2);
        assert!(without_name.assets.iter().any(|asset| asset.id == bare.id));
        assert!(without_name.assets.iter().any(|asset| asset.id == fx.asset.id));
    }

    #[test]
    fn sorting_and_paging() {
        let fx = CatalogFixture::new();
        let (small, large, web) = seed(&fx);
        let mut conn = fx.catalog.connection().unwrap();
        let query = AssetQuery {
            sort: Some(AssetSort {
                column: AssetColumn::ExternalId,
                descending: true,
            }),
            offset: 0,
            limit: 2,
            ..AssetQuery::default()
        };
        // Descending external ids: the web asset, then the fixture asset,
        // then the two fs files.
        let page = list_assets(&mut conn, fx.catalog.registry(), &query).unwrap();
        let ids: Vec<i64> = page.assets.iter().map(|asset| asset.id).collect();
        assert_eq!(ids, vec![web.id, fx.asset.id]);

        let next = AssetQuery { offset: 2, ..query };
        let page = list_assets(&mut conn, fx.catalog.registry(), &next).unwrap();
        let ids: Vec<i64> = page.assets.iter().map(|asset| asset.id).collect();
        assert_eq!(ids, vec![large.id, small.id]);
    }

    #[test]
    fn grouping_by_column_and_metadata() {
        let fx = CatalogFixture::new();
        seed(&fx);
        let mut conn = fx.catalog.connection().unwrap();

        let buckets =
            list_grouped_assets(&mut conn, fx.catalog.registry(), &GroupBy::Column(AssetColumn::Namespace), &AssetQuery::all())
                .unwrap();
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].value.as_deref(), Some("fs"));
        assert_eq!(buckets[0].count, 2);

        let buckets =
            list_grouped_assets(&mut conn, fx.catalog.registry(), &GroupBy::Metadata(FILE_NAME), &AssetQuery::all())
                .unwrap();
        let names: Vec<Option<String>> = buckets.iter().map(|bucket| bucket.value.clone()).collect();
        assert!(names.contains(&Some("a.txt".to_owned())));
        // The fixture asset has no filename and lands in the null bucket.
        let unnamed = buckets.iter().find(|bucket| bucket.value.is_none()).unwrap();
        assert_eq!(unnamed.count, 1);
    }
}
