use crate::catalog::Catalog;
use crate::changes::MetadataChanges;
use crate::error::Result;
use crate::model::asset::AssetIdentity;
use crate::model::enums::{ActorType, OpStatus};
use crate::model::metadata::Metadata;
use crate::registry::MetadataKey;
use crate::string::SmallString;
use crate::update;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tracing::warn;

/// Reads an asset's raw bytes from wherever its origin source keeps them.
#[async_trait]
pub trait DataReader: Send + Sync {
    /// Fetch up to `length` bytes starting at `offset`.
    async fn read(&self, offset: u64, length: Option<u64>, no_cache: bool) -> Result<Vec<u8>>;
}

/// One discovered asset: its identity plus the metadata the source observed.
pub struct AssetScanResult {
    pub asset: AssetIdentity,
    pub actor_id: i64,
    pub metadata: Vec<Metadata>,
}

/// Outcome of starting a scan: the stream of discovered assets, the status
/// the source assigns to the attempt, and how many entries it filtered out.
pub struct ScanResult {
    pub items: BoxStream<'static, Result<AssetScanResult>>,
    pub status: OpStatus,
    pub ignored: u64,
}

impl ScanResult {
    pub fn new(items: BoxStream<'static, Result<AssetScanResult>>) -> Self {
        Self {
            items,
            status: OpStatus::Completed,
            ignored: 0,
        }
    }
}

/// A plugin that discovers assets and seeds their initial metadata.
#[async_trait]
pub trait SourcePlugin: Send + Sync {
    fn plugin_id(&self) -> &str;

    /// Namespace assigned to every asset this source emits.
    fn namespace(&self) -> SmallString;

    fn can_scan_uri(&self, uri: &str) -> bool;

    /// Whether the source can operate right now; `Err` carries the reason.
    async fn is_ready(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    /// Obtain opaque credentials. Sources without auth return an empty string.
    async fn authorize(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn scan(&self) -> Result<ScanResult>;

    /// Priority with which this source wants to expand an asset produced by
    /// another source; zero or less declines.
    fn can_scan_asset(&self, _changes: &MetadataChanges) -> i32 {
        0
    }

    /// Expand an asset produced by another source into further assets.
    async fn scan_from_asset(&self, _changes: &MetadataChanges) -> Result<Option<ScanResult>> {
        Ok(None)
    }

    /// A reader for the asset's bytes, resolved from current metadata under
    /// `key`. Sources without byte access return `None`.
    async fn data_reader(
        &self,
        _key: &MetadataKey,
        _changes: &MetadataChanges,
    ) -> Result<Option<Box<dyn DataReader>>> {
        Ok(None)
    }
}

/// Resolves a byte reader for an asset from its current metadata under
/// `key`: the newest entry names the actor that can serve the bytes, and
/// that actor's source plugin supplies the reader. Returns `None` when no
/// entry, actor or reader is available.
pub async fn resolve_data_reader(
    catalog: &Catalog,
    key: &MetadataKey,
    changes: &MetadataChanges,
) -> Result<Option<Box<dyn DataReader>>> {
    let entries = changes.entries_for_key(key, None);
    let Some(entry) = entries.first() else {
        return Ok(None);
    };
    if entries.len() > 1 {
        warn!(
            asset_id = changes.asset().id,
            key = %key,
            "Multiple metadata entries for reader key; using newest",
        );
    }
    let Some(actor_id) = entry.actor_id else {
        return Ok(None);
    };
    let actor = {
        let mut conn = catalog.connection()?;
        update::actor::get(&mut conn, actor_id)?
    };
    if actor.type_ != ActorType::Source {
        warn!(actor_id, "Actor is not a source; cannot read asset data");
        return Ok(None);
    }
    let plugin = catalog.source_instance(&actor)?;
    plugin.data_reader(key, changes).await
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::registry::DATA_FILE_READER;
    use crate::test::*;

    #[tokio::test]
    async fn reader_resolves_through_origin_actor() {
        let fx = CatalogFixture::with_plugins(test_plugins());
        let source = fx.register_fake_source(&["blob.bin"]);
        let mut conn = fx.catalog.connection().unwrap();
        let asset = fx.make_asset(&mut conn, "fake", "blob.bin");
        drop(conn);

        let handle = fx
            .catalog
            .registry()
            .make(&DATA_FILE_READER, Some(serde_json::json!({}).into()), source.id)
            .unwrap();
        let changes = fx.changes_for(&asset, vec![], vec![handle]);

        let reader = resolve_data_reader(&fx.catalog, &DATA_FILE_READER, &changes)
            .await
            .unwrap()
            .expect("fake source must provide a reader");
        let head = reader.read(0, Some(4), false).await.unwrap();
        assert_eq!(head, b"blob");
        // Reads are deterministic and honor offsets.
        let offset = reader.read(2, Some(4), false).await.unwrap();
        let full = reader.read(0, None, false).await.unwrap();
        assert_eq!(offset.as_slice(), &full[2..6]);
    }

    #[tokio::test]
    async fn missing_reader_metadata_resolves_to_none() {
        let fx = CatalogFixture::with_plugins(test_plugins());
        let changes = fx.changes_for(&fx.asset, vec![], vec![]);
        let reader = resolve_data_reader(&fx.catalog, &DATA_FILE_READER, &changes).await.unwrap();
        assert!(reader.is_none());
    }
}
