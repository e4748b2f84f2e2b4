use crate::catalog::Catalog;
use crate::changes::MetadataChanges;
use crate::config;
use crate::error::Result;
use crate::model::actor::Actor;
use crate::model::changeset::ChangesetRun;
use crate::model::enums::{ActorType, OpStatus};
use crate::model::metadata::Metadata;
use crate::pipeline::{ProcessorStage, process_asset, sort_processors};
use crate::plugin::source::AssetScanResult;
use crate::registry::{ASSET_LOST, DATA_FILE_READER};
use crate::schema::metadata;
use crate::update;
use diesel::prelude::*;
use futures::StreamExt;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const LOG_EVERY_ASSETS: u64 = 5000;

/// Buffers sidecar files (matched by configured suffixes) until the primary
/// asset sharing their stem shows up, then contributes their metadata to the
/// primary instead of emitting them as assets of their own.
struct SidecarBuffer {
    suffixes: Vec<String>,
    pending: HashMap<String, Vec<Metadata>>,
    primaries: HashMap<String, crate::model::asset::AssetIdentity>,
}

impl SidecarBuffer {
    fn from_actor(actor: &Actor) -> Option<SidecarBuffer> {
        let suffixes: Vec<String> = actor
            .config
            .as_ref()
            .and_then(|config| config.get("sidecar_suffixes"))
            .and_then(|value| value.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|value| value.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default();
        if suffixes.is_empty() {
            return None;
        }
        Some(SidecarBuffer {
            suffixes,
            pending: HashMap::new(),
            primaries: HashMap::new(),
        })
    }

    fn sidecar_stem(&self, external_id: &str) -> Option<String> {
        self.suffixes
            .iter()
            .find(|suffix| external_id.ends_with(suffix.as_str()))
            .map(|suffix| external_id[..external_id.len() - suffix.len()].to_owned())
    }

    fn primary_stem(external_id: &str) -> String {
        match external_id.rsplit_once('.') {
            Some((stem, _extension)) => stem.to_owned(),
            None => external_id.to_owned(),
        }
    }

    /// Intercepts sidecar items (returns `None`) and folds already-buffered
    /// sidecar metadata into primary items.
    fn intercept(&mut self, mut item: AssetScanResult) -> Option<AssetScanResult> {
        if let Some(stem) = self.sidecar_stem(&item.asset.external_id) {
            self.pending.entry(stem).or_default().extend(item.metadata);
            return None;
        }
        let stem = Self::primary_stem(&item.asset.external_id);
        if let Some(deferred) = self.pending.remove(&stem) {
            item.metadata.extend(deferred);
        }
        self.primaries.insert(stem, item.asset.clone());
        Some(item)
    }

    /// Items for sidecars that arrived after their primary; sidecars with no
    /// primary at all are logged and dropped.
    fn drain(&mut self, actor_id: i64) -> Vec<AssetScanResult> {
        let mut late = Vec::new();
        for (stem, entries) in self.pending.drain() {
            match self.primaries.get(&stem) {
                Some(primary) => late.push(AssetScanResult {
                    asset: primary.clone(),
                    actor_id,
                    metadata: entries,
                }),
                None => warn!(stem = %stem, "Sidecar has no primary asset; dropping its metadata"),
            }
        }
        late
    }
}

/// Markers staged on every scanned asset: a null `asset/lost` clears any
/// previous lost marker, and (in processor mode) a `data/file_reader` handle
/// tells downstream processors which actor can serve the asset's bytes.
fn staged_scan_markers(catalog: &Catalog, actor_id: i64, with_reader: bool) -> Result<Vec<Metadata>> {
    let registry = catalog.registry();
    let mut markers = vec![registry.make(&ASSET_LOST, None, actor_id)?];
    if with_reader {
        markers.push(registry.make(&DATA_FILE_READER, Some(json!({}).into()), actor_id)?);
    }
    Ok(markers)
}

/// Persists one batch of scan-only results in a single transaction: asset
/// rows, change-set computation against loaded history, and the append-only
/// inserts.
fn flush_scan_only_batch(
    catalog: &Catalog,
    run: &ChangesetRun,
    batch: &mut Vec<AssetScanResult>,
    seen_assets: &mut HashSet<i64>,
) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let changeset_id = run.id();
    let mut conn = catalog.connection()?;
    let items: Vec<AssetScanResult> = batch.drain(..).collect();
    conn.transaction(|conn| {
        let mut all_rows: Vec<Metadata> = Vec::new();
        for item in items {
            let actor = update::actor::get(conn, item.actor_id)?;
            let (asset, was_created) = update::asset::save_record(conn, &item.asset, &actor)?;
            seen_assets.insert(asset.id);
            let loaded = if was_created {
                run.stats().assets_added += 1;
                Vec::new()
            } else {
                update::metadata::for_asset(conn, asset.id, true)?
            };

            let mut staged = item.metadata;
            staged.extend(staged_scan_markers(catalog, item.actor_id, false)?);
            let changes = MetadataChanges::new(asset, catalog.registry_arc(), loaded, staged);
            // The rows just loaded inside this transaction double as the
            // authoritative snapshot.
            let (to_create, _changed) = changes.prepare_persist(changeset_id, changes.loaded_entries())?;
            if !to_create.is_empty() {
                let mut stats = run.stats();
                stats.assets_changed += 1;
                stats.metadata_values_changed += to_create.len() as u64;
                stats.metadata_values_added += to_create.iter().filter(|entry| !entry.removed).count() as u64;
                stats.metadata_values_removed += to_create.iter().filter(|entry| entry.removed).count() as u64;
                all_rows.extend(to_create);
            }
        }
        update::metadata::bulk_create(conn, &all_rows)?;
        Ok(())
    })
}

/// Timing collected for a scan-only run, persisted under
/// `changeset.data.scan_metrics`.
#[derive(Default)]
struct ScanMetrics {
    persist_time_s: f64,
    persist_batches: u64,
    first_persist_delay_s: Option<f64>,
    scan_iter_finished_s: Option<f64>,
}

/// Drives one or more source actors to completion under a changeset:
/// streams their scan results, persists observations (batched, or per-asset
/// through the processor pipeline), marks assets the actor stopped seeing as
/// lost, and aggregates status and metrics.
pub async fn run_sources(
    catalog: &Catalog,
    run: &Arc<ChangesetRun>,
    sources: &[Actor],
    run_processors: bool,
) -> Result<OpStatus> {
    let stages: Vec<ProcessorStage> = if run_processors {
        sort_processors(catalog, None).await?
    } else {
        Vec::new()
    };
    let has_processors = !stages.is_empty();
    let stages = Arc::new(stages);
    let tx_chunk_size = config::batch_size();

    let mut source_statuses: Vec<OpStatus> = Vec::new();
    let scan_started = Instant::now();
    let mut metrics = ScanMetrics::default();

    for source in sources {
        if source.type_ != ActorType::Source {
            warn!(actor_id = source.id, "Skipping actor {}: not a source", source.name);
            continue;
        }
        if source.disabled {
            info!(actor_id = source.id, "Skipping actor {} (disabled)", source.name);
            continue;
        }

        let plugin = catalog.source_instance(source)?;
        let existing_actor_metadata = {
            let mut conn = catalog.connection()?;
            metadata::table
                .select(metadata::id)
                .filter(metadata::actor_id.eq(source.id))
                .first::<i64>(&mut conn)
                .optional()?
                .is_some()
        };

        let mut scan_result = plugin.scan().await?;
        let mut sidecars = SidecarBuffer::from_actor(source);
        let mut seen_assets: HashSet<i64> = HashSet::new();
        let mut scan_only_batch: Vec<AssetScanResult> = Vec::new();
        let mut persisted_assets: u64 = 0;

        while let Some(item) = scan_result.items.next().await {
            run.check_cancelled()?;
            let item = item?;
            let item = match sidecars.as_mut() {
                Some(buffer) => match buffer.intercept(item) {
                    Some(item) => item,
                    None => continue,
                },
                None => item,
            };
            {
                let mut stats = run.stats();
                stats.assets_seen += 1;
                stats.assets_saved += 1;
            }

            if has_processors {
                enqueue_scan_item(catalog, run, &stages, item, &mut seen_assets)?;
            } else {
                scan_only_batch.push(item);
                if scan_only_batch.len() >= tx_chunk_size {
                    if metrics.first_persist_delay_s.is_none() {
                        metrics.first_persist_delay_s = Some(scan_started.elapsed().as_secs_f64());
                    }
                    let persist_started = Instant::now();
                    persisted_assets += scan_only_batch.len() as u64;
                    flush_scan_only_batch(catalog, run, &mut scan_only_batch, &mut seen_assets)?;
                    metrics.persist_time_s += persist_started.elapsed().as_secs_f64();
                    metrics.persist_batches += 1;
                    if persisted_assets % LOG_EVERY_ASSETS == 0 {
                        let stats = run.stats().clone();
                        info!(
                            source = %source.name,
                            persisted = persisted_assets,
                            changed = stats.assets_changed,
                            added = stats.assets_added,
                            "Persisted scan results",
                        );
                    }
                }
            }
        }

        // Late sidecars attach to primaries that streamed before them.
        if let Some(buffer) = sidecars.as_mut() {
            for item in buffer.drain(source.id) {
                if has_processors {
                    enqueue_scan_item(catalog, run, &stages, item, &mut seen_assets)?;
                } else {
                    scan_only_batch.push(item);
                }
            }
        }

        if has_processors {
            metrics.scan_iter_finished_s = Some(scan_started.elapsed().as_secs_f64());
            info!(source = %source.name, "Scan finished; waiting for processor tasks");
            run.drain_tasks().await;
        } else {
            if !scan_only_batch.is_empty() {
                if metrics.first_persist_delay_s.is_none() {
                    metrics.first_persist_delay_s = Some(scan_started.elapsed().as_secs_f64());
                }
                let persist_started = Instant::now();
                persisted_assets += scan_only_batch.len() as u64;
                flush_scan_only_batch(catalog, run, &mut scan_only_batch, &mut seen_assets)?;
                metrics.persist_time_s += persist_started.elapsed().as_secs_f64();
                metrics.persist_batches += 1;
            }
            metrics.scan_iter_finished_s = Some(scan_started.elapsed().as_secs_f64());
            let stats = run.stats().clone();
            info!(
                source = %source.name,
                persisted = persisted_assets,
                changed = stats.assets_changed,
                added = stats.assets_added,
                "Finished persisting scan results",
            );
        }

        // Assets this actor touched before but did not see this run get a
        // lost marker. First-ever scans have nothing to lose.
        if existing_actor_metadata {
            let mut conn = catalog.connection()?;
            let lost = update::metadata::mark_unseen_as_lost(
                &mut conn,
                catalog.registry(),
                run.id(),
                &[source.id],
                &seen_assets,
            )?;
            if lost > 0 {
                let mut stats = run.stats();
                stats.assets_lost += lost;
                stats.assets_changed += lost;
            }
        }

        if scan_result.ignored > 0 {
            let mut stats = run.stats();
            stats.assets_seen += scan_result.ignored;
            stats.assets_ignored += scan_result.ignored;
        }
        source_statuses.push(scan_result.status);
    }

    let scan_seconds = scan_started.elapsed().as_secs_f64();
    if !has_processors {
        let stats = run.stats().clone();
        run.merge_data(
            "scan_metrics",
            json!({
                "scan_seconds": scan_seconds,
                "persist_seconds": metrics.persist_time_s,
                "persist_batches": metrics.persist_batches,
                "persist_first_delay_seconds": metrics.first_persist_delay_s,
                "persist_after_scan_seconds": metrics.scan_iter_finished_s.map(|iter| scan_seconds - iter),
                "assets_seen": stats.assets_seen,
                "assets_saved": stats.assets_saved,
                "assets_added": stats.assets_added,
                "assets_changed": stats.assets_changed,
            }),
        );
    }

    // A lone source decides the status; several sources aggregate.
    Ok(match source_statuses.as_slice() {
        [single] => *single,
        statuses => OpStatus::combine(statuses.iter().copied()),
    })
}

/// Saves the asset row for a streamed item and queues its processor run
/// under the changeset's concurrency limit.
fn enqueue_scan_item(
    catalog: &Catalog,
    run: &Arc<ChangesetRun>,
    stages: &Arc<Vec<ProcessorStage>>,
    item: AssetScanResult,
    seen_assets: &mut HashSet<i64>,
) -> Result<()> {
    let mut conn = catalog.connection()?;
    let actor = update::actor::get(&mut conn, item.actor_id)?;
    let (asset, was_created) = update::asset::save_record(&mut conn, &item.asset, &actor)?;
    seen_assets.insert(asset.id);
    let loaded = if was_created {
        run.stats().assets_added += 1;
        Vec::new()
    } else {
        update::metadata::for_asset(&mut conn, asset.id, true)?
    };
    drop(conn);

    let mut staged = item.metadata;
    staged.extend(staged_scan_markers(catalog, item.actor_id, true)?);
    let changes = MetadataChanges::new(asset, catalog.registry_arc(), loaded, staged);

    let catalog = catalog.clone();
    let task_run = Arc::clone(run);
    let stages = Arc::clone(stages);
    run.enqueue(async move {
        process_asset(&catalog, &task_run, &stages, changes).await?;
        Ok(())
    });
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::metadata::MetadataValue;
    use crate::registry::{FILE_NAME, FILE_SIZE};
    use crate::update::metadata::for_asset;

    use crate::test::*;

    #[tokio::test]
    async fn first_scan_persists_observations() {
        let fx = CatalogFixture::with_plugins(test_plugins());
        let source = fx.register_fake_source(&["foo.txt", "bar.txt"]);
        let run = fx.begin_changeset(std::slice::from_ref(&source));

        let status = run_sources(&fx.catalog, &run, &[source.clone()], false).await.unwrap();
        assert_eq!(status, OpStatus::Completed);
        run.finalize(status).await.unwrap();

        let mut conn = fx.catalog.connection().unwrap();
        let page = crate::update::asset::list_page(&mut conn, 0, 100).unwrap();
        let scanned: Vec<_> = page.iter().filter(|asset| asset.namespace.as_str() == "fake").collect();
        assert_eq!(scanned.len(), 2);
        for asset in scanned {
            let stored = for_asset(&mut conn, asset.id, true).unwrap();
            assert!(stored.iter().any(|entry| entry.key_id == fx.key_id(&FILE_NAME)));
            assert!(stored.iter().any(|entry| entry.key_id == fx.key_id(&FILE_SIZE)));
        }
        let stats = run.stats().clone();
        assert_eq!(stats.assets_added, 2);
        assert_eq!(stats.assets_seen, 2);
    }

    #[tokio::test]
    async fn rescan_is_idempotent() {
        let fx = CatalogFixture::with_plugins(test_plugins());
        let source = fx.register_fake_source(&["foo.txt"]);

        let run = fx.begin_changeset(std::slice::from_ref(&source));
        run_sources(&fx.catalog, &run, &[source.clone()], false).await.unwrap();
        run.finalize(OpStatus::Completed).await.unwrap();

        let mut conn = fx.catalog.connection().unwrap();
        let before: i64 = metadata::table.count().get_result(&mut conn).unwrap();
        drop(conn);

        let rerun = fx.begin_changeset(std::slice::from_ref(&source));
        run_sources(&fx.catalog, &rerun, &[source.clone()], false).await.unwrap();
        rerun.finalize(OpStatus::Completed).await.unwrap();

        let mut conn = fx.catalog.connection().unwrap();
        let after: i64 = metadata::table.count().get_result(&mut conn).unwrap();
        assert_eq!(before, after);
        assert_eq!(rerun.stats().assets_changed, 0);
    }

    #[tokio::test]
    async fn missing_asset_gets_lost_marker() {
        let fx = CatalogFixture::with_plugins(test_plugins());
        let source = fx.register_fake_source(&["x.txt", "y.txt"]);
        let run = fx.begin_changeset(std::slice::from_ref(&source));
        run_sources(&fx.catalog, &run, &[source.clone()], false).await.unwrap();
        run.finalize(OpStatus::Completed).await.unwrap();

        // Second scan of the same logical source only sees x.
        let shrunk = fx.reconfigure_fake_source(&source, &["x.txt"]);
        let rerun = fx.begin_changeset(std::slice::from_ref(&shrunk));
        run_sources(&fx.catalog, &rerun, &[shrunk.clone()], false).await.unwrap();
        rerun.finalize(OpStatus::Completed).await.unwrap();
        assert_eq!(rerun.stats().assets_lost, 1);

        let mut conn = fx.catalog.connection().unwrap();
        let lost_key = fx.key_id(&ASSET_LOST);
        let assets = crate::update::asset::list_page(&mut conn, 0, 100).unwrap();
        let lost_rows: Vec<(String, Metadata)> = assets
            .iter()
            .filter(|asset| asset.namespace.as_str() == "fake")
            .flat_map(|asset| {
                for_asset(&mut conn, asset.id, true)
                    .unwrap()
                    .into_iter()
                    .filter(|entry| entry.key_id == lost_key && !entry.removed)
                    .map(|entry| (asset.external_id.to_string(), entry))
                    .collect::<Vec<_>>()
            })
            .collect();
        assert_eq!(lost_rows.len(), 1);
        assert_eq!(lost_rows[0].0, "y.txt");
        assert_eq!(lost_rows[0].1.value, Some(MetadataValue::Int(1)));
        assert_eq!(lost_rows[0].1.changeset_id, Some(rerun.id()));
    }

    #[tokio::test]
    async fn scan_with_processors_extends_the_change_set() {
        let fx = CatalogFixture::with_plugins(test_plugins());
        let source = fx.register_fake_source(&["doc.txt"]);
        let mut conn = fx.catalog.connection().unwrap();
        fx.register_processor(&mut conn, "type sniffer", TYPE_SNIFFER_PLUGIN);
        drop(conn);

        let run = fx.begin_changeset(std::slice::from_ref(&source));
        let status = run_sources(&fx.catalog, &run, &[source.clone()], true).await.unwrap();
        run.finalize(status).await.unwrap();

        let mut conn = fx.catalog.connection().unwrap();
        let assets = crate::update::asset::list_page(&mut conn, 0, 100).unwrap();
        let doc = assets.iter().find(|asset| asset.external_id.as_str() == "doc.txt").unwrap();
        let stored = for_asset(&mut conn, doc.id, true).unwrap();
        assert!(stored.iter().any(|entry| entry.key_id == fx.key_id(&crate::registry::FILE_TYPE)));
        assert!(run.stats().assets_processed >= 1);
    }

    #[tokio::test]
    async fn sidecar_metadata_attaches_to_primary() {
        let fx = CatalogFixture::with_plugins(test_plugins());
        let source = fx.register_fake_source_with_config(
            &["report.pdf", "report.truth.md"],
            json!({"sidecar_suffixes": [".truth.md"]}),
        );
        let run = fx.begin_changeset(std::slice::from_ref(&source));
        run_sources(&fx.catalog, &run, &[source.clone()], false).await.unwrap();
        run.finalize(OpStatus::Completed).await.unwrap();

        let mut conn = fx.catalog.connection().unwrap();
        let assets = crate::update::asset::list_page(&mut conn, 0, 100).unwrap();
        let fake: Vec<_> = assets.iter().filter(|asset| asset.namespace.as_str() == "fake").collect();
        // The sidecar was absorbed, not cataloged.
        assert_eq!(fake.len(), 1);
        assert_eq!(fake[0].external_id.as_str(), "report.pdf");
        // The sidecar's filename observation rode along onto the primary.
        let stored = for_asset(&mut conn, fake[0].id, true).unwrap();
        let names: Vec<_> = stored
            .iter()
            .filter(|entry| entry.key_id == fx.key_id(&FILE_NAME))
            .collect();
        assert_eq!(names.len(), 2);
    }

    #[tokio::test]
    async fn source_error_mid_stream_propagates() {
        let fx = CatalogFixture::with_plugins(test_plugins());
        let source = fx.register_failing_source();
        let run = fx.begin_changeset(std::slice::from_ref(&source));
        let result = run_sources(&fx.catalog, &run, &[source.clone()], false).await;
        assert!(result.is_err());
        run.finalize(OpStatus::Error).await.unwrap();
        assert_eq!(run.status(), OpStatus::Error);
    }
}
