use crate::catalog::Catalog;
use crate::changes::MetadataChanges;
use crate::config;
use crate::error::{Error, Result};
use crate::model::actor::Actor;
use crate::model::asset::Asset;
use crate::model::changeset::ChangesetRun;
use crate::model::enums::{ActorType, ExecutionMode, OpStatus};
use crate::plugin::processor::{Processor, ProcessorResult};
use crate::registry::MetadataKey;
use crate::update;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A processor actor paired with its constructed plugin instance.
#[derive(Clone)]
pub struct ProcessorHandle {
    pub actor: Actor,
    pub plugin: Arc<dyn Processor>,
}

/// Processors that may run concurrently; stage N+1 only starts once stage N
/// has finished, so its outputs are visible downstream.
pub type ProcessorStage = Vec<ProcessorHandle>;

/// Orders enabled processor actors into stages with Kahn's algorithm:
/// a processor writing a key precedes every processor reading it. Ties are
/// broken by the actors' `(order, sequence)` config hints, then id. Every
/// processor must report ready before being ordered; a cycle is an error.
pub async fn sort_processors(catalog: &Catalog, actor_ids: Option<&[i64]>) -> Result<Vec<ProcessorStage>> {
    let actors = {
        let mut conn = catalog.connection()?;
        match actor_ids {
            Some(ids) => update::actor::list_enabled_by_ids(&mut conn, ActorType::Processor, ids)?,
            None => update::actor::list_enabled(&mut conn, ActorType::Processor)?,
        }
    };
    if actors.is_empty() {
        warn!("No processor actors found");
        return Ok(Vec::new());
    }

    let mut handles: HashMap<i64, ProcessorHandle> = HashMap::new();
    let mut outputs_by_actor: HashMap<i64, Vec<MetadataKey>> = HashMap::new();
    let mut dependencies_by_actor: HashMap<i64, Vec<MetadataKey>> = HashMap::new();
    for actor in actors {
        let plugin = catalog.processor_instance(&actor)?;
        if let Err(reason) = plugin.is_ready().await {
            return Err(Error::ProcessorNotReady {
                name: actor.name.to_string(),
                plugin_id: plugin.plugin_id().to_owned(),
                reason,
            });
        }
        outputs_by_actor.insert(actor.id, plugin.outputs().to_vec());
        dependencies_by_actor.insert(actor.id, plugin.dependencies().to_vec());
        handles.insert(actor.id, ProcessorHandle { actor, plugin });
    }

    let mut producers_of_key: HashMap<&MetadataKey, HashSet<i64>> = HashMap::new();
    for (&actor_id, outputs) in &outputs_by_actor {
        for output in outputs {
            producers_of_key.entry(output).or_default().insert(actor_id);
        }
    }
    let mut remaining: HashMap<i64, HashSet<i64>> = HashMap::new();
    for (&actor_id, dependencies) in &dependencies_by_actor {
        let mut producers: HashSet<i64> = HashSet::new();
        for dependency in dependencies {
            if let Some(found) = producers_of_key.get(dependency) {
                producers.extend(found);
            }
        }
        producers.remove(&actor_id);
        remaining.insert(actor_id, producers);
    }

    let mut stages: Vec<ProcessorStage> = Vec::new();
    while !remaining.is_empty() {
        let mut ready: Vec<i64> = remaining
            .iter()
            .filter(|(_, blockers)| blockers.is_empty())
            .map(|(&actor_id, _)| actor_id)
            .collect();
        if ready.is_empty() {
            let stuck: Vec<String> = remaining
                .keys()
                .map(|actor_id| handles[actor_id].actor.name.to_string())
                .collect();
            return Err(Error::CircularDependency(stuck.join(", ")));
        }
        ready.sort_by_key(|actor_id| {
            let actor = &handles[actor_id].actor;
            (actor.order_hint(), actor.id)
        });
        for actor_id in &ready {
            remaining.remove(actor_id);
        }
        for blockers in remaining.values_mut() {
            for actor_id in &ready {
                blockers.remove(actor_id);
            }
        }
        stages.push(ready.iter().map(|actor_id| handles[actor_id].clone()).collect());
    }
    Ok(stages)
}

async fn run_owned(plugin: Arc<dyn Processor>, actor_id: i64, changes: MetadataChanges) -> ProcessorResult {
    let asset_id = changes.asset().id;
    debug!(actor_id, asset_id, "Running processor {}", plugin.plugin_id());
    match plugin.run(&changes, actor_id).await {
        Ok(result) => result,
        Err(err) => ProcessorResult::error(format!(
            "Processor {} failed for asset {asset_id}: {err}",
            plugin.plugin_id(),
        )),
    }
}

/// Dispatches one processor according to its execution mode: inline on the
/// async runtime, on the blocking thread pool, or on the shared rayon pool.
async fn dispatch(handle: &ProcessorHandle, changes: &MetadataChanges) -> ProcessorResult {
    let plugin = Arc::clone(&handle.plugin);
    let actor_id = handle.actor.id;
    match handle.plugin.execution_mode() {
        ExecutionMode::Async => run_owned(plugin, actor_id, changes.clone()).await,
        ExecutionMode::Threads => {
            let changes = changes.clone();
            let runtime = tokio::runtime::Handle::current();
            tokio::task::spawn_blocking(move || runtime.block_on(run_owned(plugin, actor_id, changes)))
                .await
                .unwrap_or_else(|join_err| {
                    ProcessorResult::error(format!("Processor worker thread panicked: {join_err}"))
                })
        }
        ExecutionMode::Cpu => {
            let changes = changes.clone();
            let (result_tx, result_rx) = tokio::sync::oneshot::channel();
            rayon::spawn(move || {
                let result = futures::executor::block_on(run_owned(plugin, actor_id, changes));
                let _ = result_tx.send(result);
            });
            result_rx
                .await
                .unwrap_or_else(|_| ProcessorResult::error("Processor worker exited without a result"))
        }
    }
}

/// Runs the staged pipeline over one asset's change set. Results of each
/// stage are merged into the change set before the next stage starts, so
/// downstream processors observe upstream outputs via `current()`.
pub async fn run_pipeline(
    run: &ChangesetRun,
    stages: &[ProcessorStage],
    mut changes: MetadataChanges,
    force_run: bool,
) -> Result<MetadataChanges> {
    run.stats().assets_processed += 1;
    for stage in stages {
        let mut dispatches = Vec::new();
        for handle in stage {
            if !force_run && !handle.plugin.should_run(&changes, handle.actor.id) {
                continue;
            }
            run.stats().processings_started += 1;
            dispatches.push(dispatch(handle, &changes));
        }
        if dispatches.is_empty() {
            continue;
        }
        let results = futures::future::join_all(dispatches).await;
        let mut stage_metadata = Vec::new();
        for result in results {
            run.stats().record_processing(result.status);
            match result.status {
                OpStatus::Canceled | OpStatus::Error | OpStatus::Skipped => {
                    if let Some(message) = result.message {
                        warn!(changeset_id = run.id(), "{message}");
                    }
                }
                _ => stage_metadata.extend(result.metadata),
            }
        }
        changes.add(stage_metadata);
    }
    Ok(changes)
}

/// Runs the pipeline for one asset and persists the outcome immediately.
/// Used by the scan runtime, which processes assets as they stream in.
pub async fn process_asset(
    catalog: &Catalog,
    run: &ChangesetRun,
    stages: &[ProcessorStage],
    changes: MetadataChanges,
) -> Result<HashSet<i64>> {
    let updated = run_pipeline(run, stages, changes, false).await?;
    let mut conn = catalog.connection()?;
    let changed = update::metadata::persist_changes(&mut conn, &updated, run.id())?;
    if !changed.is_empty() {
        let mut stats = run.stats();
        stats.assets_changed += 1;
        stats.metadata_values_changed += changed.len() as u64;
    }
    Ok(changed)
}

/// Which assets a batch processor run covers.
pub enum ProcessorSelection {
    /// The whole catalog, paged.
    All,
    Assets(Vec<Asset>),
    AssetIds(Vec<i64>),
}

/// Re-runs processors over existing assets in batches: one bulk metadata
/// read and one write transaction per batch, with per-asset pipeline runs
/// fanned out under the changeset's concurrency limit. Processors run
/// unconditionally (`force_run`).
pub async fn do_run_processors(
    catalog: &Catalog,
    run: &Arc<ChangesetRun>,
    stages: &[ProcessorStage],
    selection: ProcessorSelection,
) -> Result<()> {
    let batch_size = config::batch_size();
    info!(changeset_id = run.id(), batch_size, "Processor run starting");
    let stages = Arc::new(stages.to_vec());

    match selection {
        ProcessorSelection::AssetIds(mut asset_ids) => {
            asset_ids.sort_unstable();
            let mut batch_index = 0;
            for id_batch in asset_ids.chunks(batch_size) {
                let batch_assets = {
                    let mut conn = catalog.connection()?;
                    update::asset::list_by_ids(&mut conn, id_batch)?
                };
                if batch_assets.len() != id_batch.len() {
                    let found: HashSet<i64> = batch_assets.iter().map(|asset| asset.id).collect();
                    let missing: Vec<i64> =
                        id_batch.iter().copied().filter(|asset_id| !found.contains(asset_id)).collect();
                    return Err(Error::InvalidQuery(format!("Asset ids not found: {missing:?}")));
                }
                batch_index += 1;
                process_batch(catalog, run, &stages, batch_assets, batch_index).await?;
            }
        }
        ProcessorSelection::Assets(assets) => {
            let mut batch_index = 0;
            for batch_assets in assets.chunks(batch_size) {
                batch_index += 1;
                process_batch(catalog, run, &stages, batch_assets.to_vec(), batch_index).await?;
            }
        }
        ProcessorSelection::All => {
            let mut offset = 0i64;
            let mut batch_index = 0;
            loop {
                let batch_assets = {
                    let mut conn = catalog.connection()?;
                    update::asset::list_page(&mut conn, offset, batch_size as i64)?
                };
                if batch_assets.is_empty() {
                    break;
                }
                offset += batch_assets.len() as i64;
                batch_index += 1;
                process_batch(catalog, run, &stages, batch_assets, batch_index).await?;
            }
        }
    }
    Ok(())
}

async fn process_batch(
    catalog: &Catalog,
    run: &Arc<ChangesetRun>,
    stages: &Arc<Vec<ProcessorStage>>,
    batch_assets: Vec<Asset>,
    batch_index: usize,
) -> Result<()> {
    run.check_cancelled()?;
    let asset_ids: Vec<i64> = batch_assets.iter().map(|asset| asset.id).collect();
    info!(
        changeset_id = run.id(),
        batch = batch_index,
        assets = batch_assets.len(),
        "Processor batch read start",
    );
    let existing_by_asset = {
        let mut conn = catalog.connection()?;
        update::metadata::for_assets(&mut conn, &asset_ids, true)?
    };
    let loaded_rows: usize = existing_by_asset.values().map(Vec::len).sum();
    debug!(
        changeset_id = run.id(),
        batch = batch_index,
        metadata = loaded_rows,
        "Processor batch read done",
    );

    let mut tasks = Vec::with_capacity(batch_assets.len());
    for asset in batch_assets {
        {
            let mut stats = run.stats();
            stats.assets_seen += 1;
            stats.assets_saved += 1;
        }
        let loaded = existing_by_asset.get(&asset.id).cloned().unwrap_or_default();
        let changes = MetadataChanges::new(asset, catalog.registry_arc(), loaded, Vec::new());
        let stages = Arc::clone(stages);
        let task_run = Arc::clone(run);
        tasks.push(run.submit(async move { run_pipeline(&task_run, &stages, changes, true).await }));
    }
    let mut changes_list = Vec::with_capacity(tasks.len());
    for task in tasks {
        changes_list.push(task.await??);
    }

    let (rows, upserts, deletes) = {
        let mut conn = catalog.connection()?;
        update::metadata::persist_changes_batch(&mut conn, run.id(), &changes_list, &existing_by_asset)?
    };
    if rows > 0 {
        run.stats().metadata_values_changed += rows as u64;
    }
    info!(
        changeset_id = run.id(),
        batch = batch_index,
        rows,
        search_upserts = upserts,
        search_deletes = deletes,
        "Processor batch persist done",
    );
    Ok(())
}
