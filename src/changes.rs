use crate::error::{Error, Result};
use crate::model::asset::Asset;
use crate::model::metadata::{Fingerprint, Metadata, MetadataValue};
use crate::registry::{MetadataKey, MetadataRegistry};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Current live values per metadata key id.
pub type CurrentMap = HashMap<i64, Vec<Metadata>>;

/// Tracks metadata state for one asset during a run: the loaded history plus
/// observations staged by sources, processors and editors. Views over the
/// combined log are computed lazily and cached until the next `add`.
pub struct MetadataChanges {
    asset: Asset,
    registry: Arc<MetadataRegistry>,
    loaded: Vec<Metadata>,
    staged: Vec<Metadata>,
    cache: Mutex<Caches>,
}

#[derive(Default)]
struct Caches {
    current: HashMap<Option<i64>, Arc<CurrentMap>>,
    changed: HashMap<Option<i64>, Arc<HashSet<i64>>>,
    latest: Option<Arc<LatestIndex>>,
}

/// Newest changeset id per key, overall and per actor.
#[derive(Default)]
struct LatestIndex {
    by_key: HashMap<i64, i64>,
    by_actor_key: HashMap<i64, HashMap<i64, i64>>,
}

impl MetadataChanges {
    pub fn new(
        asset: Asset,
        registry: Arc<MetadataRegistry>,
        loaded: Vec<Metadata>,
        staged: Vec<Metadata>,
    ) -> Self {
        Self {
            asset,
            registry,
            loaded,
            staged,
            cache: Mutex::new(Caches::default()),
        }
    }

    pub fn asset(&self) -> &Asset {
        &self.asset
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    /// Stage new observations (including tombstones), invalidating views.
    pub fn add(&mut self, entries: impl IntoIterator<Item = Metadata>) {
        self.staged.extend(entries);
        *self.cache.lock().unwrap() = Caches::default();
    }

    /// Observations added during this run, to be persisted.
    pub fn pending_entries(&self) -> &[Metadata] {
        &self.staged
    }

    /// The history this change set was built from.
    pub fn loaded_entries(&self) -> &[Metadata] {
        &self.loaded
    }

    /// Loaded history plus staged observations.
    pub fn all_entries(&self) -> impl Iterator<Item = &Metadata> {
        self.loaded.iter().chain(self.staged.iter())
    }

    /// Current metadata by key id, folding loaded and staged entries under
    /// the newest-non-tombstone-wins rule. Multi-valued keys keep every live
    /// value, newest first.
    pub fn current(&self, actor_id: Option<i64>) -> Arc<CurrentMap> {
        if let Some(cached) = self.cache.lock().unwrap().current.get(&actor_id) {
            return Arc::clone(cached);
        }
        let folded = Arc::new(fold_current(self.all_entries(), actor_id));
        self.cache
            .lock()
            .unwrap()
            .current
            .insert(actor_id, Arc::clone(&folded));
        folded
    }

    /// Key ids whose current fingerprints differ from the loaded baseline.
    pub fn changed_keys(&self, actor_id: Option<i64>) -> Arc<HashSet<i64>> {
        if let Some(cached) = self.cache.lock().unwrap().changed.get(&actor_id) {
            return Arc::clone(cached);
        }
        let baseline = fold_current(self.loaded.iter(), actor_id);
        let current = self.current(actor_id);
        let mut changed = HashSet::new();
        for key_id in baseline.keys().chain(current.keys()) {
            let base_values: HashSet<_> = fingerprints_of(baseline.get(key_id));
            let curr_values: HashSet<_> = fingerprints_of(current.get(key_id));
            if base_values != curr_values {
                changed.insert(*key_id);
            }
        }
        let changed = Arc::new(changed);
        self.cache
            .lock()
            .unwrap()
            .changed
            .insert(actor_id, Arc::clone(&changed));
        changed
    }

    pub fn has(&self, key: &MetadataKey, actor_id: Option<i64>) -> bool {
        !self.entries_for_key(key, actor_id).is_empty()
    }

    /// Current entries for a key, newest first.
    pub fn entries_for_key(&self, key: &MetadataKey, actor_id: Option<i64>) -> Vec<Metadata> {
        let Ok(key_id) = self.registry.id_of(key) else {
            return Vec::new();
        };
        self.current(actor_id)
            .get(&key_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn values_for_key(&self, key: &MetadataKey, actor_id: Option<i64>) -> Vec<MetadataValue> {
        self.entries_for_key(key, actor_id)
            .into_iter()
            .filter_map(|entry| entry.value)
            .collect()
    }

    /// The newest current value for a key, if any.
    pub fn latest_value(&self, key: &MetadataKey, actor_id: Option<i64>) -> Option<MetadataValue> {
        self.entries_for_key(key, actor_id)
            .into_iter()
            .next()
            .and_then(|entry| entry.value)
    }

    pub fn latest_text(&self, key: &MetadataKey, actor_id: Option<i64>) -> Option<String> {
        match self.latest_value(key, actor_id) {
            Some(MetadataValue::Text(text)) => Some(text.to_string()),
            _ => None,
        }
    }

    pub fn latest_int(&self, key: &MetadataKey, actor_id: Option<i64>) -> Option<i64> {
        self.latest_value(key, actor_id).and_then(|value| value.as_int())
    }

    /// Newest changeset id among entries for the given keys, optionally
    /// restricted to one actor. Used to decide whether inputs changed since
    /// an actor's last output.
    pub fn latest_changeset_id(&self, keys: &[MetadataKey], actor_id: Option<i64>) -> Option<i64> {
        if keys.is_empty() {
            return None;
        }
        let index = self.latest_index();
        let key_ids: Vec<i64> = keys.iter().filter_map(|key| self.registry.id_of(key).ok()).collect();
        let latest = match actor_id {
            None => key_ids
                .iter()
                .filter_map(|key_id| index.by_key.get(key_id).copied())
                .max(),
            Some(actor_id) => index.by_actor_key.get(&actor_id).and_then(|actor_index| {
                key_ids
                    .iter()
                    .filter_map(|key_id| actor_index.get(key_id).copied())
                    .max()
            }),
        };
        latest.filter(|&changeset_id| changeset_id != 0)
    }

    /// True if any of `keys` changed after `actor_id` last wrote one of its
    /// output keys. An actor that never produced output is always stale.
    pub fn changed_since_actor(&self, keys: &[MetadataKey], actor_id: i64, actor_outputs: &[MetadataKey]) -> bool {
        let Some(last_run) = self.latest_changeset_id(actor_outputs, Some(actor_id)) else {
            return true;
        };
        match self.latest_changeset_id(keys, None) {
            Some(latest_dep) => latest_dep > last_run,
            None => false,
        }
    }

    fn latest_index(&self) -> Arc<LatestIndex> {
        if let Some(cached) = &self.cache.lock().unwrap().latest {
            return Arc::clone(cached);
        }
        let mut index = LatestIndex::default();
        for entry in self.all_entries() {
            let Some(changeset_id) = entry.changeset_id else {
                continue;
            };
            let newest = index.by_key.entry(entry.key_id).or_insert(0);
            *newest = (*newest).max(changeset_id);
            if let Some(actor_id) = entry.actor_id {
                let newest = index
                    .by_actor_key
                    .entry(actor_id)
                    .or_default()
                    .entry(entry.key_id)
                    .or_insert(0);
                *newest = (*newest).max(changeset_id);
            }
        }
        let index = Arc::new(index);
        self.cache.lock().unwrap().latest = Some(Arc::clone(&index));
        index
    }

    /// Computes the rows to append for this asset, given the authoritative
    /// `existing_metadata` snapshot from the store. Applies the per-key
    /// skip-false and clear-on-false policies, emits tombstones for clear
    /// requests, and drops staged entries already reflected in the log.
    ///
    /// Returns the rows to insert and the set of affected key ids. Calling
    /// twice against a snapshot that includes the first call's output yields
    /// nothing.
    pub fn prepare_persist(
        &self,
        changeset_id: i64,
        existing_metadata: &[Metadata],
    ) -> Result<(Vec<Metadata>, HashSet<i64>)> {
        if self.staged.is_empty() {
            return Ok((Vec::new(), HashSet::new()));
        }

        // Newest state per (key, actor, fingerprint): true when the latest
        // row for that value is a tombstone.
        let mut ordered_existing: Vec<&Metadata> = existing_metadata.iter().collect();
        ordered_existing
            .sort_by_key(|entry| std::cmp::Reverse((entry.changeset_id.unwrap_or(0), entry.id.unwrap_or(0))));
        let mut latest_states: HashMap<(i64, i64, Fingerprint), bool> = HashMap::new();
        for entry in ordered_existing {
            let (Some(fingerprint), Some(actor_id)) = (entry.fingerprint(), entry.actor_id) else {
                continue;
            };
            latest_states
                .entry((entry.key_id, actor_id, fingerprint))
                .or_insert(entry.removed);
        }

        let mut to_create: Vec<Metadata> = Vec::new();
        let mut changed_keys: HashSet<i64> = HashSet::new();

        // Classify staged entries into clear requests and skips.
        let mut clear_groups: HashSet<(i64, i64)> = HashSet::new();
        let mut skipped: HashSet<usize> = HashSet::new();
        for (index, entry) in self.staged.iter().enumerate() {
            let actor_id = entry.actor_id.ok_or(Error::IncompleteMetadata("actor_id"))?;
            let def = self.registry.def_by_id(entry.key_id)?;
            let falsey = entry.value.as_ref().is_some_and(MetadataValue::is_falsey);
            if !entry.removed && falsey && def.clear_on_false {
                clear_groups.insert((entry.key_id, actor_id));
                skipped.insert(index);
                continue;
            }
            if !entry.removed && falsey && def.skip_false {
                skipped.insert(index);
                continue;
            }
            if entry.fingerprint().is_none() && !entry.removed {
                clear_groups.insert((entry.key_id, actor_id));
            }
        }

        // Tombstone every live value of each cleared (key, actor) group.
        if !clear_groups.is_empty() {
            let mut existing_current_by_actor: HashMap<i64, CurrentMap> = HashMap::new();
            for &(key_id, actor_id) in &clear_groups {
                let current = existing_current_by_actor
                    .entry(actor_id)
                    .or_insert_with(|| fold_current(existing_metadata.iter(), Some(actor_id)));
                for live in current.get(&key_id).cloned().unwrap_or_default() {
                    let (Some(fingerprint), Some(entry_actor)) = (live.fingerprint(), live.actor_id) else {
                        continue;
                    };
                    let state_key = (live.key_id, entry_actor, fingerprint);
                    if latest_states.get(&state_key).copied().unwrap_or(false) {
                        continue;
                    }
                    let mut tombstone = Metadata::tombstone_of(&live, changeset_id);
                    tombstone.asset_id = Some(self.asset.id);
                    to_create.push(tombstone);
                    latest_states.insert(state_key, true);
                    changed_keys.insert(key_id);
                }
            }
        }

        // Append surviving staged entries not already reflected in the log.
        for (index, entry) in self.staged.iter().enumerate() {
            if skipped.contains(&index) {
                continue;
            }
            let Some(fingerprint) = entry.fingerprint() else {
                continue;
            };
            let actor_id = entry.actor_id.ok_or(Error::IncompleteMetadata("actor_id"))?;
            let mut entry = entry.clone();
            if entry.asset_id.is_none() {
                entry.asset_id = Some(self.asset.id);
            }
            if entry.changeset_id.is_none() {
                entry.changeset_id = Some(changeset_id);
            }
            let state_key = (entry.key_id, actor_id, fingerprint);
            if latest_states.get(&state_key) == Some(&entry.removed) {
                continue;
            }
            latest_states.insert(state_key, entry.removed);
            changed_keys.insert(entry.key_id);
            to_create.push(entry);
        }

        Ok((to_create, changed_keys))
    }
}

impl Clone for MetadataChanges {
    fn clone(&self) -> Self {
        Self {
            asset: self.asset.clone(),
            registry: Arc::clone(&self.registry),
            loaded: self.loaded.clone(),
            staged: self.staged.clone(),
            cache: Mutex::new(Caches::default()),
        }
    }
}

impl std::fmt::Debug for MetadataChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataChanges")
            .field("asset_id", &self.asset.id)
            .field("loaded", &self.loaded.len())
            .field("staged", &self.staged.len())
            .finish()
    }
}

fn fingerprints_of(entries: Option<&Vec<Metadata>>) -> HashSet<Fingerprint> {
    entries
        .into_iter()
        .flatten()
        .filter_map(Metadata::fingerprint)
        .collect()
}

/// Folds a metadata log into its current view: newest first, first occurrence
/// per (key, fingerprint) wins, tombstoned values drop out. Entries not yet
/// bound to a changeset are this run's observations and sort newest.
fn fold_current<'a>(entries: impl Iterator<Item = &'a Metadata>, actor_id: Option<i64>) -> CurrentMap {
    let mut ordered: Vec<&Metadata> = entries.collect();
    ordered.sort_by_key(|entry| {
        std::cmp::Reverse((
            entry.changeset_id.unwrap_or(i64::MAX),
            entry.id.unwrap_or(i64::MAX),
        ))
    });

    let mut result: CurrentMap = HashMap::new();
    let mut seen: HashSet<(i64, Fingerprint)> = HashSet::new();
    for entry in ordered {
        if actor_id.is_some() && entry.actor_id != actor_id {
            continue;
        }
        let Some(fingerprint) = entry.fingerprint() else {
            continue;
        };
        if !seen.insert((entry.key_id, fingerprint)) {
            continue;
        }
        if entry.removed {
            continue;
        }
        result.entry(entry.key_id).or_default().push(entry.clone());
    }
    result
}
