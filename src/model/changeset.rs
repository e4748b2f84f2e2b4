use crate::catalog::Catalog;
use crate::config;
use crate::error::{Error, Result};
use crate::model::actor::Actor;
use crate::model::enums::OpStatus;
use crate::model::json::Json;
use crate::schema::changesets;
use crate::time::now_ms;
use crate::update;
use diesel::prelude::*;
use diesel::sqlite::Sqlite;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A transactional boundary for a set of observations. The id is the
/// creation wall clock in milliseconds, so ordering by id is chronological.
#[derive(Debug, Clone, AsChangeset, Identifiable, Queryable, Selectable)]
#[diesel(treat_none_as_null = true)]
#[diesel(table_name = changesets)]
#[diesel(check_for_backend(Sqlite))]
pub struct Changeset {
    pub id: i64,
    pub message: Option<String>,
    pub running_time_ms: Option<i64>,
    pub status: OpStatus,
    pub data: Option<Json>,
}

#[derive(Insertable)]
#[diesel(table_name = changesets)]
#[diesel(check_for_backend(Sqlite))]
pub struct NewChangeset<'a> {
    pub id: i64,
    pub message: Option<&'a str>,
    pub status: OpStatus,
    pub data: Option<&'a Json>,
}

/// Counters accumulated while a changeset runs; merged into the persisted
/// `data.stats` payload on finalize.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct ChangesetStats {
    /// Total assets encountered during scan (saved + ignored).
    pub assets_seen: u64,
    pub assets_saved: u64,
    pub assets_ignored: u64,

    pub assets_changed: u64,
    pub assets_added: u64,
    pub assets_lost: u64,
    pub assets_processed: u64,

    pub metadata_values_changed: u64,
    pub metadata_values_added: u64,
    pub metadata_values_removed: u64,

    pub processings_started: u64,
    pub processings_completed: u64,
    pub processings_partial: u64,
    pub processings_cancelled: u64,
    pub processings_skipped: u64,
    pub processings_error: u64,
}

impl ChangesetStats {
    pub fn record_processing(&mut self, status: OpStatus) {
        match status {
            OpStatus::Completed => self.processings_completed += 1,
            OpStatus::Partial => self.processings_partial += 1,
            OpStatus::Canceled => self.processings_cancelled += 1,
            OpStatus::Skipped => self.processings_skipped += 1,
            OpStatus::Error => self.processings_error += 1,
            OpStatus::InProgress => {}
        }
    }
}

/// Runtime state of an in-progress changeset: counters, the task set running
/// under it, the concurrency gate and the cancellation flag.
pub struct ChangesetRun {
    catalog: Catalog,
    changeset: Mutex<Changeset>,
    stats: Mutex<ChangesetStats>,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<Result<()>>>>,
    tasks_queued: AtomicUsize,
    tasks_running: AtomicUsize,
    tasks_finished: AtomicUsize,
    cancel_flag: AtomicBool,
    done: Notify,
    finished: AtomicBool,
}

impl ChangesetRun {
    /// Opens a new changeset. Fails if any changeset is currently in
    /// progress, or on the (pathological) id collision within one
    /// millisecond.
    pub fn begin(
        catalog: &Catalog,
        actors: &[Actor],
        message: Option<&str>,
        data: Option<Json>,
    ) -> Result<Arc<ChangesetRun>> {
        let mut conn = catalog.connection()?;
        if let Some(existing) = update::changeset::find_in_progress(&mut conn)? {
            return Err(Error::ChangesetInProgress(existing.id));
        }
        let id = now_ms();
        if update::changeset::get(&mut conn, id).optional()?.is_some() {
            return Err(Error::ChangesetIdCollision(id));
        }
        let changeset = update::changeset::create(
            &mut conn,
            NewChangeset {
                id,
                message,
                status: OpStatus::InProgress,
                data: data.as_ref(),
            },
        )?;
        let actor_ids: Vec<i64> = actors.iter().map(|actor| actor.id).collect();
        update::changeset::add_actors(&mut conn, id, &actor_ids)?;
        info!(changeset_id = id, actors = actor_ids.len(), "Changeset started");

        Ok(Arc::new(ChangesetRun {
            catalog: catalog.clone(),
            changeset: Mutex::new(changeset),
            stats: Mutex::new(ChangesetStats::default()),
            semaphore: Arc::new(Semaphore::new(config::task_concurrency())),
            tasks: Mutex::new(Vec::new()),
            tasks_queued: AtomicUsize::new(0),
            tasks_running: AtomicUsize::new(0),
            tasks_finished: AtomicUsize::new(0),
            cancel_flag: AtomicBool::new(false),
            done: Notify::new(),
            finished: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> i64 {
        self.changeset.lock().unwrap().id
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn stats(&self) -> MutexGuard<'_, ChangesetStats> {
        self.stats.lock().unwrap()
    }

    pub fn status(&self) -> OpStatus {
        self.changeset.lock().unwrap().status
    }

    /// Merges an entry into the changeset's `data` payload.
    pub fn merge_data(&self, key: &str, value: serde_json::Value) {
        let mut changeset = self.changeset.lock().unwrap();
        let mut data = match changeset.data.take() {
            Some(Json(serde_json::Value::Object(map))) => map,
            _ => serde_json::Map::new(),
        };
        data.insert(key.to_owned(), value);
        changeset.data = Some(Json(serde_json::Value::Object(data)));
    }

    /// Signals cancellation. Long-running loops check the flag at batch
    /// boundaries; running tasks complete their current item.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_flag.load(Ordering::SeqCst)
    }

    /// Errors with `Canceled` when cancellation has been signaled.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() { Err(Error::Canceled) } else { Ok(()) }
    }

    fn log_task_progress(&self) {
        debug!(
            changeset_id = self.id(),
            queued = self.tasks_queued.load(Ordering::Relaxed),
            running = self.tasks_running.load(Ordering::Relaxed),
            finished = self.tasks_finished.load(Ordering::Relaxed),
            "tasks_progress",
        );
    }

    /// Runs a future under this changeset's semaphore without tracking it.
    /// The caller owns the handle and must await it.
    pub fn submit<T, F>(self: &Arc<Self>, fut: F) -> JoinHandle<Result<T>>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.tasks_queued.fetch_add(1, Ordering::Relaxed);
        self.log_task_progress();
        let run = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = run
                .semaphore
                .acquire()
                .await
                .expect("changeset semaphore is never closed");
            run.tasks_queued.fetch_sub(1, Ordering::Relaxed);
            run.tasks_running.fetch_add(1, Ordering::Relaxed);
            run.log_task_progress();
            let result = match run.check_cancelled() {
                Ok(()) => fut.await,
                Err(err) => Err(err),
            };
            run.tasks_running.fetch_sub(1, Ordering::Relaxed);
            run.tasks_finished.fetch_add(1, Ordering::Relaxed);
            run.log_task_progress();
            result
        })
    }

    /// Enqueues a tracked sub-task; `finalize` drains all tracked tasks
    /// before persisting the final row.
    pub fn enqueue<F>(self: &Arc<Self>, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let handle = self.submit(fut);
        self.tasks.lock().unwrap().push(handle);
    }

    /// Drives `fut` as this changeset's main operation: on success the
    /// changeset completes, a cancellation error finalizes it as canceled,
    /// and any other error is captured into `data` before finalizing as
    /// error.
    pub fn start_operation<F>(self: &Arc<Self>, fut: F) -> JoinHandle<Result<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let run = Arc::clone(self);
        tokio::spawn(async move {
            let result = fut.await;
            let status = match &result {
                Ok(()) => OpStatus::Completed,
                Err(err) if err.is_cancellation() => OpStatus::Canceled,
                Err(err) => {
                    run.merge_data("error_message", serde_json::Value::String(err.to_string()));
                    run.merge_data("error_detail", serde_json::Value::String(format!("{err:?}")));
                    OpStatus::Error
                }
            };
            if let Err(finalize_err) = run.finalize(status).await {
                error!(changeset_id = run.id(), "Failed to finalize changeset: {finalize_err}");
            }
            result
        })
    }

    /// Awaits every tracked sub-task, logging failures. Called by the scan
    /// runtime after a source's stream ends and again by `finalize`.
    pub async fn drain_tasks(&self) {
        let pending: Vec<JoinHandle<Result<()>>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        if pending.is_empty() {
            return;
        }
        info!(changeset_id = self.id(), count = pending.len(), "Draining changeset tasks");
        let mut failures = 0usize;
        for handle in pending {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(changeset_id = self.id(), "Changeset task failed: {err}");
                    failures += 1;
                }
                Err(join_err) => {
                    warn!(changeset_id = self.id(), "Changeset task panicked: {join_err}");
                    failures += 1;
                }
            }
        }
        if failures > 0 {
            warn!(changeset_id = self.id(), failures, "Changeset tasks finished with failures");
        }
    }

    /// Awaits remaining sub-tasks, merges stats into `data`, computes the
    /// running time and persists the final row.
    pub async fn finalize(&self, status: OpStatus) -> Result<()> {
        self.drain_tasks().await;

        let stats = self.stats.lock().unwrap().clone();
        self.merge_data("stats", serde_json::to_value(&stats)?);

        let row = {
            let mut changeset = self.changeset.lock().unwrap();
            changeset.status = status;
            if changeset.running_time_ms.is_none() {
                changeset.running_time_ms = Some(now_ms() - changeset.id);
            }
            changeset.clone()
        };
        let mut conn = self.catalog.connection()?;
        update::changeset::save(&mut conn, &row)?;
        info!(changeset_id = row.id, status = %status, "Changeset finalized");
        self.finished.store(true, Ordering::SeqCst);
        self.done.notify_waiters();
        Ok(())
    }

    /// Waits until the changeset has finalized.
    pub async fn wait_done(&self) {
        while !self.finished.load(Ordering::SeqCst) {
            let notified = self.done.notified();
            if self.finished.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test::*;
    use crate::update;

    #[tokio::test]
    async fn second_begin_is_rejected_while_in_progress() {
        let fx = CatalogFixture::new();
        let run = fx.begin_changeset(&[]);
        let second = ChangesetRun::begin(&fx.catalog, &[], None, None);
        assert!(matches!(second, Err(Error::ChangesetInProgress(id)) if id == run.id()));

        // No row was created by the rejected begin.
        let mut conn = fx.catalog.connection().unwrap();
        let count: i64 = crate::schema::changesets::table.count().get_result(&mut conn).unwrap();
        assert_eq!(count, 1);
        drop(conn);

        run.finalize(OpStatus::Completed).await.unwrap();
        let next = fx.begin_changeset(&[]);
        assert!(next.id() >= run.id());
        next.finalize(OpStatus::Completed).await.unwrap();
    }

    #[tokio::test]
    async fn finalize_merges_stats_and_running_time() {
        let fx = CatalogFixture::new();
        let run = fx.begin_changeset(std::slice::from_ref(&fx.actor));
        run.stats().assets_seen = 7;
        run.stats().assets_added = 3;
        run.finalize(OpStatus::Completed).await.unwrap();

        let mut conn = fx.catalog.connection().unwrap();
        let row = update::changeset::get(&mut conn, run.id()).unwrap();
        assert_eq!(row.status, OpStatus::Completed);
        assert!(row.running_time_ms.unwrap() >= 0);
        let data = row.data.unwrap();
        assert_eq!(data.pointer("/stats/assets_seen"), Some(&serde_json::json!(7)));
        assert_eq!(data.pointer("/stats/assets_added"), Some(&serde_json::json!(3)));
        assert_eq!(update::changeset::load_actor_ids(&mut conn, run.id()).unwrap(), vec![fx.actor.id]);
    }

    #[tokio::test]
    async fn failed_operation_captures_error_into_data() {
        let fx = CatalogFixture::new();
        let run = fx.begin_changeset(&[]);
        let handle = run.start_operation(async { Err(Error::InvalidQuery("scan exploded".into())) });
        assert!(handle.await.unwrap().is_err());
        run.wait_done().await;

        let mut conn = fx.catalog.connection().unwrap();
        let row = update::changeset::get(&mut conn, run.id()).unwrap();
        assert_eq!(row.status, OpStatus::Error);
        let data = row.data.unwrap();
        assert_eq!(
            data.pointer("/error_message"),
            Some(&serde_json::json!("Invalid query: scan exploded")),
        );
    }

    #[tokio::test]
    async fn cancellation_finalizes_as_canceled() {
        let fx = CatalogFixture::new();
        let run = fx.begin_changeset(&[]);
        run.cancel();
        let gate = Arc::clone(&run);
        let handle = run.start_operation(async move {
            gate.check_cancelled()?;
            Ok(())
        });
        assert!(handle.await.unwrap().is_err());
        run.wait_done().await;

        let mut conn = fx.catalog.connection().unwrap();
        let row = update::changeset::get(&mut conn, run.id()).unwrap();
        assert_eq!(row.status, OpStatus::Canceled);
    }

    #[tokio::test]
    async fn enqueued_tasks_respect_cancellation() {
        let fx = CatalogFixture::new();
        let run = fx.begin_changeset(&[]);
        run.cancel();
        let task = run.submit(async { Ok(42) });
        assert!(matches!(task.await.unwrap(), Err(Error::Canceled)));
        run.finalize(OpStatus::Canceled).await.unwrap();
    }

    #[tokio::test]
    async fn submit_limits_concurrency() {
        use std::sync::atomic::AtomicUsize;

        let fx = CatalogFixture::new();
        let run = fx.begin_changeset(&[]);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..30)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                run.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= crate::config::task_concurrency());
        run.finalize(OpStatus::Completed).await.unwrap();
    }
}
