//! Task scheduler: worker pool, run loop, and external controls.
//!
//! One in-memory FIFO queue of task ids and a set of currently running ids.
//! `pump` fills worker slots up to the mutable ceiling; each worker owns one
//! task from `running` through its terminal state. External controls
//! (pause/resume/cancel/retry/delete) come from the REST layer and follow
//! the allowed-state table; anything else is a `Conflict`.

use anyhow::{Context, Result};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use crate::commit;
use crate::fetch::Fetcher;
use crate::policy::Policy;
use crate::progress::ProgressReporter;
use crate::sources::{adapter_for, canonical_id, AdapterContext, SourceKind};
use crate::stop::{StopMode, StopRegistry, Stopped};
use crate::store::{Library, TaskParams, TaskStatus};

/// Valid request refused by current task/library state (REST 409).
#[derive(Debug)]
pub struct Conflict(pub String);

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for Conflict {}

/// Unknown task id (REST 404).
#[derive(Debug)]
pub struct NotFound;

impl std::fmt::Display for NotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task not found")
    }
}

impl std::error::Error for NotFound {}

struct Inner {
    db: Library,
    storage: PathBuf,
    policy: RwLock<Policy>,
    queue: Mutex<VecDeque<String>>,
    running: Mutex<HashSet<String>>,
    stops: StopRegistry,
    /// Serializes the duplicate checks in `create_download_task` against
    /// the row insert, so concurrent creates for one target cannot both
    /// pass the checks.
    create_lock: tokio::sync::Mutex<()>,
    debug: bool,
}

/// Process-wide download scheduler. Cheap to clone; all clones share one
/// queue and worker set.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(db: Library, storage: PathBuf, policy: Policy) -> Self {
        let debug = std::env::var("PICA_TASK_DEBUG").map(|v| v == "1").unwrap_or(false);
        Self {
            inner: Arc::new(Inner {
                db,
                storage,
                policy: RwLock::new(policy),
                queue: Mutex::new(VecDeque::new()),
                running: Mutex::new(HashSet::new()),
                stops: StopRegistry::new(),
                create_lock: tokio::sync::Mutex::new(()),
                debug,
            }),
        }
    }

    pub fn db(&self) -> &Library {
        &self.inner.db
    }

    pub fn storage(&self) -> &std::path::Path {
        &self.inner.storage
    }

    /// Snapshot of the current policy record.
    pub fn policy(&self) -> Policy {
        self.inner.policy.read().unwrap().clone()
    }

    /// Swap in an updated policy record. Raising the worker ceiling resumes
    /// pumping immediately.
    pub fn update_policy(
        &self,
        max_concurrent: Option<usize>,
        file_concurrent_default: Option<usize>,
    ) -> Policy {
        let next = {
            let mut guard = self.inner.policy.write().unwrap();
            *guard = guard.with_updates(max_concurrent, file_concurrent_default);
            guard.clone()
        };
        self.pump();
        next
    }

    /// Boot recovery, once per process start before accepting REST traffic:
    /// stranded `running` rows become `failed`, queued rows re-enter the
    /// queue oldest-first, and the pump starts.
    pub async fn recover_and_start(&self) -> Result<()> {
        let queued = self.inner.db.recover_on_boot().await?;
        if !queued.is_empty() {
            tracing::info!("re-enqueueing {} queued task(s) from previous run", queued.len());
            let mut queue = self.inner.queue.lock().unwrap();
            queue.extend(queued);
        }
        self.pump();
        Ok(())
    }

    /// Create a queued download task. Rejects a target that is already in
    /// the library and a (source, target) that already has an active task.
    pub async fn create_download_task(
        &self,
        source: SourceKind,
        target: &str,
        params: TaskParams,
    ) -> Result<String> {
        let canonical = canonical_id(source, target)?;
        let _guard = self.inner.create_lock.lock().await;
        if self.inner.db.comic_exists(&canonical).await? {
            return Err(Conflict("already downloaded".into()).into());
        }
        if self
            .inner
            .db
            .find_active_task(source, target)
            .await?
            .is_some()
        {
            return Err(Conflict("task already exists".into()).into());
        }
        let id = self.inner.db.insert_task(source, target, &params).await?;
        tracing::info!(task = %id, source = source.as_str(), target, "download task created");
        self.enqueue(id.clone());
        Ok(id)
    }

    /// pause: queued -> paused (dropped from the queue); running -> signal.
    pub async fn pause(&self, id: &str) -> Result<()> {
        let task = self.inner.db.get_task(id).await?.ok_or(NotFound)?;
        match task.status {
            TaskStatus::Queued => {
                self.remove_from_queue(id);
                self.inner
                    .db
                    .set_task_outcome(id, TaskStatus::Paused, None)
                    .await?;
                Ok(())
            }
            TaskStatus::Running => {
                self.inner.stops.signal(id, StopMode::Pause);
                Ok(())
            }
            other => Err(Conflict(format!("cannot pause a {} task", other.as_str())).into()),
        }
    }

    /// resume: paused or failed -> queued.
    pub async fn resume(&self, id: &str) -> Result<()> {
        let task = self.inner.db.get_task(id).await?.ok_or(NotFound)?;
        match task.status {
            TaskStatus::Paused | TaskStatus::Failed => {
                self.inner
                    .db
                    .set_task_outcome(id, TaskStatus::Queued, None)
                    .await?;
                self.enqueue(id.to_string());
                Ok(())
            }
            other => Err(Conflict(format!("cannot resume a {} task", other.as_str())).into()),
        }
    }

    /// cancel: queued/paused/failed -> canceled with staging removed;
    /// running -> signal (the worker tears staging down on its way out).
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let task = self.inner.db.get_task(id).await?.ok_or(NotFound)?;
        match task.status {
            TaskStatus::Queued | TaskStatus::Paused | TaskStatus::Failed => {
                self.remove_from_queue(id);
                let staging = commit::staging_dir(&self.inner.storage, id);
                let _ = tokio::fs::remove_dir_all(&staging).await;
                self.inner
                    .db
                    .set_task_outcome(id, TaskStatus::Canceled, None)
                    .await?;
                Ok(())
            }
            TaskStatus::Running => {
                self.inner.stops.signal(id, StopMode::Cancel);
                Ok(())
            }
            other => Err(Conflict(format!("cannot cancel a {} task", other.as_str())).into()),
        }
    }

    /// retry: failed/canceled/paused -> queued with the message cleared.
    pub async fn retry(&self, id: &str) -> Result<()> {
        let task = self.inner.db.get_task(id).await?.ok_or(NotFound)?;
        match task.status {
            TaskStatus::Failed | TaskStatus::Canceled | TaskStatus::Paused => {
                self.inner
                    .db
                    .set_task_outcome(id, TaskStatus::Queued, None)
                    .await?;
                self.enqueue(id.to_string());
                Ok(())
            }
            other => Err(Conflict(format!("cannot retry a {} task", other.as_str())).into()),
        }
    }

    /// delete: any non-running task; removes the row and its staging.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let task = self.inner.db.get_task(id).await?.ok_or(NotFound)?;
        if task.status == TaskStatus::Running {
            return Err(Conflict("task is running".into()).into());
        }
        self.remove_from_queue(id);
        let staging = commit::staging_dir(&self.inner.storage, id);
        let _ = tokio::fs::remove_dir_all(&staging).await;
        self.inner.db.delete_task(id).await?;
        Ok(())
    }

    fn enqueue(&self, id: String) {
        {
            let mut queue = self.inner.queue.lock().unwrap();
            if !queue.contains(&id) {
                queue.push_back(id);
            }
        }
        self.pump();
    }

    fn remove_from_queue(&self, id: &str) {
        self.inner.queue.lock().unwrap().retain(|queued| queued != id);
    }

    /// Fill worker slots while the queue is non-empty and the ceiling
    /// allows. Re-entered from every worker's completion path.
    fn pump(&self) {
        loop {
            let max = self.inner.policy.read().unwrap().max_concurrent;
            let id = {
                let mut running = self.inner.running.lock().unwrap();
                if running.len() >= max {
                    return;
                }
                let Some(id) = self.inner.queue.lock().unwrap().pop_front() else {
                    return;
                };
                running.insert(id.clone());
                id
            };
            let scheduler = self.clone();
            tokio::spawn(async move {
                scheduler.run_task(&id).await;
                scheduler.inner.running.lock().unwrap().remove(&id);
                scheduler.inner.stops.unregister(&id);
                scheduler.pump();
            });
        }
    }

    /// One worker's life with one task: translate the adapter outcome into
    /// the terminal task state.
    async fn run_task(&self, id: &str) {
        if let Err(e) = self.run_task_inner(id).await {
            tracing::error!(task = id, "task runner failed: {e:#}");
            let _ = self
                .inner
                .db
                .set_task_outcome(id, TaskStatus::Failed, Some(&format!("internal error: {e}")))
                .await;
        }
    }

    async fn run_task_inner(&self, id: &str) -> Result<()> {
        let db = &self.inner.db;
        // Deleted or stopped while queued: nothing to do.
        let Some(task) = db.get_task(id).await? else {
            return Ok(());
        };
        if task.status != TaskStatus::Queued {
            return Ok(());
        }

        let canonical = match canonical_id(task.source, &task.target) {
            Ok(canonical) => canonical,
            Err(e) => {
                db.set_task_outcome(id, TaskStatus::Failed, Some(&e.to_string()))
                    .await?;
                return Ok(());
            }
        };
        // A competing commit may have landed while this task sat queued.
        if db.comic_exists(&canonical).await? {
            db.mark_task_succeeded(id, &canonical, Some("already downloaded"))
                .await?;
            return Ok(());
        }

        db.set_task_status(id, TaskStatus::Running).await?;
        let stop = self.inner.stops.register(id);
        let work_dir = commit::staging_dir(&self.inner.storage, id);
        tokio::fs::create_dir_all(&work_dir)
            .await
            .with_context(|| format!("create staging {}", work_dir.display()))?;

        let fetcher = Fetcher::new()?;
        let progress = ProgressReporter::new(db.clone(), id);
        let auth = db
            .get_auth(task.source)
            .await?
            .map(|(payload, _)| payload)
            .unwrap_or(serde_json::Value::Null);
        let files = self.inner.policy.read().unwrap().file_job_policy(task.source);
        let eps = task.params.eps_ordered();
        let ctx = AdapterContext {
            work_dir: &work_dir,
            auth: &auth,
            target: &task.target,
            eps: &eps,
            progress: &progress,
            stop: &stop,
            fetcher: &fetcher,
            files,
        };
        let outcome = adapter_for(task.source).run(&ctx).await;
        let _ = progress.flush().await;

        match outcome {
            Ok(comic) => {
                commit::commit(db, &self.inner.storage, &work_dir, &comic).await?;
                db.mark_task_succeeded(id, &comic.id, None).await?;
                tracing::info!(task = id, comic = %comic.id, "task succeeded");
            }
            Err(e) => match e.downcast_ref::<Stopped>() {
                Some(stopped) if stopped.mode == StopMode::Pause => {
                    // Staging stays; its files are the resume state.
                    db.set_task_outcome(id, TaskStatus::Paused, None).await?;
                    tracing::info!(task = id, "task paused");
                }
                Some(_) => {
                    let _ = tokio::fs::remove_dir_all(&work_dir).await;
                    db.set_task_outcome(id, TaskStatus::Canceled, None).await?;
                    tracing::info!(task = id, "task canceled");
                }
                None => {
                    // Staging stays so a retry resumes where this run left off.
                    let message = self.failure_message(&e);
                    db.set_task_outcome(id, TaskStatus::Failed, Some(&message))
                        .await?;
                    tracing::warn!(task = id, "task failed: {e:#}");
                }
            },
        }
        Ok(())
    }

    fn failure_message(&self, e: &anyhow::Error) -> String {
        if self.inner.debug {
            let full = format!("download failed: {e:#}");
            full.chars().take(1000).collect()
        } else {
            format!("download failed: {e}")
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("queued", &self.inner.queue.lock().unwrap().len())
            .field("running", &self.inner.running.lock().unwrap().len())
            .finish()
    }
}
