//! Download Manager implementation.
//!
//! The manager owns the task registry and is the only component that
//! mutates tasks. Every change to a persisted field is written to the
//! store first and published in memory afterwards, under the task's write
//! lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, error, info, warn};

use super::engine::{EngineRequest, ProgressSample};
use super::supervisor::{EVENT_BUFFER, EngineSupervisor, RunOutcome, SupervisorConfig, SupervisorEvent};
use crate::database::models::DownloadDbModel;
use crate::database::repositories::DownloadRepository;
use crate::domain::download::RunHandle;
use crate::domain::{DownloadStatus, DownloadTask, TaskSnapshot, TaskState};
use crate::utils::filename::{sanitize_filename, unique_path};
use crate::utils::fs::{remove_file_if_exists, validate_save_path};
use crate::utils::url::{file_name_from_url, validate_download_url};
use crate::{Error, Result};

/// Configuration for the Download Manager.
#[derive(Debug, Clone)]
pub struct DownloadManagerConfig {
    pub supervisor: SupervisorConfig,
    /// How long delete and shutdown wait for a run before aborting it.
    pub run_join_timeout: Duration,
    /// Capacity of the task event broadcast channel.
    pub event_capacity: usize,
}

impl Default for DownloadManagerConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            run_join_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

/// Events emitted by the Download Manager.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// A task changed; carries the new snapshot.
    Updated(TaskSnapshot),
    /// A task was deleted.
    Removed { id: i64 },
    /// A run failed or a write to the store did not go through.
    Failed { id: i64, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitMode {
    /// On a failed write memory keeps the last persisted values.
    Normal,
    /// Publish even when the write fails and mark the state dirty. Used
    /// for outcomes that have already happened, like a reaped child.
    Always,
}

fn persisted_fields_equal(a: &TaskState, b: &TaskState) -> bool {
    a.status == b.status
        && a.file_size == b.file_size
        && a.downloaded == b.downloaded
        && a.progress == b.progress
        && a.is_paused == b.is_paused
}

/// Everything needed to mutate one task.
#[derive(Clone)]
struct TaskContext {
    task: Arc<DownloadTask>,
    repo: Arc<dyn DownloadRepository>,
    event_tx: broadcast::Sender<TaskEvent>,
}

impl TaskContext {
    fn id(&self) -> i64 {
        self.task.id()
    }

    fn emit(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    async fn commit<F>(&self, mode: CommitMode, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut TaskState) -> bool,
    {
        let _guard = self.task.write_lock().lock().await;
        self.commit_locked(mode, mutate).await
    }

    /// Apply `mutate` to a copy of the state, persist it and publish it.
    ///
    /// The caller holds the task's write lock. Returns `Ok(false)` when
    /// `mutate` declines the change.
    async fn commit_locked<F>(&self, mode: CommitMode, mutate: F) -> Result<bool>
    where
        F: FnOnce(&mut TaskState) -> bool,
    {
        let current = self.task.state();
        let mut next = current.clone();
        if !mutate(&mut next) {
            return Ok(false);
        }

        if current.dirty || !persisted_fields_equal(&current, &next) {
            if let Err(e) = self.persist(&current, &next).await {
                let err = Error::Persistence(format!(
                    "failed to persist download {}: {}",
                    self.id(),
                    e
                ));
                error!(task_id = self.id(), "{}", err);
                if mode == CommitMode::Always {
                    next.dirty = true;
                    self.task.publish(next);
                    self.emit(TaskEvent::Updated(self.task.snapshot()));
                }
                self.emit(TaskEvent::Failed {
                    id: self.id(),
                    message: err.to_string(),
                });
                return Err(err);
            }
        }

        next.dirty = false;
        self.task.publish(next);
        self.emit(TaskEvent::Updated(self.task.snapshot()));
        Ok(true)
    }

    async fn persist(&self, current: &TaskState, next: &TaskState) -> Result<()> {
        let id = self.id();
        if current.dirty || current.file_size != next.file_size {
            self.repo.update_file_size(id, next.file_size).await?;
        }
        self.repo
            .update(id, next.status, next.progress, next.downloaded, next.is_paused)
            .await
    }

    async fn on_progress(&self, sample: &ProgressSample) -> Result<bool> {
        self.commit(CommitMode::Normal, |s| s.apply_sample(sample))
            .await
    }

    /// Apply the events of one supervisor run until `Finished`.
    async fn drive(self, mut events: mpsc::Receiver<SupervisorEvent>) {
        let id = self.id();
        let mut stop_reason: Option<String> = None;

        while let Some(event) = events.recv().await {
            match event {
                SupervisorEvent::Started => debug!(task_id = id, "Run started"),
                SupervisorEvent::Launched => debug!(task_id = id, "Engine launched"),
                SupervisorEvent::Progress(sample) => {
                    if stop_reason.is_some() {
                        continue;
                    }
                    if let Err(e) = self.on_progress(&sample).await {
                        warn!(task_id = id, "Stopping download after failed write");
                        stop_reason = Some(e.to_string());
                        self.task.request_stop();
                    }
                }
                SupervisorEvent::Paused => {
                    let _ = self.commit(CommitMode::Always, TaskState::mark_paused).await;
                    info!(task_id = id, "Download paused");
                }
                SupervisorEvent::Resumed => debug!(task_id = id, "Run resumed"),
                SupervisorEvent::Finished(outcome) => {
                    self.finish(outcome, stop_reason.take()).await;
                }
            }
        }
    }

    async fn finish(&self, outcome: RunOutcome, stop_reason: Option<String>) {
        let id = self.id();
        let result = match outcome {
            RunOutcome::Completed => {
                info!(task_id = id, "Download completed");
                self.commit(CommitMode::Always, TaskState::mark_completed)
                    .await
            }
            RunOutcome::Stopped => {
                info!(task_id = id, "Download stopped");
                self.commit(CommitMode::Always, |s| {
                    if !s.mark_stopped() {
                        return false;
                    }
                    s.last_error = stop_reason;
                    true
                })
                .await
            }
            RunOutcome::Failed(message) => {
                warn!(task_id = id, "Download failed: {}", message);
                self.emit(TaskEvent::Failed {
                    id,
                    message: message.clone(),
                });
                self.commit(CommitMode::Always, |s| s.mark_failed(message))
                    .await
            }
        };

        if let Err(e) = result {
            error!(task_id = id, "Final state not persisted: {}", e);
        }
    }
}

/// Wait for a run to wind down, aborting it after `limit`.
async fn join_run(task_id: i64, run: RunHandle, limit: Duration) {
    let RunHandle {
        supervisor,
        mut events,
    } = run;

    if timeout(limit, &mut events).await.is_err() {
        warn!(task_id, "Run did not finish within {:?}, aborting", limit);
        events.abort();
    }
    // Dropping the supervisor future kills a child that is still running.
    supervisor.abort();
}

/// The Download Manager service.
pub struct DownloadManager {
    config: DownloadManagerConfig,
    /// Task registry keyed by store id.
    tasks: Arc<DashMap<i64, Arc<DownloadTask>>>,
    repo: Arc<dyn DownloadRepository>,
    supervisor: Arc<EngineSupervisor>,
    /// Broadcast sender for task events.
    event_tx: broadcast::Sender<TaskEvent>,
}

impl DownloadManager {
    pub fn new(
        repo: Arc<dyn DownloadRepository>,
        supervisor: Arc<EngineSupervisor>,
        config: DownloadManagerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            config,
            tasks: Arc::new(DashMap::new()),
            repo,
            supervisor,
            event_tx,
        }
    }

    pub fn config(&self) -> &DownloadManagerConfig {
        &self.config
    }

    /// Subscribe to task events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.event_tx.subscribe()
    }

    fn task(&self, id: i64) -> Result<Arc<DownloadTask>> {
        self.tasks
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::not_found("Download", id))
    }

    fn context(&self, task: &Arc<DownloadTask>) -> TaskContext {
        TaskContext {
            task: task.clone(),
            repo: self.repo.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    fn all_tasks(&self) -> Vec<Arc<DownloadTask>> {
        let mut tasks: Vec<_> = self.tasks.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by_key(|t| t.id());
        tasks
    }

    /// Rebuild the registry from the store.
    ///
    /// Tasks persisted as downloading belong to a process that is gone;
    /// they come back paused so `resume_task` relaunches them.
    pub async fn load_from_store(&self) -> Result<usize> {
        let records = self.repo.list_all().await?;
        let mut loaded = 0;

        for record in records {
            if self.tasks.contains_key(&record.id) {
                continue;
            }

            let task = Arc::new(DownloadTask::from_record(&record));
            if task.status() == DownloadStatus::Downloading {
                let ctx = self.context(&task);
                if let Err(e) = ctx
                    .commit(CommitMode::Always, TaskState::mark_paused)
                    .await
                {
                    warn!(task_id = record.id, "Could not mark interrupted download paused: {}", e);
                }
                info!(task_id = record.id, "Interrupted download restored as paused");
            }

            self.tasks.insert(record.id, task);
            loaded += 1;
        }

        info!("Loaded {} downloads from store", loaded);
        Ok(loaded)
    }

    /// Snapshots of every stored record, without registering or rewriting
    /// any of them.
    pub async fn inspect_store(&self) -> Result<Vec<TaskSnapshot>> {
        let records = self.repo.list_all().await?;
        debug!("Read {} downloads from store", records.len());
        Ok(records
            .iter()
            .map(|record| DownloadTask::from_record(record).snapshot())
            .collect())
    }

    /// Validate, persist and start a new download. Returns its id.
    pub async fn add_task(&self, url: &str, save_path: impl AsRef<Path>) -> Result<i64> {
        let save_path = save_path.as_ref();
        let url = validate_download_url(url)?;
        validate_save_path(save_path)?;
        let save_path_str = save_path.to_str().ok_or_else(|| {
            Error::invalid_input(format!("save path '{}' is not valid UTF-8", save_path.display()))
        })?;

        if self.tasks.iter().any(|e| e.value().save_path() == save_path) {
            return Err(Error::invalid_input(format!(
                "another download already writes to '{}'",
                save_path.display()
            )));
        }

        let mut record = DownloadDbModel::new(url.as_str(), save_path_str);
        record.id = self
            .repo
            .create(&record)
            .await
            .map_err(|e| Error::Persistence(format!("failed to create download: {}", e)))?;

        let task = Arc::new(DownloadTask::from_record(&record));
        self.tasks.insert(record.id, task.clone());
        let _ = self.event_tx.send(TaskEvent::Updated(task.snapshot()));
        info!(task_id = record.id, "Added download {} -> {}", url, save_path.display());

        self.start_task(record.id).await?;
        Ok(record.id)
    }

    /// Start (or restart) a task. Returns whether a run was started.
    pub async fn start_task(&self, id: i64) -> Result<bool> {
        let task = self.task(id)?;
        let ctx = self.context(&task);

        let _guard = task.write_lock().lock().await;
        if !task.status().can_start() {
            debug!(task_id = id, status = %task.status(), "Start ignored");
            return Ok(false);
        }

        // A previous run that reached a final state only has to drain.
        if let Some(previous) = task.take_run() {
            join_run(id, previous, self.config.run_join_timeout).await;
        }

        task.reset_control();
        ctx.commit_locked(CommitMode::Normal, TaskState::mark_started)
            .await?;

        self.spawn_run(&task);
        info!(task_id = id, "Download started");
        Ok(true)
    }

    /// Ask a downloading task to pause.
    pub async fn pause_task(&self, id: i64) -> Result<bool> {
        let task = self.task(id)?;
        if !task.status().can_pause() {
            debug!(task_id = id, status = %task.status(), "Pause ignored");
            return Ok(false);
        }

        if task.has_live_run() {
            return Ok(task.request_pause());
        }

        // Nothing to terminate.
        self.context(&task)
            .commit(CommitMode::Normal, TaskState::mark_paused)
            .await
    }

    /// Resume a paused task, relaunching the engine.
    pub async fn resume_task(&self, id: i64) -> Result<bool> {
        let task = self.task(id)?;
        let ctx = self.context(&task);

        let _guard = task.write_lock().lock().await;
        if !task.status().can_resume() {
            debug!(task_id = id, status = %task.status(), "Resume ignored");
            return Ok(false);
        }

        ctx.commit_locked(CommitMode::Normal, TaskState::mark_resumed)
            .await?;

        if task.has_live_run() {
            task.request_resume();
        } else {
            if let Some(previous) = task.take_run() {
                join_run(id, previous, self.config.run_join_timeout).await;
            }
            task.reset_control();
            self.spawn_run(&task);
        }

        info!(task_id = id, "Download resumed");
        Ok(true)
    }

    /// Stop a downloading or paused task. Idempotent.
    pub async fn stop_task(&self, id: i64) -> Result<bool> {
        let task = self.task(id)?;
        let ctx = self.context(&task);

        let _guard = task.write_lock().lock().await;
        if !task.status().can_stop() {
            debug!(task_id = id, status = %task.status(), "Stop ignored");
            return Ok(false);
        }

        if task.has_live_run() {
            return Ok(task.request_stop());
        }

        ctx.commit_locked(CommitMode::Normal, TaskState::mark_stopped)
            .await
    }

    /// Stop a task if needed, then remove its files and record.
    pub async fn delete_task(&self, id: i64) -> Result<()> {
        let (_, task) = self
            .tasks
            .remove(&id)
            .ok_or_else(|| Error::not_found("Download", id))?;

        task.request_stop();
        while let Some(run) = task.take_run() {
            join_run(id, run, self.config.run_join_timeout).await;
            task.request_stop();
        }

        let _guard = task.write_lock().lock().await;
        if let Err(e) = self.repo.delete(id).await {
            error!(task_id = id, "Failed to delete download record: {}", e);
            self.tasks.insert(id, task.clone());
            return Err(Error::Persistence(format!(
                "failed to delete download {}: {}",
                id, e
            )));
        }

        let control_file = aria2_control_file(task.save_path());
        for path in [task.save_path(), control_file.as_path()] {
            match remove_file_if_exists(path).await {
                Ok(true) => debug!(task_id = id, "Removed {}", path.display()),
                Ok(false) => {}
                Err(e) => warn!(task_id = id, "{}", e),
            }
        }

        let _ = self.event_tx.send(TaskEvent::Removed { id });
        info!(task_id = id, "Download deleted");
        Ok(())
    }

    /// Apply one progress sample to a task: store first, then memory.
    pub async fn on_progress(&self, id: i64, sample: ProgressSample) -> Result<bool> {
        let task = self.task(id)?;
        self.context(&task).on_progress(&sample).await
    }

    pub fn get_task(&self, id: i64) -> Result<TaskSnapshot> {
        self.task(id).map(|task| task.snapshot())
    }

    /// Snapshots of every task ordered by id.
    pub fn list_tasks(&self) -> Vec<TaskSnapshot> {
        self.all_tasks().iter().map(|t| t.snapshot()).collect()
    }

    /// Whether any task is downloading or still owned by a run.
    pub fn has_active_tasks(&self) -> bool {
        self.tasks.iter().any(|e| {
            let task = e.value();
            task.status() == DownloadStatus::Downloading || task.has_live_run()
        })
    }

    /// Resume every paused task. Returns how many were resumed.
    pub async fn resume_all(&self) -> Result<usize> {
        let mut resumed = 0;
        for task in self.all_tasks() {
            if task.status().can_resume() && self.resume_task(task.id()).await? {
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Pause every running download and wind down all runs.
    ///
    /// Tasks interrupted here are persisted as paused and resume on the
    /// next start.
    pub async fn shutdown(&self) {
        let tasks = self.all_tasks();
        for task in &tasks {
            if task.status() == DownloadStatus::Downloading {
                task.request_pause();
            }
        }

        let deadline = Instant::now() + self.config.run_join_timeout;
        for task in &tasks {
            while task.status() == DownloadStatus::Downloading
                && task.has_live_run()
                && Instant::now() < deadline
            {
                sleep(Duration::from_millis(50)).await;
            }
            if let Some(run) = task.take_run() {
                run.abort();
            }
        }
        info!("Download manager shut down");
    }

    /// Suggest a free save path in `dir` for `url`.
    ///
    /// The name comes from the last URL path segment, falling back to
    /// `download_<unix time>`; `_1`, `_2`, ... are appended until the path
    /// is neither on disk nor used by another task.
    pub fn suggest_save_path(&self, url: &str, dir: &Path) -> Result<PathBuf> {
        let url = validate_download_url(url)?;
        let name = file_name_from_url(&url)
            .and_then(|name| sanitize_filename(&name))
            .unwrap_or_else(|| format!("download_{}", Utc::now().timestamp()));

        Ok(unique_path(dir, &name, |path| {
            self.tasks.iter().any(|e| e.value().save_path() == path)
        }))
    }

    fn spawn_run(&self, task: &Arc<DownloadTask>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let request = EngineRequest::new(task.id(), task.url(), task.save_path());
        let control = task.subscribe_control();
        let supervisor = self.supervisor.clone();

        let supervisor_handle = tokio::spawn(async move {
            supervisor.run(request, control, tx).await;
        });
        let events_handle = tokio::spawn(self.context(task).drive(rx));

        task.set_run(RunHandle {
            supervisor: supervisor_handle,
            events: events_handle,
        });
    }
}

/// aria2 keeps resume state next to the output file.
fn aria2_control_file(save_path: &Path) -> PathBuf {
    let mut name = save_path.as_os_str().to_owned();
    name.push(".aria2");
    PathBuf::from(name)
}
