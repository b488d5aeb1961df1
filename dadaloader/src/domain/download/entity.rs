//! Download task entity.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::DownloadStatus;
use crate::database::models::DownloadDbModel;
use crate::downloader::engine::ProgressSample;
use crate::utils::format::format_size_mb;

/// Cooperative request sent from the command surface to the engine run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlSignal {
    #[default]
    Run,
    Pause,
    Stop,
}

/// Mutable fields of a task.
///
/// `status`, `file_size`, `downloaded`, `progress` and `is_paused` are
/// persisted; the rest only lives for the current process.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskState {
    pub status: DownloadStatus,
    pub file_size: u64,
    pub downloaded: u64,
    pub progress: f64,
    pub is_paused: bool,
    pub speed_mbps: f64,
    pub eta_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// The last durable write failed; the next one rewrites every field.
    pub dirty: bool,
    /// Set by a restart; the next sample may lower the byte count.
    restarted: bool,
}

impl TaskState {
    pub fn from_record(record: &DownloadDbModel) -> Self {
        Self {
            status: record.status(),
            file_size: record.file_size.max(0) as u64,
            downloaded: record.downloaded.max(0) as u64,
            progress: record.progress.clamp(0.0, 100.0),
            is_paused: record.is_paused,
            speed_mbps: 0.0,
            eta_secs: 0,
            started_at: None,
            last_error: None,
            dirty: false,
            restarted: false,
        }
    }

    /// Move to `target` if the transition table allows it.
    fn enter(&mut self, target: DownloadStatus) -> bool {
        match self.status.transition_to(target) {
            Ok(status) => {
                self.status = status;
                true
            }
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    /// (Re)start from Pending, Stopped, Error or Completed.
    pub fn mark_started(&mut self) -> bool {
        if !self.enter(DownloadStatus::Downloading) {
            return false;
        }
        self.is_paused = false;
        self.started_at = Some(Utc::now());
        self.last_error = None;
        self.clear_rates();
        self.restarted = true;
        true
    }

    /// Continue a paused download. The byte count carries over.
    pub fn mark_resumed(&mut self) -> bool {
        if self.status != DownloadStatus::Paused || !self.enter(DownloadStatus::Downloading) {
            return false;
        }
        self.is_paused = false;
        true
    }

    /// Apply one progress sample.
    ///
    /// The parsed byte count is the source of truth and the percentage is
    /// derived from it. While downloading the byte count never moves
    /// backwards; only the first sample after a restart may lower it.
    /// Returns `false` when the task is not downloading.
    pub fn apply_sample(&mut self, sample: &ProgressSample) -> bool {
        if self.status != DownloadStatus::Downloading {
            return false;
        }

        if sample.total_bytes > 0 {
            self.file_size = sample.total_bytes;
        }

        if self.restarted {
            self.downloaded = sample.downloaded_bytes;
            self.restarted = false;
        } else {
            self.downloaded = self.downloaded.max(sample.downloaded_bytes);
        }

        if self.file_size > 0 {
            self.downloaded = self.downloaded.min(self.file_size);
            self.progress = (self.downloaded as f64 / self.file_size as f64 * 100.0).min(100.0);
        }

        self.speed_mbps = sample.speed_mbps();
        self.eta_secs = sample.eta_secs;
        true
    }

    pub fn mark_paused(&mut self) -> bool {
        if !self.enter(DownloadStatus::Paused) {
            return false;
        }
        self.is_paused = true;
        self.clear_rates();
        true
    }

    /// Successful exit: progress is 100 whatever the last sample said.
    pub fn mark_completed(&mut self) -> bool {
        if !self.enter(DownloadStatus::Completed) {
            return false;
        }
        self.progress = 100.0;
        if self.file_size > 0 {
            self.downloaded = self.file_size;
        }
        self.is_paused = false;
        self.clear_rates();
        true
    }

    pub fn mark_stopped(&mut self) -> bool {
        if !self.enter(DownloadStatus::Stopped) {
            return false;
        }
        self.is_paused = false;
        self.clear_rates();
        true
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) -> bool {
        if !self.enter(DownloadStatus::Error) {
            return false;
        }
        self.is_paused = false;
        self.last_error = Some(message.into());
        self.clear_rates();
        true
    }

    fn clear_rates(&mut self) {
        self.speed_mbps = 0.0;
        self.eta_secs = 0;
    }
}

/// Immutable copy of a task for readers.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    pub id: i64,
    pub url: String,
    pub save_path: PathBuf,
    pub status: DownloadStatus,
    pub file_size: u64,
    pub downloaded: u64,
    pub progress: f64,
    pub is_paused: bool,
    pub speed_mbps: f64,
    pub eta_secs: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// `false` while the store lags behind the values shown here.
    pub persisted: bool,
}

impl TaskSnapshot {
    /// File name component of the save path.
    pub fn file_name(&self) -> String {
        self.save_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Total size in MB, or `Unknown` while the engine has not reported it.
    pub fn size_display(&self) -> String {
        if self.file_size == 0 {
            "Unknown".to_string()
        } else {
            format_size_mb(self.file_size)
        }
    }
}

/// Join handles of the engine run currently owning a task.
pub struct RunHandle {
    pub supervisor: JoinHandle<()>,
    pub events: JoinHandle<()>,
}

impl RunHandle {
    /// A run is live until its event handler has applied the final event.
    pub fn is_live(&self) -> bool {
        !self.events.is_finished()
    }

    pub fn abort(&self) {
        self.supervisor.abort();
        self.events.abort();
    }
}

/// One download task and its runtime state.
pub struct DownloadTask {
    id: i64,
    url: String,
    save_path: PathBuf,
    state: RwLock<TaskState>,
    control: watch::Sender<ControlSignal>,
    /// Serializes durable writes for this task.
    write_lock: tokio::sync::Mutex<()>,
    run: Mutex<Option<RunHandle>>,
}

impl DownloadTask {
    /// Build a task from its persisted record.
    pub fn from_record(record: &DownloadDbModel) -> Self {
        let (control, _) = watch::channel(ControlSignal::Run);
        Self {
            id: record.id,
            url: record.url.clone(),
            save_path: PathBuf::from(&record.save_path),
            state: RwLock::new(TaskState::from_record(record)),
            control,
            write_lock: tokio::sync::Mutex::new(()),
            run: Mutex::new(None),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.read().status
    }

    /// Copy of the current state.
    pub fn state(&self) -> TaskState {
        self.state.read().clone()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.read();
        TaskSnapshot {
            id: self.id,
            url: self.url.clone(),
            save_path: self.save_path.clone(),
            status: state.status,
            file_size: state.file_size,
            downloaded: state.downloaded,
            progress: state.progress,
            is_paused: state.is_paused,
            speed_mbps: state.speed_mbps,
            eta_secs: state.eta_secs,
            started_at: state.started_at,
            last_error: state.last_error.clone(),
            persisted: !state.dirty,
        }
    }

    /// Replace the visible state. Callers hold the write lock.
    pub(crate) fn publish(&self, state: TaskState) {
        *self.state.write() = state;
    }

    pub(crate) fn write_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.write_lock
    }

    pub fn control_signal(&self) -> ControlSignal {
        *self.control.borrow()
    }

    pub fn subscribe_control(&self) -> watch::Receiver<ControlSignal> {
        self.control.subscribe()
    }

    /// Clear pending pause/stop requests before a new run.
    pub fn reset_control(&self) {
        self.control.send_replace(ControlSignal::Run);
    }

    /// Ask the run to pause. A pending stop takes precedence.
    pub fn request_pause(&self) -> bool {
        self.control.send_if_modified(|signal| {
            if *signal == ControlSignal::Run {
                *signal = ControlSignal::Pause;
                true
            } else {
                false
            }
        })
    }

    /// Withdraw a pause request.
    pub fn request_resume(&self) -> bool {
        self.control.send_if_modified(|signal| {
            if *signal == ControlSignal::Pause {
                *signal = ControlSignal::Run;
                true
            } else {
                false
            }
        })
    }

    /// Ask the run to stop. Idempotent.
    pub fn request_stop(&self) -> bool {
        self.control.send_if_modified(|signal| {
            if *signal == ControlSignal::Stop {
                false
            } else {
                *signal = ControlSignal::Stop;
                true
            }
        })
    }

    pub(crate) fn set_run(&self, handle: RunHandle) {
        *self.run.lock() = Some(handle);
    }

    pub(crate) fn take_run(&self) -> Option<RunHandle> {
        self.run.lock().take()
    }

    pub fn has_live_run(&self) -> bool {
        self.run.lock().as_ref().is_some_and(RunHandle::is_live)
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("save_path", &self.save_path)
            .field("state", &*self.state.read())
            .field("control", &self.control_signal())
            .finish()
    }
}
