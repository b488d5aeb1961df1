//! Engine supervision.
//!
//! One supervisor run owns the engine child process of one task. It moves
//! through an explicit set of phases:
//!
//! ```text
//! Launching -> Streaming -> PausedWait -> Launching ...
//!                  |             |
//!                  +-> Finalizing <-+
//! ```
//!
//! Pause and stop requests arrive over a `watch` channel. Everything the run
//! observes is reported as [`SupervisorEvent`]s; `Finished` is always the
//! last event of a run.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use process_utils::terminate;
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use crate::domain::ControlSignal;
use crate::downloader::engine::utils::OutputRecordReader;
use crate::downloader::engine::{
    DownloadEngine, EngineNotice, EngineRequest, ParsedLine, ProgressSample,
};
use crate::{Error, Result};

/// Capacity of the per-run event channel.
pub const EVENT_BUFFER: usize = 64;

/// Terminal result of one supervisor run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// Events reported by a supervisor run.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// The run began.
    Started,
    /// An engine child was spawned.
    Launched,
    Progress(ProgressSample),
    /// The child was terminated on a pause request.
    Paused,
    /// The pause request was withdrawn; the engine is relaunched next.
    Resumed,
    Finished(RunOutcome),
}

/// Supervisor timing configuration.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Upper bound between control checks while paused.
    pub pause_poll_interval: Duration,
    /// How long to wait for a killed child to be reaped.
    pub kill_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pause_poll_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(5),
        }
    }
}

/// A spawned engine child and its output streams.
struct RunningEngine {
    child: Child,
    stdout: OutputRecordReader<ChildStdout>,
    stderr_task: Option<JoinHandle<Option<String>>>,
    /// Last error notice seen on stdout.
    last_error: Option<String>,
}

enum Phase {
    Launching,
    Streaming(RunningEngine),
    PausedWait,
    Finalizing(RunOutcome),
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Pause,
    Stop,
}

impl Interrupt {
    fn from_signal(signal: ControlSignal) -> Option<Self> {
        match signal {
            ControlSignal::Run => None,
            ControlSignal::Pause => Some(Self::Pause),
            ControlSignal::Stop => Some(Self::Stop),
        }
    }
}

/// Read the control value after a `changed()` wakeup. A dropped sender
/// means the task is gone and counts as a stop.
fn observe(
    control: &mut watch::Receiver<ControlSignal>,
    changed: std::result::Result<(), watch::error::RecvError>,
) -> ControlSignal {
    match changed {
        Ok(()) => *control.borrow_and_update(),
        Err(_) => ControlSignal::Stop,
    }
}

/// Drives engine children for tasks.
pub struct EngineSupervisor {
    engine: Arc<dyn DownloadEngine>,
    config: SupervisorConfig,
}

impl EngineSupervisor {
    pub fn new(engine: Arc<dyn DownloadEngine>, config: SupervisorConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine(&self) -> &Arc<dyn DownloadEngine> {
        &self.engine
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Supervise one task until it completes, fails or is stopped.
    ///
    /// Never returns an error: launch and I/O failures become
    /// [`RunOutcome::Failed`]. The child is reaped on every exit path.
    pub async fn run(
        &self,
        request: EngineRequest,
        mut control: watch::Receiver<ControlSignal>,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> RunOutcome {
        let task_id = request.task_id;
        emit(&events, SupervisorEvent::Started).await;

        let mut phase = Phase::Launching;
        loop {
            phase = match phase {
                Phase::Launching => self.launch_phase(&request, &mut control, &events).await,
                Phase::Streaming(running) => self.stream(task_id, running, &mut control, &events).await,
                Phase::PausedWait => self.wait_paused(task_id, &mut control, &events).await,
                Phase::Finalizing(outcome) => {
                    info!(task_id, outcome = ?outcome, "Supervisor run finished");
                    emit(&events, SupervisorEvent::Finished(outcome.clone())).await;
                    return outcome;
                }
            };
        }
    }

    async fn launch_phase(
        &self,
        request: &EngineRequest,
        control: &mut watch::Receiver<ControlSignal>,
        events: &mpsc::Sender<SupervisorEvent>,
    ) -> Phase {
        let signal = *control.borrow_and_update();
        match Interrupt::from_signal(signal) {
            Some(Interrupt::Stop) => return Phase::Finalizing(RunOutcome::Stopped),
            Some(Interrupt::Pause) => {
                emit(events, SupervisorEvent::Paused).await;
                return Phase::PausedWait;
            }
            None => {}
        }

        match self.launch(request) {
            Ok(running) => {
                info!(
                    task_id = request.task_id,
                    engine = self.engine.name(),
                    "Engine launched for {}",
                    request.url
                );
                emit(events, SupervisorEvent::Launched).await;
                Phase::Streaming(running)
            }
            Err(e) => {
                error!(task_id = request.task_id, "Engine launch failed: {}", e);
                Phase::Finalizing(RunOutcome::Failed(e.to_string()))
            }
        }
    }

    fn launch(&self, request: &EngineRequest) -> Result<RunningEngine> {
        let mut cmd = self.engine.build_command(request)?;
        let mut child = cmd.spawn().map_err(|e| {
            Error::EngineLaunch(format!("failed to spawn {}: {}", self.engine.name(), e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::EngineLaunch("engine stdout was not captured".to_string()))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(request.task_id, stderr)));

        Ok(RunningEngine {
            child,
            stdout: OutputRecordReader::new(stdout),
            stderr_task,
            last_error: None,
        })
    }

    async fn stream(
        &self,
        task_id: i64,
        mut running: RunningEngine,
        control: &mut watch::Receiver<ControlSignal>,
        events: &mpsc::Sender<SupervisorEvent>,
    ) -> Phase {
        loop {
            tokio::select! {
                biased;

                changed = control.changed() => {
                    if let Some(interrupt) = Interrupt::from_signal(observe(control, changed)) {
                        return self.interrupt(task_id, running, interrupt, events).await;
                    }
                }

                record = running.stdout.next_record() => match record {
                    Ok(Some(line)) => self.handle_record(task_id, &mut running, &line, events).await,
                    Ok(None) => return self.wait_exit(task_id, running, control, events).await,
                    Err(e) => {
                        warn!(task_id, "Failed to read engine output: {}", e);
                        let err = Error::EngineIo(e.to_string());
                        running.last_error.get_or_insert_with(|| err.to_string());
                        return self.wait_exit(task_id, running, control, events).await;
                    }
                },
            }
        }
    }

    async fn handle_record(
        &self,
        task_id: i64,
        running: &mut RunningEngine,
        line: &str,
        events: &mpsc::Sender<SupervisorEvent>,
    ) {
        match self.engine.parse_line(line) {
            ParsedLine::Progress(sample) => {
                trace!(task_id, "{}", line);
                emit(events, SupervisorEvent::Progress(sample)).await;
            }
            ParsedLine::Notice(EngineNotice::Error(message)) => {
                warn!(task_id, "Engine reported: {}", message);
                running.last_error = Some(message);
            }
            ParsedLine::Notice(EngineNotice::Completed(path)) => {
                debug!(task_id, "Engine finished writing {}", path);
            }
            ParsedLine::None => trace!(task_id, "Engine output: {}", line),
        }
    }

    /// Output ended; wait for the exit status while still honoring requests.
    async fn wait_exit(
        &self,
        task_id: i64,
        mut running: RunningEngine,
        control: &mut watch::Receiver<ControlSignal>,
        events: &mpsc::Sender<SupervisorEvent>,
    ) -> Phase {
        let status = loop {
            tokio::select! {
                biased;

                changed = control.changed() => {
                    if let Some(interrupt) = Interrupt::from_signal(observe(control, changed)) {
                        return self.interrupt(task_id, running, interrupt, events).await;
                    }
                }

                status = running.child.wait() => break status,
            }
        };

        let stderr_tail = collect_stderr(running.stderr_task.take()).await;

        // A request that raced with the exit still wins.
        let signal = *control.borrow();
        if let Some(interrupt) = Interrupt::from_signal(signal) {
            return self.interrupt(task_id, running, interrupt, events).await;
        }

        match status {
            Ok(status) if status.success() => Phase::Finalizing(RunOutcome::Completed),
            Ok(status) => {
                let detail = running.last_error.take().or(stderr_tail);
                let message = self.failure_message(status, detail);
                warn!(task_id, "{}", message);
                Phase::Finalizing(RunOutcome::Failed(message))
            }
            Err(e) => {
                let err = Error::EngineIo(format!(
                    "failed to wait for {}: {}",
                    self.engine.name(),
                    e
                ));
                error!(task_id, "{}", err);
                Phase::Finalizing(RunOutcome::Failed(err.to_string()))
            }
        }
    }

    async fn interrupt(
        &self,
        task_id: i64,
        mut running: RunningEngine,
        interrupt: Interrupt,
        events: &mpsc::Sender<SupervisorEvent>,
    ) -> Phase {
        self.kill(task_id, &mut running).await;
        match interrupt {
            Interrupt::Stop => Phase::Finalizing(RunOutcome::Stopped),
            Interrupt::Pause => {
                info!(task_id, "Engine paused");
                emit(events, SupervisorEvent::Paused).await;
                Phase::PausedWait
            }
        }
    }

    async fn kill(&self, task_id: i64, running: &mut RunningEngine) {
        match terminate(&mut running.child, self.config.kill_grace).await {
            Ok(Some(status)) => debug!(task_id, "Engine exited with {}", status),
            Ok(None) => warn!(
                task_id,
                "Engine did not exit within {:?} after kill", self.config.kill_grace
            ),
            Err(e) => warn!(task_id, "Failed to terminate engine: {}", e),
        }
        if let Some(task) = running.stderr_task.take() {
            task.abort();
        }
    }

    async fn wait_paused(
        &self,
        task_id: i64,
        control: &mut watch::Receiver<ControlSignal>,
        events: &mpsc::Sender<SupervisorEvent>,
    ) -> Phase {
        loop {
            let signal = *control.borrow_and_update();
            match signal {
                ControlSignal::Stop => return Phase::Finalizing(RunOutcome::Stopped),
                ControlSignal::Run => {
                    info!(task_id, "Resuming engine");
                    emit(events, SupervisorEvent::Resumed).await;
                    return Phase::Launching;
                }
                ControlSignal::Pause => {}
            }

            match timeout(self.config.pause_poll_interval, control.changed()).await {
                Ok(Ok(())) | Err(_) => {}
                Ok(Err(_)) => return Phase::Finalizing(RunOutcome::Stopped),
            }
        }
    }

    fn failure_message(&self, status: ExitStatus, detail: Option<String>) -> String {
        let mut message = match status.code() {
            Some(code) => format!(
                "{} failed with {}",
                self.engine.name(),
                self.engine.describe_exit(code)
            ),
            None => format!("{} was terminated by a signal", self.engine.name()),
        };
        if let Some(detail) = detail {
            message.push_str(": ");
            message.push_str(&detail);
        }
        message
    }
}

async fn emit(events: &mpsc::Sender<SupervisorEvent>, event: SupervisorEvent) {
    if events.send(event).await.is_err() {
        debug!("Supervisor event receiver dropped");
    }
}

/// Log stderr and keep its last non-empty record.
async fn drain_stderr(task_id: i64, stderr: ChildStderr) -> Option<String> {
    let mut reader = OutputRecordReader::new(stderr);
    let mut last = None;
    loop {
        match reader.next_record().await {
            Ok(Some(line)) => {
                debug!(task_id, "Engine stderr: {}", line);
                last = Some(line);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(task_id, "Failed to read engine stderr: {}", e);
                break;
            }
        }
    }
    last
}

async fn collect_stderr(task: Option<JoinHandle<Option<String>>>) -> Option<String> {
    let mut task = task?;
    match timeout(Duration::from_secs(1), &mut task).await {
        Ok(joined) => joined.ok().flatten(),
        Err(_) => {
            task.abort();
            None
        }
    }
}
