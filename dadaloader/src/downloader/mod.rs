//! Download orchestration.
//!
//! - `engine`: the engine abstraction, the aria2 backend and output parsing
//! - `supervisor`: drives one engine child per task run
//! - `manager`: the task registry and command surface

pub mod engine;

mod manager;
mod supervisor;

pub use engine::{DownloadEngine, EngineRequest, ParsedLine, ProgressSample};
pub use manager::{DownloadManager, DownloadManagerConfig, TaskEvent};
pub use supervisor::{
    EVENT_BUFFER, EngineSupervisor, RunOutcome, SupervisorConfig, SupervisorEvent,
};
