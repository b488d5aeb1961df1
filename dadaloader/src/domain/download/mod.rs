//! Download task domain module.

mod entity;
mod state;

pub use entity::{ControlSignal, DownloadTask, RunHandle, TaskSnapshot, TaskState};
pub use state::DownloadStatus;
