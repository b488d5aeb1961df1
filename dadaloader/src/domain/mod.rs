//! Domain layer for dadaloader.
//!
//! This module contains the download task entity and its state machine.

pub mod download;

pub use download::{ControlSignal, DownloadStatus, DownloadTask, TaskSnapshot, TaskState};
