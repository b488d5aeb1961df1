//! dadaloader library crate.
//!
//! Orchestrates download tasks executed by an external multi-connection
//! transfer engine (`aria2c`): the per-task state machine, the engine
//! supervision loop, the progress line parser and the SQLite persistence
//! that makes tasks resumable across restarts.

pub mod config;
pub mod database;
pub mod domain;
pub mod downloader;
pub mod error;
pub mod logging;
pub mod utils;

pub use error::{Error, Result};
