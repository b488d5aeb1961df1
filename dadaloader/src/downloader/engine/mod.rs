//! Download engine abstraction.
//!
//! This module defines the `DownloadEngine` trait and the aria2 backend.

mod aria2;
mod traits;
pub mod utils;

pub use aria2::{Aria2Engine, Aria2EngineConfig, DEFAULT_CONNECTIONS};
pub use traits::{DownloadEngine, EngineNotice, EngineRequest, ParsedLine, ProgressSample};
