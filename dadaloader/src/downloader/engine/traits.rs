//! Download engine trait and related types.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::Result;

/// Input of one engine launch.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub task_id: i64,
    pub url: String,
    pub save_path: PathBuf,
}

impl EngineRequest {
    pub fn new(task_id: i64, url: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            task_id,
            url: url.into(),
            save_path: save_path.into(),
        }
    }

    /// Directory the engine writes into.
    pub fn output_dir(&self) -> &Path {
        self.save_path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// File name the engine writes.
    pub fn output_name(&self) -> String {
        self.save_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// One progress summary reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProgressSample {
    pub downloaded_bytes: u64,
    /// 0 while the engine does not know the size yet.
    pub total_bytes: u64,
    pub speed_bytes_per_sec: u64,
    /// 0 when unknown.
    pub eta_secs: u64,
}

impl ProgressSample {
    /// Completion percentage, 0.0 while the total is unknown.
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
    }

    /// Speed in megabits per second (`bytes * 8 / 2^20`).
    pub fn speed_mbps(&self) -> f64 {
        self.speed_bytes_per_sec as f64 * 8.0 / (1u64 << 20) as f64
    }
}

/// Non-progress engine output worth remembering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineNotice {
    /// The engine reported the file as finished.
    Completed(String),
    /// The engine reported an error.
    Error(String),
}

/// Result of parsing one output record.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    Progress(ProgressSample),
    Notice(EngineNotice),
    None,
}

/// An external transfer program driven as a child process.
pub trait DownloadEngine: Send + Sync {
    /// Engine name for logs.
    fn name(&self) -> &str;

    /// Build the command for one launch. stdout must be piped.
    fn build_command(&self, request: &EngineRequest) -> Result<Command>;

    /// Parse one stdout record.
    fn parse_line(&self, line: &str) -> ParsedLine;

    /// Human readable meaning of a non-zero exit code.
    fn describe_exit(&self, code: i32) -> String {
        format!("exit code {code}")
    }

    /// Check if the engine binary is available.
    fn is_available(&self) -> bool;

    /// Get engine version string.
    fn version(&self) -> Option<String>;
}
