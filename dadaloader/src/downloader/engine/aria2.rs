//! aria2 download engine implementation.

use process_utils::{piped_command, quick_command};
use tokio::process::Command;
use tracing::debug;

use super::traits::{DownloadEngine, EngineRequest, ParsedLine};
use super::utils::parse_line;
use crate::Result;

/// Default number of connections per download (`-x` / `-s`).
pub const DEFAULT_CONNECTIONS: u32 = 16;

/// aria2 engine configuration.
#[derive(Debug, Clone)]
pub struct Aria2EngineConfig {
    /// Path or name of the `aria2c` binary.
    pub binary_path: String,
    /// Connections per server and split count.
    pub connections: u32,
    /// Appended before the URL.
    pub extra_args: Vec<String>,
}

impl Default for Aria2EngineConfig {
    fn default() -> Self {
        Self {
            binary_path: "aria2c".to_string(),
            connections: DEFAULT_CONNECTIONS,
            extra_args: Vec::new(),
        }
    }
}

/// aria2c-based download engine.
pub struct Aria2Engine {
    config: Aria2EngineConfig,
    /// Cached version string.
    version: Option<String>,
}

impl Aria2Engine {
    /// Create a new aria2 engine with default configuration.
    pub fn new() -> Self {
        Self::with_config(Aria2EngineConfig::default())
    }

    /// Create with a custom configuration.
    pub fn with_config(config: Aria2EngineConfig) -> Self {
        let version = Self::detect_version(&config.binary_path);
        Self { config, version }
    }

    pub fn config(&self) -> &Aria2EngineConfig {
        &self.config
    }

    /// Detect aria2 version from the first line of `--version`.
    fn detect_version(path: &str) -> Option<String> {
        let output = quick_command(path).arg("--version").output().ok()?;
        if !output.status.success() {
            debug!(binary = path, "aria2c --version failed");
            return None;
        }
        String::from_utf8(output.stdout)
            .ok()
            .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
    }

    /// Build aria2c command arguments.
    fn build_args(&self, request: &EngineRequest) -> Vec<String> {
        let connections = self.config.connections.max(1).to_string();
        let mut args = vec![
            "-x".to_string(),
            connections.clone(),
            "-s".to_string(),
            connections,
            "--dir".to_string(),
            request.output_dir().to_string_lossy().into_owned(),
            "--out".to_string(),
            request.output_name(),
            // Resume from the partial file and its control file.
            "--continue=true".to_string(),
            "--summary-interval=1".to_string(),
            "--console-log-level=warn".to_string(),
            "--enable-color=false".to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args.push(request.url.clone());
        args
    }
}

impl Default for Aria2Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloadEngine for Aria2Engine {
    fn name(&self) -> &str {
        "aria2c"
    }

    fn build_command(&self, request: &EngineRequest) -> Result<Command> {
        let mut cmd = piped_command(&self.config.binary_path);
        cmd.args(self.build_args(request)).env("LC_ALL", "C");
        Ok(cmd)
    }

    fn parse_line(&self, line: &str) -> ParsedLine {
        parse_line(line)
    }

    fn describe_exit(&self, code: i32) -> String {
        let reason = match code {
            1 => "unknown error",
            2 => "timeout",
            3 => "resource not found",
            4 => "too many resources not found",
            5 => "download speed too slow",
            6 => "network problem",
            7 => "unfinished downloads at shutdown",
            8 => "server does not support resume",
            9 => "not enough disk space",
            13 => "file already exists",
            16 => "could not create file",
            19 => "name resolution failed",
            22 => "bad HTTP response header",
            23 => "too many redirects",
            24 => "HTTP authorization failed",
            28 => "invalid option",
            _ => return format!("exit code {code}"),
        };
        format!("exit code {code} ({reason})")
    }

    fn is_available(&self) -> bool {
        self.version.is_some()
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }
}
