//! Download task state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle states of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DownloadStatus {
    /// Created but never started.
    #[default]
    Pending,
    /// An engine run owns the task.
    Downloading,
    /// The engine was terminated on request; partial data is kept on disk.
    Paused,
    /// The engine exited successfully.
    Completed,
    /// The engine failed or could not be launched.
    Error,
    /// Stopped on request.
    Stopped,
}

impl DownloadStatus {
    pub const ALL: [DownloadStatus; 6] = [
        Self::Pending,
        Self::Downloading,
        Self::Paused,
        Self::Completed,
        Self::Error,
        Self::Stopped,
    ];

    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Downloading => "DOWNLOADING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Stopped => "STOPPED",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "DOWNLOADING" => Some(Self::Downloading),
            "PAUSED" => Some(Self::Paused),
            "COMPLETED" => Some(Self::Completed),
            "ERROR" => Some(Self::Error),
            "STOPPED" => Some(Self::Stopped),
            _ => None,
        }
    }

    /// Human readable label for the presentation layer.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Downloading => "Downloading",
            Self::Paused => "Paused",
            Self::Completed => "Completed",
            Self::Error => "Error",
            Self::Stopped => "Stopped",
        }
    }

    /// Completed, Error and Stopped only change on an explicit user command.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Stopped)
    }

    /// Whether an engine run may currently own the task.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Downloading | Self::Paused)
    }

    pub fn can_start(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Stopped | Self::Error | Self::Completed
        )
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, Self::Downloading)
    }

    pub fn can_resume(&self) -> bool {
        matches!(self, Self::Paused)
    }

    pub fn can_stop(&self) -> bool {
        self.is_active()
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: DownloadStatus) -> bool {
        use DownloadStatus::*;

        match (self, target) {
            (Pending, Downloading) => true,
            (Downloading, Paused | Completed | Error | Stopped) => true,
            (Paused, Downloading | Stopped) => true,
            // Restart
            (Stopped | Error | Completed, Downloading) => true,
            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: DownloadStatus) -> Result<DownloadStatus, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::Other(format!(
                "Invalid status transition: cannot transition from {} to {}",
                self.as_str(),
                target.as_str()
            )))
        }
    }
}

impl std::fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
