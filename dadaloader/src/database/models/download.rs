//! Download task database model.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::domain::DownloadStatus;

/// Persisted download task.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DownloadDbModel {
    /// Assigned by the store on insert.
    pub id: i64,
    pub url: String,
    pub save_path: String,
    /// Bytes, 0 while unknown
    pub file_size: i64,
    /// Status: PENDING, DOWNLOADING, PAUSED, COMPLETED, ERROR, STOPPED
    pub status: String,
    pub progress: f64,
    pub downloaded: i64,
    pub is_paused: bool,
    /// ISO 8601 timestamp
    pub created_at: String,
    /// ISO 8601 timestamp
    pub updated_at: String,
}

impl DownloadDbModel {
    pub fn new(url: impl Into<String>, save_path: impl Into<String>) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: 0,
            url: url.into(),
            save_path: save_path.into(),
            file_size: 0,
            status: DownloadStatus::Pending.as_str().to_string(),
            progress: 0.0,
            downloaded: 0,
            is_paused: false,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Decoded status. Unknown strings fall back to `Pending`.
    pub fn status(&self) -> DownloadStatus {
        DownloadStatus::parse(&self.status).unwrap_or_else(|| {
            tracing::warn!(
                id = self.id,
                status = %self.status,
                "Unknown download status in store, treating as pending"
            );
            DownloadStatus::Pending
        })
    }
}
