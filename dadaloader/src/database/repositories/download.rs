//! Download task repository.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::database::models::DownloadDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::DownloadStatus;
use crate::{Error, Result};

/// Persistence contract for download tasks.
///
/// Every write returns only after the statement has committed.
#[async_trait]
pub trait DownloadRepository: Send + Sync {
    /// Insert a record and return the id assigned by the store.
    async fn create(&self, record: &DownloadDbModel) -> Result<i64>;
    async fn get(&self, id: i64) -> Result<DownloadDbModel>;
    /// All records ordered by id.
    async fn list_all(&self) -> Result<Vec<DownloadDbModel>>;
    async fn update(
        &self,
        id: i64,
        status: DownloadStatus,
        progress: f64,
        downloaded: u64,
        is_paused: bool,
    ) -> Result<()>;
    async fn update_file_size(&self, id: i64, file_size: u64) -> Result<()>;
    async fn delete(&self, id: i64) -> Result<()>;
}

/// SQLx implementation of DownloadRepository.
pub struct SqlxDownloadRepository {
    pool: SqlitePool,
}

impl SqlxDownloadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn to_db_bytes(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl DownloadRepository for SqlxDownloadRepository {
    async fn create(&self, record: &DownloadDbModel) -> Result<i64> {
        retry_on_sqlite_busy("create_download", || async {
            let result = sqlx::query(
                r#"
                INSERT INTO downloads (url, save_path, file_size, status, progress, downloaded, is_paused, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.url)
            .bind(&record.save_path)
            .bind(record.file_size)
            .bind(&record.status)
            .bind(record.progress)
            .bind(record.downloaded)
            .bind(record.is_paused)
            .bind(&record.created_at)
            .bind(&record.updated_at)
            .execute(&self.pool)
            .await?;
            Ok(result.last_insert_rowid())
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<DownloadDbModel> {
        sqlx::query_as::<_, DownloadDbModel>("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Download", id))
    }

    async fn list_all(&self) -> Result<Vec<DownloadDbModel>> {
        let records =
            sqlx::query_as::<_, DownloadDbModel>("SELECT * FROM downloads ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(records)
    }

    async fn update(
        &self,
        id: i64,
        status: DownloadStatus,
        progress: f64,
        downloaded: u64,
        is_paused: bool,
    ) -> Result<()> {
        let progress = progress.clamp(0.0, 100.0);
        let downloaded = to_db_bytes(downloaded);
        let rows = retry_on_sqlite_busy("update_download", || async {
            let now = Utc::now().to_rfc3339();
            let result = sqlx::query(
                r#"
                UPDATE downloads
                SET status = ?, progress = ?, downloaded = ?, is_paused = ?, updated_at = ?
                WHERE id = ?
                "#,
            )
            .bind(status.as_str())
            .bind(progress)
            .bind(downloaded)
            .bind(is_paused)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            return Err(Error::not_found("Download", id));
        }
        Ok(())
    }

    async fn update_file_size(&self, id: i64, file_size: u64) -> Result<()> {
        let file_size = to_db_bytes(file_size);
        let rows = retry_on_sqlite_busy("update_download_file_size", || async {
            let now = Utc::now().to_rfc3339();
            let result =
                sqlx::query("UPDATE downloads SET file_size = ?, updated_at = ? WHERE id = ?")
                    .bind(file_size)
                    .bind(&now)
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if rows == 0 {
            return Err(Error::not_found("Download", id));
        }
        Ok(())
    }

    async fn delete(&self, id: i64) -> Result<()> {
        retry_on_sqlite_busy("delete_download", || async {
            sqlx::query("DELETE FROM downloads WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_pool, run_migrations};

    async fn setup() -> (tempfile::TempDir, SqlxDownloadRepository) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
        let pool = init_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        (dir, SqlxDownloadRepository::new(pool))
    }

    #[tokio::test]
    async fn test_create_assigns_increasing_ids() {
        let (_dir, repo) = setup().await;

        let first = repo
            .create(&DownloadDbModel::new("https://example.com/a", "/tmp/a"))
            .await
            .unwrap();
        let second = repo
            .create(&DownloadDbModel::new("https://example.com/b", "/tmp/b"))
            .await
            .unwrap();
        assert!(second > first);

        let all = repo.list_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, first);
        assert_eq!(all[1].url, "https://example.com/b");
    }

    #[tokio::test]
    async fn test_update_persists_progress_fields() {
        let (_dir, repo) = setup().await;
        let id = repo
            .create(&DownloadDbModel::new("https://example.com/a", "/tmp/a"))
            .await
            .unwrap();

        repo.update_file_size(id, 2_097_152).await.unwrap();
        repo.update(id, DownloadStatus::Paused, 50.0, 1_048_576, true)
            .await
            .unwrap();

        let record = repo.get(id).await.unwrap();
        assert_eq!(record.status(), DownloadStatus::Paused);
        assert_eq!(record.file_size, 2_097_152);
        assert_eq!(record.downloaded, 1_048_576);
        assert_eq!(record.progress, 50.0);
        assert!(record.is_paused);
    }

    #[tokio::test]
    async fn test_missing_records() {
        let (_dir, repo) = setup().await;

        assert!(repo.get(42).await.unwrap_err().is_not_found());
        assert!(
            repo.update(42, DownloadStatus::Stopped, 0.0, 0, false)
                .await
                .unwrap_err()
                .is_not_found()
        );
        assert!(repo.update_file_size(42, 1).await.unwrap_err().is_not_found());
        // Deleting an unknown id is not an error.
        repo.delete(42).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_removes_record() {
        let (_dir, repo) = setup().await;
        let id = repo
            .create(&DownloadDbModel::new("https://example.com/a", "/tmp/a"))
            .await
            .unwrap();

        repo.delete(id).await.unwrap();
        assert!(repo.list_all().await.unwrap().is_empty());
    }
}
