//! Integration tests for dadaloader.
//!
//! These tests use a real SQLite database file and a scripted stand-in for
//! aria2c (`sh -c`) that prints aria2-style progress summaries.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dadaloader::Error;
use dadaloader::database::repositories::{DownloadRepository, SqlxDownloadRepository};
use dadaloader::database::{DbPool, init_pool, models::DownloadDbModel, run_migrations};
use dadaloader::domain::{DownloadStatus, TaskSnapshot};
use dadaloader::downloader::engine::utils::parse_line;
use dadaloader::downloader::{
    DownloadEngine, DownloadManager, DownloadManagerConfig, EngineRequest, EngineSupervisor,
    ParsedLine, SupervisorConfig,
};
use process_utils::piped_command;
use tempfile::TempDir;
use tokio::process::Command;

const HALF: &str = "[#1 1.0MiB/2.0MiB(50%) CN:1 DL:100KiB ETA:10s]";
const FULL: &str = "[#1 2.0MiB/2.0MiB(100%) CN:1 DL:100KiB ETA:0s]";

/// Runs `sh -c <script> sh <save_path>`.
struct ScriptEngine {
    script: String,
}

impl DownloadEngine for ScriptEngine {
    fn name(&self) -> &str {
        "script"
    }

    fn build_command(&self, request: &EngineRequest) -> dadaloader::Result<Command> {
        let mut cmd = piped_command("sh");
        cmd.arg("-c")
            .arg(&self.script)
            .arg("sh")
            .arg(&request.save_path);
        Ok(cmd)
    }

    fn parse_line(&self, line: &str) -> ParsedLine {
        parse_line(line)
    }

    fn is_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        None
    }
}

struct Fixture {
    dir: TempDir,
    pool: DbPool,
    repo: Arc<SqlxDownloadRepository>,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
        let pool = init_pool(&url).await.expect("Failed to create test pool");
        run_migrations(&pool).await.expect("Failed to run migrations");
        let repo = Arc::new(SqlxDownloadRepository::new(pool.clone()));
        Self { dir, pool, repo }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn manager(&self, script: impl Into<String>) -> DownloadManager {
        let supervisor_config = SupervisorConfig {
            pause_poll_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let supervisor = Arc::new(EngineSupervisor::new(
            Arc::new(ScriptEngine {
                script: script.into(),
            }),
            supervisor_config.clone(),
        ));
        DownloadManager::new(
            self.repo.clone(),
            supervisor,
            DownloadManagerConfig {
                supervisor: supervisor_config,
                ..Default::default()
            },
        )
    }
}

async fn wait_for(
    manager: &DownloadManager,
    id: i64,
    what: &str,
    predicate: impl Fn(&TaskSnapshot) -> bool,
) -> TaskSnapshot {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = manager.get_task(id).expect("task exists");
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    match result {
        Ok(snapshot) => snapshot,
        Err(_) => panic!(
            "timed out waiting for {what}: {:?}",
            manager.get_task(id).ok()
        ),
    }
}

async fn wait_for_status(manager: &DownloadManager, id: i64, status: DownloadStatus) -> TaskSnapshot {
    wait_for(manager, id, status.label(), |s| s.status == status).await
}

/// The store agrees with memory on every persisted field.
async fn assert_persisted(repo: &SqlxDownloadRepository, snapshot: &TaskSnapshot) {
    let record = repo.get(snapshot.id).await.expect("record exists");
    assert_eq!(record.status(), snapshot.status);
    assert_eq!(record.file_size as u64, snapshot.file_size);
    assert_eq!(record.downloaded as u64, snapshot.downloaded);
    assert_eq!(record.progress, snapshot.progress);
    assert_eq!(record.is_paused, snapshot.is_paused);
}

mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn test_download_runs_to_completion() {
        let fx = Fixture::new().await;
        let manager = fx.manager(format!("echo '{HALF}'; echo '{FULL}'; exit 0"));

        let id = manager
            .add_task("https://example.com/file.bin", fx.path("file.bin"))
            .await
            .unwrap();

        let done = wait_for_status(&manager, id, DownloadStatus::Completed).await;
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.file_size, 2_097_152);
        assert_eq!(done.downloaded, 2_097_152);
        assert_eq!(done.speed_mbps, 0.0);
        assert!(done.persisted);
        assert_persisted(&fx.repo, &done).await;
    }

    #[tokio::test]
    async fn test_zero_exit_completes_from_partial_progress() {
        let fx = Fixture::new().await;
        let manager = fx.manager(format!("echo '{HALF}'; exit 0"));

        let id = manager
            .add_task("https://example.com/file.bin", fx.path("file.bin"))
            .await
            .unwrap();

        let done = wait_for_status(&manager, id, DownloadStatus::Completed).await;
        assert_eq!(done.progress, 100.0);
        assert_eq!(done.downloaded, done.file_size);
        assert_persisted(&fx.repo, &done).await;
    }

    #[tokio::test]
    async fn test_pause_terminates_engine_once() {
        let fx = Fixture::new().await;
        let launches = fx.path("launches");
        let manager = fx.manager(format!(
            "echo launch >> '{}'; echo '{HALF}'; sleep 30",
            launches.display()
        ));

        let id = manager
            .add_task("https://example.com/big.iso", fx.path("big.iso"))
            .await
            .unwrap();
        wait_for(&manager, id, "first sample", |s| s.downloaded > 0).await;

        assert!(manager.pause_task(id).await.unwrap());
        assert!(!manager.pause_task(id).await.unwrap());
        let paused = wait_for_status(&manager, id, DownloadStatus::Paused).await;
        assert!(!manager.pause_task(id).await.unwrap());

        // Several poll intervals without a relaunch.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let launch_count = std::fs::read_to_string(&launches).unwrap().lines().count();
        assert_eq!(launch_count, 1);

        let still = manager.get_task(id).unwrap();
        assert_eq!(still.status, DownloadStatus::Paused);
        assert_eq!(still.downloaded, paused.downloaded);
        assert_eq!(still.downloaded, 1_048_576);

        manager.stop_task(id).await.unwrap();
        wait_for_status(&manager, id, DownloadStatus::Stopped).await;
    }

    #[tokio::test]
    async fn test_error_exit_marks_task_failed() {
        let fx = Fixture::new().await;
        let manager = fx.manager("echo 'Exception: errorCode=3 Resource not found'; exit 3");

        let id = manager
            .add_task("https://example.com/missing.bin", fx.path("missing.bin"))
            .await
            .unwrap();

        let failed = wait_for_status(&manager, id, DownloadStatus::Error).await;
        let message = failed.last_error.clone().unwrap_or_default();
        assert!(message.contains("exit code 3"), "{message}");
        assert!(message.contains("errorCode=3"), "{message}");
        assert_persisted(&fx.repo, &failed).await;

        // A failed download can be restarted.
        assert!(manager.start_task(id).await.unwrap());
        wait_for_status(&manager, id, DownloadStatus::Error).await;
    }

    #[tokio::test]
    async fn test_pause_resume_stop() {
        let fx = Fixture::new().await;
        let manager = fx.manager(format!("echo '{HALF}'; sleep 30"));

        let id = manager
            .add_task("https://example.com/big.iso", fx.path("big.iso"))
            .await
            .unwrap();
        wait_for(&manager, id, "first sample", |s| s.downloaded == 1_048_576).await;

        assert!(manager.pause_task(id).await.unwrap());
        assert!(!manager.pause_task(id).await.unwrap());
        let paused = wait_for_status(&manager, id, DownloadStatus::Paused).await;
        assert!(paused.is_paused);
        assert_eq!(paused.downloaded, 1_048_576);
        assert_persisted(&fx.repo, &paused).await;

        // Commands that do not apply are no-ops.
        assert!(!manager.start_task(id).await.unwrap());
        assert!(!manager.pause_task(id).await.unwrap());

        assert!(manager.resume_task(id).await.unwrap());
        let resumed = wait_for(&manager, id, "relaunch sample", |s| {
            s.status == DownloadStatus::Downloading && s.speed_mbps > 0.0
        })
        .await;
        assert!(!resumed.is_paused);

        assert!(manager.stop_task(id).await.unwrap());
        let stopped = wait_for_status(&manager, id, DownloadStatus::Stopped).await;
        assert!(!stopped.is_paused);
        assert_persisted(&fx.repo, &stopped).await;
        assert!(!manager.stop_task(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_while_paused() {
        let fx = Fixture::new().await;
        let manager = fx.manager(format!("echo '{HALF}'; sleep 30"));

        let id = manager
            .add_task("https://example.com/big.iso", fx.path("big.iso"))
            .await
            .unwrap();
        wait_for(&manager, id, "first sample", |s| s.downloaded > 0).await;

        manager.pause_task(id).await.unwrap();
        wait_for_status(&manager, id, DownloadStatus::Paused).await;

        assert!(manager.stop_task(id).await.unwrap());
        let stopped = wait_for_status(&manager, id, DownloadStatus::Stopped).await;
        assert_eq!(stopped.downloaded, 1_048_576);
        assert!(!stopped.is_paused);
    }

    #[tokio::test]
    async fn test_delete_running_download() {
        let fx = Fixture::new().await;
        let manager = fx.manager(format!("echo partial > \"$1\"; echo '{HALF}'; sleep 30"));
        let save_path = fx.path("video.mp4");

        let id = manager
            .add_task("https://example.com/video.mp4", &save_path)
            .await
            .unwrap();
        wait_for(&manager, id, "first sample", |s| s.downloaded > 0).await;
        assert!(save_path.exists());

        manager.delete_task(id).await.unwrap();

        assert!(!save_path.exists());
        assert!(manager.list_tasks().is_empty());
        assert!(fx.repo.get(id).await.unwrap_err().is_not_found());
        assert!(manager.get_task(id).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_shutdown_leaves_downloads_paused() {
        let fx = Fixture::new().await;
        let manager = fx.manager(format!("echo '{HALF}'; sleep 30"));

        let id = manager
            .add_task("https://example.com/big.iso", fx.path("big.iso"))
            .await
            .unwrap();
        wait_for(&manager, id, "first sample", |s| s.downloaded > 0).await;

        manager.shutdown().await;

        let snapshot = manager.get_task(id).unwrap();
        assert_eq!(snapshot.status, DownloadStatus::Paused);
        assert!(!manager.has_active_tasks());
        assert_persisted(&fx.repo, &snapshot).await;
    }
}

mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_reload_resumes_interrupted_download() {
        let fx = Fixture::new().await;

        // A previous process died while downloading.
        let mut record = DownloadDbModel::new(
            "https://example.com/file.bin",
            fx.path("file.bin").to_string_lossy(),
        );
        record.status = DownloadStatus::Downloading.as_str().to_string();
        let id = fx.repo.create(&record).await.unwrap();
        fx.repo.update_file_size(id, 2_097_152).await.unwrap();
        fx.repo
            .update(id, DownloadStatus::Downloading, 50.0, 1_048_576, false)
            .await
            .unwrap();

        let manager = fx.manager(format!("echo '{FULL}'; exit 0"));
        assert_eq!(manager.load_from_store().await.unwrap(), 1);

        let restored = manager.get_task(id).unwrap();
        assert_eq!(restored.status, DownloadStatus::Paused);
        assert!(restored.is_paused);
        assert_eq!(restored.downloaded, 1_048_576);
        assert_eq!(restored.file_size, 2_097_152);
        assert_persisted(&fx.repo, &restored).await;

        assert_eq!(manager.resume_all().await.unwrap(), 1);
        let done = wait_for_status(&manager, id, DownloadStatus::Completed).await;
        assert_persisted(&fx.repo, &done).await;
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let fx = Fixture::new().await;
        let id = {
            let manager = fx.manager(format!("echo '{HALF}'; sleep 30"));
            let id = manager
                .add_task("https://example.com/big.iso", fx.path("big.iso"))
                .await
                .unwrap();
            wait_for(&manager, id, "first sample", |s| s.downloaded > 0).await;
            manager.pause_task(id).await.unwrap();
            wait_for_status(&manager, id, DownloadStatus::Paused).await;
            manager.shutdown().await;
            id
        };

        let manager = fx.manager("exit 0");
        manager.load_from_store().await.unwrap();
        let snapshot = manager.get_task(id).unwrap();
        assert_eq!(snapshot.status, DownloadStatus::Paused);
        assert_eq!(snapshot.downloaded, 1_048_576);
        assert_eq!(snapshot.progress, 50.0);
        assert_eq!(snapshot.file_size, 2_097_152);

        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM downloads")
            .fetch_one(&fx.pool)
            .await
            .unwrap();
        assert_eq!(rows.0, 1);
    }
}

mod validation_tests {
    use super::*;

    #[tokio::test]
    async fn test_add_rejects_invalid_input() {
        let fx = Fixture::new().await;
        let manager = fx.manager("exit 0");

        let cases: [(&str, PathBuf); 4] = [
            ("", fx.path("a.bin")),
            ("ftp//broken", fx.path("a.bin")),
            ("https://example.com/a.bin", PathBuf::from("a.bin")),
            ("https://example.com/a.bin", fx.path("nope").join("a.bin")),
        ];
        for (url, path) in cases {
            let err = manager.add_task(url, &path).await.unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{url:?} {}: {err}", path.display());
        }
        assert!(fx.repo.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_target_is_rejected() {
        let fx = Fixture::new().await;
        let manager = fx.manager(format!("echo '{HALF}'; sleep 30"));
        let path = fx.path("same.bin");

        let id = manager.add_task("https://example.com/a", &path).await.unwrap();
        let err = manager
            .add_task("https://example.com/b", &path)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        manager.stop_task(id).await.unwrap();
        wait_for_status(&manager, id, DownloadStatus::Stopped).await;
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let fx = Fixture::new().await;
        let manager = fx.manager("exit 0");
        assert!(manager.start_task(404).await.unwrap_err().is_not_found());
        assert!(manager.delete_task(404).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_suggested_path_skips_taken_names() {
        let fx = Fixture::new().await;
        let manager = fx.manager(format!("echo '{HALF}'; sleep 30"));
        std::fs::write(fx.path("setup.exe"), b"x").unwrap();

        let first = manager
            .suggest_save_path("https://example.com/dl/setup.exe", fx.dir.path())
            .unwrap();
        assert_eq!(first, fx.path("setup_1.exe"));

        // A path held by a task is taken even before the file exists.
        let id = manager
            .add_task("https://example.com/dl/setup.exe", &first)
            .await
            .unwrap();
        let second = manager
            .suggest_save_path("https://example.com/dl/setup.exe", fx.dir.path())
            .unwrap();
        assert_eq!(second, fx.path("setup_2.exe"));

        manager.delete_task(id).await.unwrap();
    }
}
