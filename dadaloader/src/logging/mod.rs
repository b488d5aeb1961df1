//! Tracing setup: console plus a daily rolling file.
//!
//! The filter can be swapped at runtime through [`Logging::set_filter`].
//! Rolling files older than [`RETENTION_DAYS`] are pruned once a day.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::{self, format::Writer, time::FormatTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

use crate::utils::fs::ensure_dir_all;
use crate::{Error, Result};

/// Used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_LOG_FILTER: &str = "dadaloader=info,sqlx=warn";

/// Rolling files are named `dadaloader.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "dadaloader.log";

pub const RETENTION_DAYS: i64 = 7;

struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

pub type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// The installed subscriber's control surface.
pub struct Logging {
    filter: FilterHandle,
    dir: PathBuf,
}

impl Logging {
    fn new(filter: FilterHandle, dir: &Path) -> Self {
        Self {
            filter,
            dir: dir.to_path_buf(),
        }
    }

    /// Current filter directives.
    pub fn filter(&self) -> String {
        self.filter
            .with_current(ToString::to_string)
            .unwrap_or_default()
    }

    /// Replace the filter, e.g. `dadaloader=debug`.
    pub fn set_filter(&self, directives: &str) -> Result<()> {
        let filter = EnvFilter::try_new(directives)
            .map_err(|e| Error::config(format!("invalid log filter '{directives}': {e}")))?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("log filter reload failed: {e}")))?;
        info!(directives, "Log filter changed");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Prune expired log files now and every 24 hours until `cancel` fires.
    pub fn spawn_retention(self: &Arc<Self>, cancel: CancellationToken) {
        let dir = self.dir.clone();
        tokio::spawn(async move {
            let mut daily = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = daily.tick() => {
                        let cutoff = Local::now().date_naive() - chrono::Duration::days(RETENTION_DAYS);
                        match prune_logs(&dir, cutoff).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Pruned old log files"),
                            Err(e) => warn!("Log pruning in {} failed: {}", dir.display(), e),
                        }
                    }
                }
            }
            debug!("Log retention stopped");
        });
    }
}

/// Day a rolling log file was written, from its name.
fn rolled_on(file_name: &str) -> Option<NaiveDate> {
    let suffix = file_name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(suffix, "%Y-%m-%d").ok()
}

/// Remove rolling log files written before `cutoff`. Other files are kept.
async fn prune_logs(dir: &Path, cutoff: NaiveDate) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let expired = entry
            .file_name()
            .to_str()
            .and_then(rolled_on)
            .is_some_and(|day| day < cutoff);
        if !expired || !entry.file_type().await?.is_file() {
            continue;
        }

        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed log file {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Could not remove log file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

/// Install the global subscriber writing to stderr and to `dir`.
///
/// The returned guard flushes the file writer when dropped; hold it until
/// the program exits.
pub fn init_logging(dir: &Path) -> Result<(Arc<Logging>, WorkerGuard)> {
    ensure_dir_all(dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX));
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let (filter_layer, filter) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_writer(std::io::stderr).with_timer(LocalTimer))
        .with(
            fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_timer(LocalTimer),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("logging already initialized: {e}")))?;

    Ok((Arc::new(Logging::new(filter, dir)), guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }

    #[test]
    fn test_rolled_on() {
        assert_eq!(
            rolled_on("dadaloader.log.2025-01-31"),
            NaiveDate::from_ymd_opt(2025, 1, 31)
        );
        assert_eq!(rolled_on("dadaloader.log"), None);
        assert_eq!(rolled_on("other.log.2025-01-31"), None);
        assert_eq!(rolled_on("dadaloader.log.yesterday"), None);
    }

    #[test]
    fn test_set_filter_swaps_directives() {
        let (layer, handle) =
            reload::Layer::<EnvFilter, Registry>::new(EnvFilter::new(DEFAULT_LOG_FILTER));
        let logging = Logging::new(handle, Path::new("logs"));
        assert!(logging.filter().contains("dadaloader=info"));

        logging.set_filter("dadaloader=debug").unwrap();
        assert!(logging.filter().contains("dadaloader=debug"));

        let err = logging.set_filter("dadaloader=verbose").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err}");
        assert!(logging.filter().contains("dadaloader=debug"));
        assert_eq!(logging.dir(), Path::new("logs"));
        drop(layer);
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "dadaloader.log.2025-01-01",
            "dadaloader.log.2025-01-10",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let cutoff = NaiveDate::from_ymd_opt(2025, 1, 5).unwrap();
        assert_eq!(prune_logs(dir.path(), cutoff).await.unwrap(), 1);

        assert!(!dir.path().join("dadaloader.log.2025-01-01").exists());
        assert!(dir.path().join("dadaloader.log.2025-01-10").exists());
        assert!(dir.path().join("notes.txt").exists());
    }
}
