//! Retries for writes that hit a busy or locked SQLite database.

use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Backoff schedule for busy retries.
#[derive(Debug, Clone, Copy)]
struct BusyBackoff {
    max_retries: u32,
    base: Duration,
    cap: Duration,
}

const BUSY_BACKOFF: BusyBackoff = BusyBackoff {
    max_retries: 8,
    base: Duration::from_millis(10),
    cap: Duration::from_secs(1),
};

impl BusyBackoff {
    /// Doubling delay for `attempt` (0-based) plus up to 25% jitter, capped.
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16)).min(self.cap);
        let spread = exp.as_millis() as u64 / 4;
        let jitter = Duration::from_millis(random::<u64>() % (spread + 1));
        (exp + jitter).min(self.cap)
    }
}

fn mentions_busy(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}

/// Whether `err` is SQLite reporting contention rather than a real failure.
///
/// Extended result codes (`SQLITE_BUSY_SNAPSHOT`, ...) carry the primary
/// code in their low byte.
pub(crate) fn is_sqlite_busy_error(err: &Error) -> bool {
    match err {
        Error::DatabaseSqlx(sqlx::Error::Database(db_err)) => {
            let primary = db_err
                .code()
                .and_then(|code| code.parse::<i64>().ok())
                .map(|code| code & 0xff);
            matches!(primary, Some(SQLITE_BUSY | SQLITE_LOCKED)) || mentions_busy(db_err.message())
        }
        Error::DatabaseSqlx(other) => mentions_busy(&other.to_string()),
        _ => false,
    }
}

/// Run `op` until it succeeds, fails with a non-busy error or runs out of
/// retries.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= BUSY_BACKOFF.max_retries || !is_sqlite_busy_error(&err) {
            return Err(err);
        }

        let delay = BUSY_BACKOFF.delay(attempt);
        attempt += 1;
        debug!(
            op = op_name,
            attempt,
            max = BUSY_BACKOFF.max_retries,
            "Download store busy, retrying in {:?}",
            delay
        );
        sleep(delay).await;
    }
}
