//! Pending-request counter used to detect request quiescence.
//!
//! The record lives in the session's ephemeral database as a single row, so
//! every process serving the session sees the same counter. Arithmetic is done
//! in one `UPDATE` each, never read-modify-write.

use crate::core::{Result, SessionError};
use crate::database::SqliteServer;
use rusqlite::{Connection, params};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const BARRIER_TABLE: &str = "test_session_state";

/// Lower bound on the polling interval of [`RequestBarrier::wait_for_idle`].
pub const MIN_POLL_INTERVAL_MS: u64 = 300;

/// Time given to the browser to react to the last response.
pub const DEFAULT_QUIET_MS: u64 = 700;
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierRecord {
    pub pending_requests: i64,
    pub last_response_timestamp: i64,
}

impl BarrierRecord {
    /// Nothing in flight and nothing finished within `quiet_ms` of `now_ms`.
    pub fn is_idle(&self, now_ms: i64, quiet_ms: u64) -> bool {
        self.pending_requests <= 0
            && now_ms >= self.last_response_timestamp.saturating_add(quiet_ms as i64)
    }
}

#[derive(Debug, Clone)]
pub struct RequestBarrier {
    server: SqliteServer,
    database: String,
}

impl RequestBarrier {
    pub fn new(server: SqliteServer, database: impl Into<String>) -> Self {
        Self {
            server,
            database: database.into(),
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Creates the table if needed and resets it to a single zeroed row.
    pub fn initialize(&self) -> Result<()> {
        let conn = self.open()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id INTEGER PRIMARY KEY,
                pending_requests INTEGER NOT NULL DEFAULT 0,
                last_response_timestamp INTEGER NOT NULL DEFAULT 0
            );
            DELETE FROM {table};
            INSERT INTO {table} (id, pending_requests, last_response_timestamp) VALUES (1, 0, 0);",
            table = BARRIER_TABLE
        ))
        .map_err(|e| barrier_error(&self.database, "initialize", e))
    }

    pub fn increment(&self) -> Result<()> {
        let conn = self.open()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {} SET pending_requests = pending_requests + 1 WHERE id = 1",
                    BARRIER_TABLE
                ),
                [],
            )
            .map_err(|e| barrier_error(&self.database, "increment", e))?;
        self.expect_row(changed)?;
        debug!(database = %self.database, "request entered");
        Ok(())
    }

    /// Releases one request and stamps the response time.
    pub fn decrement(&self) -> Result<()> {
        let conn = self.open()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {} SET pending_requests = MAX(pending_requests - 1, 0), \
                     last_response_timestamp = ?1 WHERE id = 1",
                    BARRIER_TABLE
                ),
                params![now_millis()],
            )
            .map_err(|e| barrier_error(&self.database, "decrement", e))?;
        self.expect_row(changed)?;
        debug!(database = %self.database, "request left");
        Ok(())
    }

    pub fn read(&self) -> Result<BarrierRecord> {
        let conn = self.open()?;
        conn.query_row(
            &format!(
                "SELECT pending_requests, last_response_timestamp FROM {} WHERE id = 1",
                BARRIER_TABLE
            ),
            [],
            |row| {
                Ok(BarrierRecord {
                    pending_requests: row.get(0)?,
                    last_response_timestamp: row.get(1)?,
                })
            },
        )
        .map_err(|e| barrier_error(&self.database, "read", e))
    }

    /// Increments and hands back a guard that decrements when dropped.
    pub fn enter(&self) -> Result<BarrierGuard> {
        self.increment()?;
        Ok(BarrierGuard {
            barrier: self.clone(),
        })
    }

    /// Polls until the barrier is idle. Returns `false` on timeout.
    ///
    /// Must only be awaited from outside the requests being counted.
    pub async fn wait_for_idle(&self, quiet_ms: u64, timeout_ms: u64) -> Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let interval = Duration::from_millis(quiet_ms.max(MIN_POLL_INTERVAL_MS));

        loop {
            if Instant::now() > deadline {
                return Ok(false);
            }

            let record = self.read()?;
            if record.is_idle(now_millis(), quiet_ms) {
                return Ok(true);
            }

            tokio::time::sleep(interval).await;
        }
    }

    fn open(&self) -> Result<Connection> {
        self.server.open(&self.database)
    }

    fn expect_row(&self, changed: usize) -> Result<()> {
        if changed == 1 {
            Ok(())
        } else {
            Err(SessionError::Connection(format!(
                "Barrier record missing in database '{}'",
                self.database
            )))
        }
    }
}

/// Scoped hold on the barrier; the decrement runs on every exit path.
#[must_use = "dropping the guard releases the request immediately"]
#[derive(Debug)]
pub struct BarrierGuard {
    barrier: RequestBarrier,
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        if let Err(e) = self.barrier.decrement() {
            warn!(database = %self.barrier.database, error = %e, "failed to release request barrier");
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn barrier_error(database: &str, op: &str, e: rusqlite::Error) -> SessionError {
    SessionError::Connection(format!(
        "Barrier {} failed on database '{}': {}",
        op, database, e
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn barrier(temp: &TempDir) -> RequestBarrier {
        let server = SqliteServer::new(temp.path(), Duration::from_secs(5));
        server.create_database("ss_tmpdb0000001").unwrap();
        let barrier = RequestBarrier::new(server, "ss_tmpdb0000001");
        barrier.initialize().unwrap();
        barrier
    }

    #[test]
    fn test_initialize_resets_record() {
        let temp = TempDir::new().unwrap();
        let barrier = barrier(&temp);
        barrier.increment().unwrap();
        barrier.initialize().unwrap();
        assert_eq!(
            barrier.read().unwrap(),
            BarrierRecord {
                pending_requests: 0,
                last_response_timestamp: 0
            }
        );
    }

    #[test]
    fn test_decrement_stamps_response_time() {
        let temp = TempDir::new().unwrap();
        let barrier = barrier(&temp);
        let before = now_millis();

        barrier.increment().unwrap();
        assert_eq!(barrier.read().unwrap().pending_requests, 1);
        barrier.decrement().unwrap();

        let record = barrier.read().unwrap();
        assert_eq!(record.pending_requests, 0);
        assert!(record.last_response_timestamp >= before);
    }

    #[test]
    fn test_decrement_never_goes_negative() {
        let temp = TempDir::new().unwrap();
        let barrier = barrier(&temp);
        barrier.decrement().unwrap();
        assert_eq!(barrier.read().unwrap().pending_requests, 0);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let temp = TempDir::new().unwrap();
        let barrier = barrier(&temp);
        {
            let _guard = barrier.enter().unwrap();
            assert_eq!(barrier.read().unwrap().pending_requests, 1);
        }
        assert_eq!(barrier.read().unwrap().pending_requests, 0);
    }

    #[test]
    fn test_concurrent_enter_leave_loses_no_updates() {
        let temp = TempDir::new().unwrap();
        let barrier = Arc::new(barrier(&temp));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        barrier.increment().unwrap();
                        barrier.decrement().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(barrier.read().unwrap().pending_requests, 0);
    }

    #[test]
    fn test_missing_record_is_an_error() {
        let temp = TempDir::new().unwrap();
        let server = SqliteServer::new(temp.path(), Duration::from_secs(1));
        server.create_database("ss_tmpdb0000002").unwrap();
        let barrier = RequestBarrier::new(server, "ss_tmpdb0000002");
        assert!(matches!(
            barrier.increment(),
            Err(SessionError::Connection(_))
        ));
    }

    #[test]
    fn test_is_idle() {
        let record = BarrierRecord {
            pending_requests: 0,
            last_response_timestamp: 1_000,
        };
        assert!(!record.is_idle(1_500, 700));
        assert!(record.is_idle(1_700, 700));

        let busy = BarrierRecord {
            pending_requests: 1,
            last_response_timestamp: 0,
        };
        assert!(!busy.is_idle(i64::MAX / 2, 0));
    }

    #[test]
    fn test_wait_returns_immediately_when_idle() {
        let temp = TempDir::new().unwrap();
        let barrier = barrier(&temp);
        let started = std::time::Instant::now();
        assert!(tokio_test::block_on(barrier.wait_for_idle(700, 10_000)).unwrap());
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_wait_absorbs_quiet_period() {
        let temp = TempDir::new().unwrap();
        let barrier = barrier(&temp);
        barrier.increment().unwrap();
        barrier.decrement().unwrap();

        let started = std::time::Instant::now();
        assert!(barrier.wait_for_idle(300, 5_000).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_wait_times_out_while_pending() {
        let temp = TempDir::new().unwrap();
        let barrier = barrier(&temp);
        let _guard = barrier.enter().unwrap();

        assert!(!barrier.wait_for_idle(100, 700).await.unwrap());
    }
}
