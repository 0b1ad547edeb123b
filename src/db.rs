//! SQLite persistence for spot and WWV records.
//!
//! The persistence worker is the single owner of the database connection.
//! It runs on a blocking thread, drains the write queue, groups pending
//! writes by insert statement, and commits one transaction per group so a
//! batch is atomic as seen by readers. A busy or locked database defers the
//! batch with capped exponential backoff; only past the attempt cap is a
//! batch abandoned.
//!
//! Timestamps are stored as epoch seconds; downstream report tools query
//! them with `DATETIME(time, 'unixepoch')`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, ErrorCode, params};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::queue::QueuedWrite;
use crate::record::{SpotRecord, WwvRecord};
use crate::stats::IngestStats;

/// Append-only spot and WWV tables with the indexes the downstream report
/// tools rely on: most-recent-N by time, and continent-pair aggregates.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dxspot
(
  de TEXT,
  frequency NUMERIC,
  dx TEXT,
  message TEXT,
  mode TEXT,
  db_signal INTEGER,
  cont_de TEXT,
  cont_dx TEXT,
  cqzone_de INTEGER,
  cqzone_dx INTEGER,
  ituzone_de INTEGER,
  ituzone_dx INTEGER,
  band INTEGER,
  time TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_dxspot_time ON dxspot (time DESC);
CREATE INDEX IF NOT EXISTS idx_dxspot_cont_de ON dxspot (cont_de);
CREATE TABLE IF NOT EXISTS wwv
(
  SFI INTEGER,
  A INTEGER,
  K INTEGER,
  conditions TEXT,
  time TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_wwv_time ON wwv (time DESC);
";

const INSERT_SPOT: &str = "INSERT INTO dxspot (de, frequency, dx, message, mode, db_signal, \
     cont_de, cont_dx, cqzone_de, cqzone_dx, ituzone_de, ituzone_dx, band, time) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)";

const INSERT_WWV: &str =
    "INSERT INTO wwv (SFI, A, K, conditions, time) VALUES (?1, ?2, ?3, ?4, ?5)";

/// Open (or create) the spot database and its schema.
///
/// Failure here is startup-fatal; the engine cannot run without storage.
pub fn open_database(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database {}", path.display()))?;
    conn.busy_timeout(busy_timeout)
        .context("failed to set busy timeout")?;
    conn.execute_batch(SCHEMA)
        .context("failed to create tables")?;
    Ok(conn)
}

/// Backoff policy for busy/locked batch writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the doubling delay.
    pub max_delay: Duration,

    /// Attempts per batch before it is abandoned.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: 20,
        }
    }
}

/// Single consumer of the write queue; sole owner of the connection.
pub struct PersistenceWorker {
    conn: Connection,
    rx: mpsc::Receiver<QueuedWrite>,
    stats: Arc<IngestStats>,
    retry: RetryPolicy,
}

impl PersistenceWorker {
    /// Create a worker over an open connection and the queue receiver.
    pub fn new(conn: Connection, rx: mpsc::Receiver<QueuedWrite>, stats: Arc<IngestStats>) -> Self {
        Self {
            conn,
            rx,
            stats,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the busy-retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run until the queue closes, then finish in-flight batches and return.
    ///
    /// Call from a dedicated blocking thread, never from the async runtime.
    pub fn run(mut self) {
        info!("persistence worker started");
        while let Some(first) = self.rx.blocking_recv() {
            let mut pending = vec![first];
            while let Ok(more) = self.rx.try_recv() {
                pending.push(more);
            }
            self.flush(pending);
        }
        info!("persistence worker finished");
    }

    /// Group pending writes by statement and commit one batch per group.
    fn flush(&mut self, pending: Vec<QueuedWrite>) {
        let mut spots = Vec::new();
        let mut wwv = Vec::new();
        for write in pending {
            match write {
                QueuedWrite::Spot(spot) => spots.push(spot),
                QueuedWrite::Wwv(record) => wwv.push(record),
            }
        }

        if !spots.is_empty() {
            self.commit_with_retry("dxspot", |conn| insert_spots(conn, &spots));
        }
        if !wwv.is_empty() {
            self.commit_with_retry("wwv", |conn| insert_wwv(conn, &wwv));
        }
    }

    /// Commit one batch, deferring on a busy database with capped
    /// exponential backoff. The batch is atomic: all rows or none.
    fn commit_with_retry<F>(&mut self, table: &str, mut op: F)
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<usize>,
    {
        let mut delay = self.retry.initial_delay;
        for attempt in 1..=self.retry.max_attempts {
            match op(&mut self.conn) {
                Ok(rows) => {
                    self.stats.record_batch(rows as u64);
                    debug!("committed {rows} rows to {table}");
                    return;
                }
                Err(err) if is_busy_error(&err) => {
                    self.stats.record_busy_retry();
                    warn!(
                        "database busy writing {table} batch (attempt {attempt}), \
                         retrying in {delay:?}"
                    );
                    std::thread::sleep(delay);
                    delay = (delay * 2).min(self.retry.max_delay);
                }
                Err(err) => {
                    error!("failed to write {table} batch: {err}");
                    self.stats.record_abandoned_batch();
                    return;
                }
            }
        }
        error!(
            "giving up on {table} batch after {} busy attempts",
            self.retry.max_attempts
        );
        self.stats.record_abandoned_batch();
    }
}

/// A batch write rejected because another connection holds the write lock.
fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn insert_spots(conn: &mut Connection, batch: &[SpotRecord]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(INSERT_SPOT)?;
        for spot in batch {
            stmt.execute(params![
                spot.de,
                spot.frequency_khz,
                spot.dx,
                spot.message,
                spot.mode.to_string(),
                spot.signal_db,
                spot.cont_de,
                spot.cont_dx,
                spot.cq_de,
                spot.cq_dx,
                spot.itu_de,
                spot.itu_dx,
                spot.band,
                spot.time.timestamp(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

fn insert_wwv(conn: &mut Connection, batch: &[WwvRecord]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(INSERT_WWV)?;
        for record in batch {
            stmt.execute(params![
                record.sfi,
                record.a_index,
                record.k_index,
                record.conditions,
                record.time.timestamp(),
            ])?;
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::write_queue;
    use crate::record::Mode;
    use chrono::Utc;
    use std::sync::atomic::Ordering;

    fn make_spot(dx: &str) -> SpotRecord {
        SpotRecord {
            de: "W1AW".to_string(),
            frequency_khz: 14025.0,
            dx: dx.to_string(),
            message: "CW 10 dB".to_string(),
            cont_de: "NA".to_string(),
            cont_dx: "EU".to_string(),
            cq_de: 5,
            itu_de: 8,
            cq_dx: 14,
            itu_dx: 27,
            mode: Mode::Cw,
            signal_db: Some(10),
            band: 20,
            time: Utc::now(),
        }
    }

    fn make_wwv() -> WwvRecord {
        WwvRecord {
            sfi: 93,
            a_index: 4,
            k_index: 2,
            conditions: "No Storms -> No Storms".to_string(),
            time: Utc::now(),
        }
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_open_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let conn = open_database(&dir.path().join("spots.db"), Duration::from_secs(1)).unwrap();
        assert_eq!(count(&conn, "dxspot"), 0);
        assert_eq!(count(&conn, "wwv"), 0);
    }

    #[test]
    fn test_open_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spots.db");
        open_database(&path, Duration::from_secs(1)).unwrap();
        open_database(&path, Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_batched_writes_persist_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spots.db");
        let conn = open_database(&path, Duration::from_secs(1)).unwrap();

        let stats = Arc::new(IngestStats::new());
        let (queue, rx) = write_queue(64, Arc::clone(&stats));
        let worker = PersistenceWorker::new(conn, rx, Arc::clone(&stats));

        for i in 0..5 {
            queue.enqueue(QueuedWrite::Spot(make_spot(&format!("K{i}ABC"))));
        }
        queue.enqueue(QueuedWrite::Wwv(make_wwv()));
        drop(queue);

        worker.run();

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "dxspot"), 5);
        assert_eq!(count(&conn, "wwv"), 1);
        assert_eq!(stats.rows_written.load(Ordering::Relaxed), 6);
    }

    #[test]
    fn test_spot_row_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spots.db");
        let mut conn = open_database(&path, Duration::from_secs(1)).unwrap();

        let spot = make_spot("UI5A");
        insert_spots(&mut conn, std::slice::from_ref(&spot)).unwrap();

        let (de, dx, mode, band, cont_de): (String, String, String, u16, String) = conn
            .query_row(
                "SELECT de, dx, mode, band, cont_de FROM dxspot",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .unwrap();
        assert_eq!(de, "W1AW");
        assert_eq!(dx, "UI5A");
        assert_eq!(mode, "CW");
        assert_eq!(band, 20);
        assert_eq!(cont_de, "NA");
    }

    #[test]
    fn test_busy_database_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spots.db");
        // Short busy timeout so the first attempts fail fast.
        let conn = open_database(&path, Duration::from_millis(10)).unwrap();

        let stats = Arc::new(IngestStats::new());
        let (queue, rx) = write_queue(64, Arc::clone(&stats));
        let worker = PersistenceWorker::new(conn, rx, Arc::clone(&stats)).with_retry_policy(
            RetryPolicy {
                initial_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                max_attempts: 50,
            },
        );

        for i in 0..4 {
            queue.enqueue(QueuedWrite::Spot(make_spot(&format!("K{i}ABC"))));
        }
        drop(queue);

        // Hold the write lock long enough to force at least one retry.
        let blocker = Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let handle = std::thread::spawn(move || worker.run());
        std::thread::sleep(Duration::from_millis(300));
        blocker.execute_batch("COMMIT").unwrap();
        handle.join().unwrap();

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "dxspot"), 4);
        assert!(stats.busy_retries.load(Ordering::Relaxed) >= 1);
        assert_eq!(stats.abandoned_batches.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_is_busy_error_classification() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(is_busy_error(&busy));
        assert!(!is_busy_error(&rusqlite::Error::QueryReturnedNoRows));
    }
}
