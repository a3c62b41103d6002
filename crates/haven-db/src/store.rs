//! Store handle and the retrying transaction primitive.

use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rusqlite::{Connection, TransactionBehavior};

use crate::{queries, Error, Result, RetryableError};

/// A write transaction handle passed to [`Store::transaction`] closures.
pub type Transaction<'a> = rusqlite::Transaction<'a>;

/// Wall-clock budget for retrying a contended write transaction.
const RETRY_BUDGET: Duration = Duration::from_secs(1);

/// First retry delay; grows by half each attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Longest single retry delay.
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Handle to the host's metadata database.
///
/// The store serializes writers internally; contention from other
/// processes (or extra connections) surfaces as SQLITE_BUSY and is
/// retried by [`Store::transaction`] up to [`RETRY_BUDGET`].
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at the given path.
    ///
    /// Configures pragmas, runs pending migrations, and clears stale
    /// sector locks left behind by an unclean shutdown. Sector locks
    /// guard against live concurrent operations only, so dropping every
    /// lock row on open is sound for the single process that owns the
    /// data directory.
    pub fn open(path: &Path) -> Result<Store> {
        let mut conn = Connection::open(path)?;
        configure(&conn)?;
        crate::migrations::run(&mut conn)?;
        let store = Store {
            conn: Mutex::new(conn),
        };
        store.clear_locked_sectors()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Store> {
        let mut conn = Connection::open_in_memory()?;
        configure(&conn)?;
        crate::migrations::run(&mut conn)?;
        Ok(Store {
            conn: Mutex::new(conn),
        })
    }

    /// Run a closure inside an IMMEDIATE write transaction.
    ///
    /// The closure is re-run from scratch when the database reports
    /// writer contention, so it must be idempotent and must not perform
    /// externally visible side effects; diagnostics are the only
    /// exception. Once the retry budget lapses the error becomes
    /// [`Error::Busy`], distinguishable from every logic error.
    pub fn transaction<T, E, F>(&self, mut f: F) -> std::result::Result<T, E>
    where
        E: RetryableError,
        F: FnMut(&Transaction<'_>) -> std::result::Result<T, E>,
    {
        let mut conn = self.conn.lock();
        let start = Instant::now();
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0u32;
        loop {
            match attempt_transaction(&mut conn, &mut f) {
                Ok(value) => return Ok(value),
                Err(err) if err.is_busy() => {
                    let elapsed = start.elapsed();
                    if elapsed >= RETRY_BUDGET {
                        tracing::warn!(attempt, ?elapsed, "write transaction timed out");
                        return Err(E::from(Error::Busy));
                    }
                    let remaining = RETRY_BUDGET - elapsed;
                    std::thread::sleep(backoff.min(remaining));
                    backoff = (backoff + backoff / 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Run a read-only closure against the connection, outside any
    /// transaction.
    pub fn read<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        E: From<Error>,
        F: FnOnce(&Connection) -> std::result::Result<T, E>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Drop every sector lock row.
    ///
    /// Called on open; also exercised directly by recovery tests.
    pub fn clear_locked_sectors(&self) -> Result<()> {
        let cleared: usize = self.transaction(|tx| queries::sectors::clear_locks(tx))?;
        if cleared > 0 {
            tracing::info!(cleared, "cleared stale sector locks");
        }
        Ok(())
    }

    /// Snapshot of the host's aggregate metrics.
    pub fn metrics(&self, timestamp: u64) -> Result<queries::metrics::Metrics> {
        self.read(|conn| queries::metrics::snapshot(conn, timestamp))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

/// One attempt: begin IMMEDIATE, run the closure, commit.
fn attempt_transaction<T, E, F>(
    conn: &mut Connection,
    f: &mut F,
) -> std::result::Result<T, E>
where
    E: RetryableError,
    F: FnMut(&Transaction<'_>) -> std::result::Result<T, E>,
{
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| E::from(Error::Sqlite(e)))?;
    let value = f(&tx)?;
    tx.commit().map_err(|e| E::from(Error::Sqlite(e)))?;
    Ok(value)
}

/// Configure SQLite pragmas.
///
/// The busy timeout is zero: contention must surface immediately so the
/// retry loop, not SQLite, owns the backoff schedule.
fn configure(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 0;
         PRAGMA synchronous = NORMAL;
         PRAGMA cache_size = -65536;",
    )?;
    Ok(())
}
