//! # haven-db
//!
//! SQLite-backed persistent store for the haven storage host. One database
//! file per host process holds the volume fleet, the sector index, sector
//! locks and temporary leases, contracts, accounts, and time-bucketed
//! revenue stats.
//!
//! All writes go through [`Store::transaction`], which opens an IMMEDIATE
//! transaction and retries the closure on writer contention with
//! exponential backoff. Closures must therefore be idempotent and free of
//! externally visible side effects; diagnostics are the only exception.

pub mod migrations;
pub mod queries;
pub mod schema;
mod store;

pub use store::{Store, Transaction};

/// Database error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The underlying SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Writer contention persisted past the retry budget. Transient;
    /// callers may retry the whole operation.
    #[error("database busy: retry budget exhausted")]
    Busy,

    /// A migration could not be applied.
    #[error("migration failed: {0}")]
    Migration(String),

    /// The database was written by a newer release.
    #[error("database version {version} is newer than supported {supported}")]
    FutureVersion { version: u64, supported: u64 },

    /// The requested row does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// A debit would drive an account balance negative.
    #[error("insufficient funds: balance {balance} < debit {amount}")]
    InsufficientFunds { balance: u128, amount: u128 },

    /// A stored value failed to parse back into its domain type.
    #[error("invalid stored value: {0}")]
    InvalidRow(String),

    /// A domain type failed validation.
    #[error(transparent)]
    Types(#[from] haven_types::TypesError),
}

/// Convenience result type for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Implemented by error types that can flow out of a [`Store::transaction`]
/// closure. `is_busy` tells the retry loop whether the failure was writer
/// contention rather than a logic error.
pub trait RetryableError: From<Error> {
    /// True when the error signals SQLite writer contention.
    fn is_busy(&self) -> bool;
}

impl RetryableError for Error {
    fn is_busy(&self) -> bool {
        match self {
            Error::Busy => true,
            Error::Sqlite(e) => sqlite_busy(e),
            _ => false,
        }
    }
}

/// True when a rusqlite error is SQLITE_BUSY or SQLITE_LOCKED.
pub(crate) fn sqlite_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked,
                ..
            },
            _,
        )
    )
}
