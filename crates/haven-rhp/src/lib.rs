//! # haven-rhp
//!
//! The renter-host protocol surface: price tables with an expiring
//! registry, payment metering against accounts and contract revisions,
//! the framed wire encoding, and the per-stream session handler that
//! dispatches RPCs to the storage engine.

pub mod messages;
pub mod payment;
pub mod pricetable;
pub mod session;
pub mod wire;

pub use pricetable::{PriceTable, PriceTableRegistry, RpcCost};
pub use session::SessionHandler;

use haven_db::RetryableError;

/// Error types for protocol operations.
#[derive(Debug, thiserror::Error)]
pub enum RhpError {
    /// Framing or message decoding failed; the stream is unusable.
    #[error(transparent)]
    Wire(#[from] wire::WireError),

    /// The metadata store failed.
    #[error(transparent)]
    Store(#[from] haven_db::Error),

    /// The storage engine failed.
    #[error(transparent)]
    Storage(#[from] haven_storage::StorageError),

    /// The account ledger failed.
    #[error(transparent)]
    Accounts(#[from] haven_accounts::AccountError),

    /// The contract manager failed.
    #[error(transparent)]
    Contracts(#[from] haven_contracts::ContractError),

    /// No registered price table under the given UID, or it expired.
    #[error("no price table found")]
    NoPriceTable,

    /// A payment did not satisfy the advertised cost.
    #[error("invalid payment: {0}")]
    InvalidPayment(&'static str),

    /// A structurally valid message asked for something the host cannot
    /// serve.
    #[error("bad request: {0}")]
    BadRequest(&'static str),

    /// A withdrawal authorization lapsed.
    #[error("payment expired at height {expiry}, current height {height}")]
    PaymentExpired { expiry: u64, height: u64 },

    /// The peer reported an error.
    #[error("remote error: {0}")]
    Remote(String),

    /// The connection was torn down mid-operation.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience result type for protocol operations.
pub type Result<T> = std::result::Result<T, RhpError>;

impl RetryableError for RhpError {
    fn is_busy(&self) -> bool {
        match self {
            RhpError::Store(e) => e.is_busy(),
            RhpError::Storage(e) => e.is_busy(),
            RhpError::Accounts(e) => e.is_busy(),
            RhpError::Contracts(e) => e.is_busy(),
            _ => false,
        }
    }
}
