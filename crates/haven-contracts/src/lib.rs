//! # haven-contracts
//!
//! Contract state for the haven storage host: revision acceptance,
//! usage accounting, renewal chaining, and chain-driven lifecycle.
//!
//! The blockchain itself is a collaborator behind the [`ChainClient`]
//! and [`Wallet`] traits; this crate never talks to a network.

mod manager;
pub mod revisions;

pub use manager::{ContractManager, Renewal};

use haven_db::RetryableError;
use haven_types::{ChainIndex, ContractId, Hash256, Signature};

/// Error types for contract operations.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// The metadata store failed.
    #[error(transparent)]
    Store(#[from] haven_db::Error),

    /// No contract with the requested ID.
    #[error("contract not found")]
    NotFound,

    /// The contract is past its proof window or otherwise final.
    #[error("contract expired: window ended at {window_end}, height {height}")]
    Expired { window_end: u64, height: u64 },

    /// The contract was already renewed.
    #[error("contract already renewed to {0}")]
    AlreadyRenewed(ContractId),

    /// The revision number did not strictly increase.
    #[error("revision number must increase: {current} >= {proposed}")]
    RevisionNumber { current: u64, proposed: u64 },

    /// The revision's filesize does not match its sector set.
    #[error("filesize mismatch: expected {expected}, got {got}")]
    FilesizeMismatch { expected: u64, got: u64 },

    /// The revision's Merkle root does not match its sector set.
    #[error("merkle root mismatch: expected {expected}, got {got}")]
    MerkleRootMismatch { expected: Hash256, got: Hash256 },

    /// The payout shift does not equal the stated cost.
    #[error("payout mismatch: expected transfer of {expected}, revision moves {got}")]
    PayoutMismatch { expected: u128, got: u128 },

    /// A revision field that must not change did.
    #[error("immutable field changed: {0}")]
    ImmutableField(&'static str),

    /// A signature failed verification.
    #[error("invalid signature")]
    InvalidSignature,

    /// The required collateral exceeds the host's maximum.
    #[error("collateral {required} exceeds maximum {max}")]
    CollateralExceeded { required: u128, max: u128 },

    /// The renter's payout cannot cover the host's charges.
    #[error("insufficient renter payout: host payout {payout} below charges {charges}")]
    InsufficientPayout { payout: u128, charges: u128 },

    /// A renewal proposal is structurally invalid.
    #[error("invalid renewal: {0}")]
    InvalidRenewal(&'static str),

    /// A price computation overflowed.
    #[error("price arithmetic overflow")]
    Overflow,
}

/// Convenience result type for contract operations.
pub type Result<T> = std::result::Result<T, ContractError>;

impl RetryableError for ContractError {
    fn is_busy(&self) -> bool {
        matches!(self, ContractError::Store(e) if e.is_busy())
    }
}

/// Read access to the blockchain, supplied by the consensus client.
pub trait ChainClient: Send + Sync {
    /// Current chain tip.
    fn tip(&self) -> ChainIndex;

    /// True once the contract's formation transaction is confirmed.
    fn formation_confirmed(&self, id: &ContractId) -> bool;

    /// True once a storage proof for the contract is confirmed.
    fn proof_confirmed(&self, id: &ContractId) -> bool;
}

/// The host's wallet, used to countersign and announce renewal
/// formation transactions.
pub trait Wallet: Send + Sync {
    /// Sign a transaction digest with the wallet key.
    fn sign(&self, digest: &Hash256) -> Signature;

    /// Broadcast an encoded transaction to the network.
    fn broadcast(&self, txn: &[u8]) -> std::result::Result<(), String>;
}
