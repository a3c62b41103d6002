//! # haven-types
//!
//! Shared domain types for the haven storage host: hashes, currency,
//! signing keys, sector and contract models, and the Merkle root
//! construction used for sector payloads.

pub mod accounts;
pub mod cancel;
pub mod contracts;
pub mod currency;
pub mod hash;
pub mod keys;
pub mod merkle;
pub mod settings;
pub mod volumes;

pub use accounts::{Account, AccountId};
pub use cancel::CancelToken;
pub use contracts::{ChainIndex, Contract, ContractId, ContractStatus, Revision, Usage};
pub use currency::Currency;
pub use hash::Hash256;
pub use keys::{PublicKey, Signature, SigningKey};
pub use settings::HostSettings;
pub use volumes::{SectorLocation, TempSector, Volume, VolumeStatus};

/// Size of a sector payload in bytes (4 MiB).
pub const SECTOR_SIZE: usize = 1 << 22;

/// Size of a Merkle tree leaf within a sector.
pub const LEAF_SIZE: usize = 64;

/// Number of leaves in a sector's Merkle tree.
pub const LEAVES_PER_SECTOR: usize = SECTOR_SIZE / LEAF_SIZE;

/// Error types for parsing and validating domain values.
#[derive(Debug, thiserror::Error)]
pub enum TypesError {
    /// A byte slice had the wrong length for the target type.
    #[error("invalid length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },

    /// An Ed25519 public key failed point decompression.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// A signature did not verify against the claimed key and message.
    #[error("signature verification failed")]
    SignatureVerification,

    /// A hex string could not be decoded.
    #[error("invalid hex: {0}")]
    InvalidHex(String),
}

/// Convenience result type for domain value operations.
pub type Result<T> = std::result::Result<T, TypesError>;
