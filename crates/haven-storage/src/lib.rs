//! # haven-storage
//!
//! The haven storage engine: a fleet of block-addressable volume files
//! and the persistent index mapping sector Merkle roots to physical
//! locations.
//!
//! ## Modules
//!
//! - [`volumes`] — volume lifecycle and raw sector I/O.
//! - [`index`] — root lookup, locking, temporary leases, pruning.

pub mod index;
pub mod volumes;

pub use index::{SectorIndex, SectorLock, SectorReservation};
pub use volumes::VolumeManager;

use haven_db::RetryableError;
use haven_types::Hash256;

/// Error types for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The metadata store failed.
    #[error(transparent)]
    Store(#[from] haven_db::Error),

    /// Disk I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// No sector with the requested root is stored.
    #[error("sector root {0} not found")]
    SectorNotFound(Hash256),

    /// The volume row does not exist or its file is not open.
    #[error("volume {0} not found")]
    VolumeNotFound(u64),

    /// The volume exists but is not accepting the operation.
    #[error("volume {0} not ready")]
    VolumeNotReady(u64),

    /// The fleet has no free writable slot.
    #[error("not enough storage: no free writable slot")]
    NotEnoughStorage,

    /// A sector that must move is locked by a concurrent operation.
    #[error("sector root {0} is locked")]
    SectorLocked(Hash256),

    /// A payload did not have the exact sector length.
    #[error("invalid sector length {0}")]
    InvalidSectorLength(usize),

    /// The on-disk payload no longer matches its recorded root.
    #[error("sector integrity failure: expected root {expected}, computed {computed}")]
    Integrity {
        expected: Hash256,
        computed: Hash256,
    },

    /// The sector is marked failed pending a rewrite.
    #[error("sector root {0} failed verification and is quarantined")]
    SectorFailed(Hash256),

    /// A resize target is invalid for the volume's current size.
    #[error("invalid resize: {0}")]
    InvalidResize(String),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

/// Convenience result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

impl RetryableError for StorageError {
    fn is_busy(&self) -> bool {
        matches!(self, StorageError::Store(e) if e.is_busy())
    }
}
