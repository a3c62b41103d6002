//! Storage volume and sector location models.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::Hash256;

/// Lifecycle status of a storage volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeStatus {
    /// The volume row exists but the backing file is still being created
    /// or preallocated. Writes are rejected.
    Creating,
    /// The volume is ready to serve reads and writes.
    Ready,
    /// A grow or shrink is in progress.
    Resizing,
    /// The volume is being evacuated prior to removal.
    Removing,
    /// The backing file could not be opened; reads and writes fail.
    Unavailable,
}

impl VolumeStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeStatus::Creating => "creating",
            VolumeStatus::Ready => "ready",
            VolumeStatus::Resizing => "resizing",
            VolumeStatus::Removing => "removing",
            VolumeStatus::Unavailable => "unavailable",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(VolumeStatus::Creating),
            "ready" => Some(VolumeStatus::Ready),
            "resizing" => Some(VolumeStatus::Resizing),
            "removing" => Some(VolumeStatus::Removing),
            "unavailable" => Some(VolumeStatus::Unavailable),
            _ => None,
        }
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A storage volume: one file holding a contiguous array of sector slots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Volume {
    /// Monotonic volume ID assigned by the store.
    pub id: u64,
    /// Filesystem path of the backing file.
    pub path: PathBuf,
    /// Capacity in sectors.
    pub total_sectors: u64,
    /// Number of slots holding a sector.
    pub used_sectors: u64,
    /// True when the volume may serve requests.
    pub available: bool,
    /// True when new writes are rejected.
    pub read_only: bool,
    /// Lifecycle status.
    pub status: VolumeStatus,
}

impl Volume {
    /// Remaining free slots.
    pub fn free_sectors(&self) -> u64 {
        self.total_sectors.saturating_sub(self.used_sectors)
    }
}

/// The physical location of a stored sector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorLocation {
    /// Volume holding the sector.
    pub volume_id: u64,
    /// Slot index within the volume.
    pub index: u64,
    /// Merkle root of the sector payload.
    pub root: Hash256,
}

impl SectorLocation {
    /// Byte offset of the slot within the volume file.
    pub fn offset(&self) -> u64 {
        self.index * crate::SECTOR_SIZE as u64
    }
}

/// A temporary storage lease on a sector root.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TempSector {
    /// The leased sector root.
    pub root: Hash256,
    /// Block height at which the lease lapses.
    pub expiration_height: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            VolumeStatus::Creating,
            VolumeStatus::Ready,
            VolumeStatus::Resizing,
            VolumeStatus::Removing,
            VolumeStatus::Unavailable,
        ] {
            assert_eq!(VolumeStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(VolumeStatus::parse("bogus"), None);
    }

    #[test]
    fn test_location_offset() {
        let loc = SectorLocation {
            volume_id: 1,
            index: 3,
            root: Hash256::ZERO,
        };
        assert_eq!(loc.offset(), 3 * crate::SECTOR_SIZE as u64);
    }

    #[test]
    fn test_free_sectors() {
        let volume = Volume {
            id: 1,
            path: PathBuf::from("/tmp/data.vol"),
            total_sectors: 100,
            used_sectors: 40,
            available: true,
            read_only: false,
            status: VolumeStatus::Ready,
        };
        assert_eq!(volume.free_sectors(), 60);
    }
}
