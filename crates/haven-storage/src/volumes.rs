//! Volume lifecycle and raw sector I/O.
//!
//! Each volume is one sparse file whose length is `capacity × SECTOR_SIZE`.
//! File handles are process-owned and shared behind a reader/writer lock:
//! sector reads and writes take the read side (positioned I/O is safe
//! concurrently), while resize and removal take the write side and so wait
//! for in-flight I/O to drain.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use haven_db::{queries, Store};
use haven_types::{
    merkle, CancelToken, SectorLocation, Volume, VolumeStatus, SECTOR_SIZE,
};
use parking_lot::RwLock;

use crate::{Result, StorageError};

/// Sectors preallocated per step while creating or growing a volume, so
/// cancellation stays responsive.
const ALLOC_BATCH: u64 = 64;

/// Sector index rows migrated per transaction while evacuating.
const MIGRATE_BATCH: usize = 32;

struct VolumeFile {
    file: RwLock<File>,
    /// True only while the volume is `Ready`; gates writes.
    writable: AtomicBool,
}

/// Owns the volume files and drives volume lifecycle against the store.
pub struct VolumeManager {
    store: Arc<Store>,
    files: RwLock<HashMap<u64, Arc<VolumeFile>>>,
}

impl VolumeManager {
    /// Load the volume fleet from the store, opening each backing file.
    /// A volume whose file cannot be opened is marked unavailable rather
    /// than failing the whole fleet.
    pub fn new(store: Arc<Store>) -> Result<Self> {
        let manager = VolumeManager {
            store,
            files: RwLock::new(HashMap::new()),
        };
        let volumes: Vec<Volume> = manager.store.read(|c| queries::volumes::list(c))?;
        for volume in volumes {
            match open_rw(&volume.path) {
                Ok(file) => {
                    let writable = volume.status == VolumeStatus::Ready && !volume.read_only;
                    manager.files.write().insert(
                        volume.id,
                        Arc::new(VolumeFile {
                            file: RwLock::new(file),
                            writable: AtomicBool::new(writable),
                        }),
                    );
                }
                Err(err) => {
                    tracing::error!(volume = volume.id, path = %volume.path.display(), %err,
                        "volume file missing; marking unavailable");
                    manager.store.transaction(|tx| {
                        queries::volumes::set_status(tx, volume.id, VolumeStatus::Unavailable)?;
                        queries::volumes::set_available(tx, volume.id, false)?;
                        Ok::<_, StorageError>(())
                    })?;
                }
            }
        }
        Ok(manager)
    }

    /// The volume fleet as recorded in the store.
    pub fn volumes(&self) -> Result<Vec<Volume>> {
        Ok(self.store.read(|c| queries::volumes::list(c))?)
    }

    /// A single volume by ID.
    pub fn volume(&self, id: u64) -> Result<Volume> {
        Ok(self.store.read(|c| queries::volumes::get(c, id))?)
    }

    /// Create a volume: reserve the row, create the file, preallocate in
    /// batches, then flip it ready. Until the flip, writes against the
    /// volume are rejected with "volume not ready".
    pub fn add_volume(
        &self,
        path: &Path,
        initial_sectors: u64,
        read_only: bool,
        cancel: &CancelToken,
    ) -> Result<Volume> {
        let path_str = path.to_string_lossy().into_owned();
        let id = self
            .store
            .transaction(|tx| queries::volumes::insert(tx, &path_str, read_only))
            .map_err(StorageError::Store)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|err| {
                // Roll the row back so a retry can reuse the path.
                let _ = self
                    .store
                    .transaction(|tx| queries::volumes::remove(tx, id));
                StorageError::Io(err)
            })?;

        let handle = Arc::new(VolumeFile {
            file: RwLock::new(file),
            writable: AtomicBool::new(false),
        });
        self.files.write().insert(id, handle.clone());

        if let Err(err) = self.preallocate(&handle, id, 0, initial_sectors, cancel) {
            self.files.write().remove(&id);
            let _ = self.store.transaction(|tx| {
                queries::volumes::shrink(tx, id, 0)?;
                queries::volumes::remove(tx, id)
            });
            let _ = std::fs::remove_file(path);
            return Err(err);
        }

        self.store.transaction(|tx| {
            queries::volumes::set_status(tx, id, VolumeStatus::Ready)?;
            queries::volumes::set_available(tx, id, true)?;
            Ok::<_, StorageError>(())
        })?;
        handle.writable.store(!read_only, Ordering::Release);
        tracing::info!(volume = id, sectors = initial_sectors, "added volume");
        self.volume(id)
    }

    /// Extend the file and record the new slots. Capacity is only updated
    /// in the store after the filesystem call succeeds.
    fn preallocate(
        &self,
        handle: &VolumeFile,
        id: u64,
        from: u64,
        to: u64,
        cancel: &CancelToken,
    ) -> Result<()> {
        let mut current = from;
        while current < to {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let next = (current + ALLOC_BATCH).min(to);
            handle
                .file
                .read()
                .set_len(next * SECTOR_SIZE as u64)?;
            self.store
                .transaction(|tx| queries::volumes::grow(tx, id, current, next))
                .map_err(StorageError::Store)?;
            current = next;
        }
        Ok(())
    }

    /// Append zero-filled capacity to a volume.
    pub fn grow_volume(&self, id: u64, new_sectors: u64, cancel: &CancelToken) -> Result<()> {
        let volume = self.volume(id)?;
        if volume.status != VolumeStatus::Ready {
            return Err(StorageError::VolumeNotReady(id));
        }
        if new_sectors <= volume.total_sectors {
            return Err(StorageError::InvalidResize(format!(
                "grow target {new_sectors} is not above current {}",
                volume.total_sectors
            )));
        }
        let handle = self.handle(id)?;
        self.set_resizing(&handle, id)?;
        let result = self.preallocate(&handle, id, volume.total_sectors, new_sectors, cancel);
        self.finish_resize(&handle, id, &volume, result)
    }

    /// Shrink a volume, evacuating sectors above the new capacity into
    /// free slots elsewhere. Fails if the fleet lacks free capacity or a
    /// sector that must move is locked.
    pub fn shrink_volume(&self, id: u64, new_sectors: u64, cancel: &CancelToken) -> Result<()> {
        let volume = self.volume(id)?;
        if volume.status != VolumeStatus::Ready {
            return Err(StorageError::VolumeNotReady(id));
        }
        if new_sectors >= volume.total_sectors {
            return Err(StorageError::InvalidResize(format!(
                "shrink target {new_sectors} is not below current {}",
                volume.total_sectors
            )));
        }
        let handle = self.handle(id)?;
        self.set_resizing(&handle, id)?;
        let result = (|| {
            self.evacuate(id, new_sectors, cancel)?;
            self.store
                .transaction(|tx| queries::volumes::shrink(tx, id, new_sectors))
                .map_err(StorageError::Store)?;
            handle.file.write().set_len(new_sectors * SECTOR_SIZE as u64)?;
            Ok(())
        })();
        self.finish_resize(&handle, id, &volume, result)
    }

    /// Evacuate every sector and drop the volume. With `force`, sectors
    /// that cannot move are abandoned and their data is lost.
    pub fn remove_volume(&self, id: u64, force: bool, cancel: &CancelToken) -> Result<()> {
        let volume = self.volume(id)?;
        let handle = self.handle(id)?;
        handle.writable.store(false, Ordering::Release);
        self.store.transaction(|tx| {
            queries::volumes::set_status(tx, id, VolumeStatus::Removing)?;
            queries::volumes::set_available(tx, id, false)?;
            Ok::<_, StorageError>(())
        })?;

        let evacuated = self.evacuate(id, 0, cancel);
        match evacuated {
            Ok(()) => {}
            Err(err) if force => {
                tracing::warn!(volume = id, %err, "forced removal; abandoning sectors");
                self.store.transaction(|tx| {
                    for slot in queries::sectors::occupied_in_range(tx, id, 0)? {
                        queries::sectors::clear_slot(tx, slot.id)?;
                    }
                    Ok::<_, StorageError>(())
                })?;
            }
            Err(err) => {
                // Leave the volume intact and restore its previous state.
                self.store.transaction(|tx| {
                    queries::volumes::set_status(tx, id, volume.status)?;
                    queries::volumes::set_available(tx, id, volume.available)?;
                    Ok::<_, StorageError>(())
                })?;
                handle.writable.store(
                    volume.status == VolumeStatus::Ready && !volume.read_only,
                    Ordering::Release,
                );
                return Err(err);
            }
        }

        self.store.transaction(|tx| {
            queries::volumes::shrink(tx, id, 0)?;
            queries::volumes::remove(tx, id)
        })?;
        // Wait out any in-flight reads before unlinking.
        let _guard = handle.file.write();
        self.files.write().remove(&id);
        std::fs::remove_file(&volume.path)?;
        tracing::info!(volume = id, "removed volume");
        Ok(())
    }

    /// Flip the read-only flag.
    pub fn set_read_only(&self, id: u64, read_only: bool) -> Result<()> {
        let volume = self.volume(id)?;
        self.store
            .transaction(|tx| queries::volumes::set_read_only(tx, id, read_only))?;
        let handle = self.handle(id)?;
        handle.writable.store(
            volume.status == VolumeStatus::Ready && !read_only,
            Ordering::Release,
        );
        Ok(())
    }

    /// Read exactly one sector and verify its Merkle root. A mismatch is
    /// an integrity failure; the caller quarantines the index row.
    pub fn read_sector(&self, loc: &SectorLocation) -> Result<Vec<u8>> {
        let handle = self.handle(loc.volume_id)?;
        let mut data = vec![0u8; SECTOR_SIZE];
        {
            let file = handle.file.read();
            file.read_exact_at(&mut data, loc.offset())?;
        }
        let computed = merkle::sector_root(&data);
        if computed != loc.root {
            return Err(StorageError::Integrity {
                expected: loc.root,
                computed,
            });
        }
        Ok(data)
    }

    /// Write exactly one sector with positioned I/O. Durability is
    /// deferred to [`VolumeManager::sync`].
    pub fn write_sector(&self, loc: &SectorLocation, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE {
            return Err(StorageError::InvalidSectorLength(data.len()));
        }
        let handle = self.handle(loc.volume_id)?;
        if !handle.writable.load(Ordering::Acquire) {
            return Err(StorageError::VolumeNotReady(loc.volume_id));
        }
        let file = handle.file.read();
        file.write_all_at(data, loc.offset())?;
        Ok(())
    }

    /// Flush every volume file to disk.
    pub fn sync(&self) -> Result<()> {
        let files: Vec<Arc<VolumeFile>> = self.files.read().values().cloned().collect();
        for handle in files {
            handle.file.read().sync_data()?;
        }
        Ok(())
    }

    /// Move every sector with `index >= keep_below` off the given volume.
    fn evacuate(&self, id: u64, keep_below: u64, cancel: &CancelToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            let moved = self.store.transaction(|tx| {
                let slots = queries::sectors::occupied_in_range(tx, id, keep_below)?;
                let mut moved = 0usize;
                for slot in slots.into_iter().take(MIGRATE_BATCH) {
                    if queries::sectors::slot_lock_count(tx, slot.id)? > 0 {
                        return Err(StorageError::SectorLocked(slot.location.root));
                    }
                    let (target_id, target_volume, target_index) =
                        queries::sectors::allocate_for_migration(tx, id, keep_below)?
                            .ok_or(StorageError::NotEnoughStorage)?;
                    let data = self.read_sector(&slot.location)?;
                    let target = SectorLocation {
                        volume_id: target_volume,
                        index: target_index,
                        root: slot.location.root,
                    };
                    self.write_for_migration(&target, &data)?;
                    queries::sectors::move_sector(tx, slot.id, target_id)?;
                    moved += 1;
                }
                Ok::<_, StorageError>(moved)
            })?;
            if moved == 0 {
                return Ok(());
            }
            tracing::debug!(volume = id, moved, "evacuated sector batch");
        }
    }

    /// Write during evacuation: the gate is the target slot reservation
    /// inside the surrounding transaction, not the writable flag (the
    /// evacuating volume itself may be a target while resizing).
    fn write_for_migration(&self, loc: &SectorLocation, data: &[u8]) -> Result<()> {
        if data.len() != SECTOR_SIZE {
            return Err(StorageError::InvalidSectorLength(data.len()));
        }
        let handle = self.handle(loc.volume_id)?;
        let file = handle.file.read();
        file.write_all_at(data, loc.offset())?;
        Ok(())
    }

    fn handle(&self, id: u64) -> Result<Arc<VolumeFile>> {
        self.files
            .read()
            .get(&id)
            .cloned()
            .ok_or(StorageError::VolumeNotFound(id))
    }

    fn set_resizing(&self, handle: &VolumeFile, id: u64) -> Result<()> {
        handle.writable.store(false, Ordering::Release);
        self.store
            .transaction(|tx| queries::volumes::set_status(tx, id, VolumeStatus::Resizing))?;
        Ok(())
    }

    fn finish_resize(
        &self,
        handle: &VolumeFile,
        id: u64,
        volume: &Volume,
        result: Result<()>,
    ) -> Result<()> {
        self.store
            .transaction(|tx| queries::volumes::set_status(tx, id, VolumeStatus::Ready))?;
        handle
            .writable
            .store(!volume.read_only, Ordering::Release);
        result
    }
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("volumes", &self.files.read().len())
            .finish()
    }
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_types::Hash256;

    fn fixture() -> (tempfile::TempDir, Arc<Store>, VolumeManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Store::open(&dir.path().join("host.db")).expect("open store"));
        let manager = VolumeManager::new(store.clone()).expect("manager");
        (dir, store, manager)
    }

    fn sector(fill: u8) -> Vec<u8> {
        vec![fill; SECTOR_SIZE]
    }

    #[test]
    fn test_add_volume_lifecycle() {
        let (dir, _store, manager) = fixture();
        let volume = manager
            .add_volume(&dir.path().join("data.vol"), 8, false, &CancelToken::new())
            .expect("add volume");
        assert_eq!(volume.total_sectors, 8);
        assert_eq!(volume.status, VolumeStatus::Ready);
        assert!(volume.available);

        let len = std::fs::metadata(dir.path().join("data.vol"))
            .expect("metadata")
            .len();
        assert_eq!(len, 8 * SECTOR_SIZE as u64);
    }

    #[test]
    fn test_add_volume_cancelled() {
        let (dir, store, manager) = fixture();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = manager
            .add_volume(&dir.path().join("data.vol"), 8, false, &cancel)
            .expect_err("must cancel");
        assert!(matches!(err, StorageError::Cancelled));
        assert!(!dir.path().join("data.vol").exists());
        let volumes: Vec<Volume> = store.read(|c| queries::volumes::list(c)).expect("list");
        assert!(volumes.is_empty());
    }

    #[test]
    fn test_write_and_read_sector() {
        let (dir, _store, manager) = fixture();
        let volume = manager
            .add_volume(&dir.path().join("data.vol"), 2, false, &CancelToken::new())
            .expect("add volume");

        let data = sector(0x7F);
        let loc = SectorLocation {
            volume_id: volume.id,
            index: 1,
            root: merkle::sector_root(&data),
        };
        manager.write_sector(&loc, &data).expect("write");
        let read = manager.read_sector(&loc).expect("read");
        assert_eq!(read, data);
    }

    #[test]
    fn test_read_detects_corruption() {
        let (dir, _store, manager) = fixture();
        let volume = manager
            .add_volume(&dir.path().join("data.vol"), 1, false, &CancelToken::new())
            .expect("add volume");

        let data = sector(0x11);
        let loc = SectorLocation {
            volume_id: volume.id,
            index: 0,
            root: merkle::sector_root(&data),
        };
        manager.write_sector(&loc, &data).expect("write");

        // Corrupt the payload on disk behind the manager's back.
        let mut tampered = data.clone();
        tampered[0] ^= 0xFF;
        manager.write_sector(&loc, &tampered).expect("overwrite");

        let err = manager.read_sector(&loc).expect_err("must fail verification");
        assert!(matches!(err, StorageError::Integrity { .. }));
    }

    #[test]
    fn test_write_rejects_wrong_length() {
        let (dir, _store, manager) = fixture();
        let volume = manager
            .add_volume(&dir.path().join("data.vol"), 1, false, &CancelToken::new())
            .expect("add volume");
        let loc = SectorLocation {
            volume_id: volume.id,
            index: 0,
            root: Hash256::ZERO,
        };
        let err = manager
            .write_sector(&loc, &[0u8; 100])
            .expect_err("length check");
        assert!(matches!(err, StorageError::InvalidSectorLength(100)));
    }

    #[test]
    fn test_write_rejects_read_only_volume() {
        let (dir, _store, manager) = fixture();
        let volume = manager
            .add_volume(&dir.path().join("data.vol"), 1, true, &CancelToken::new())
            .expect("add volume");
        let data = sector(0);
        let loc = SectorLocation {
            volume_id: volume.id,
            index: 0,
            root: merkle::sector_root(&data),
        };
        let err = manager.write_sector(&loc, &data).expect_err("read-only");
        assert!(matches!(err, StorageError::VolumeNotReady(_)));

        manager.set_read_only(volume.id, false).expect("unset");
        manager.write_sector(&loc, &data).expect("write after unset");
    }

    #[test]
    fn test_grow_volume() {
        let (dir, _store, manager) = fixture();
        let volume = manager
            .add_volume(&dir.path().join("data.vol"), 4, false, &CancelToken::new())
            .expect("add volume");
        manager
            .grow_volume(volume.id, 16, &CancelToken::new())
            .expect("grow");
        let grown = manager.volume(volume.id).expect("volume");
        assert_eq!(grown.total_sectors, 16);
        assert_eq!(grown.status, VolumeStatus::Ready);
        let len = std::fs::metadata(dir.path().join("data.vol"))
            .expect("metadata")
            .len();
        assert_eq!(len, 16 * SECTOR_SIZE as u64);
    }

    #[test]
    fn test_grow_rejects_smaller_target() {
        let (dir, _store, manager) = fixture();
        let volume = manager
            .add_volume(&dir.path().join("data.vol"), 4, false, &CancelToken::new())
            .expect("add volume");
        assert!(matches!(
            manager.grow_volume(volume.id, 4, &CancelToken::new()),
            Err(StorageError::InvalidResize(_))
        ));
    }

    #[test]
    fn test_remove_empty_volume_unlinks_file() {
        let (dir, _store, manager) = fixture();
        let volume = manager
            .add_volume(&dir.path().join("data.vol"), 2, false, &CancelToken::new())
            .expect("add volume");
        manager
            .remove_volume(volume.id, false, &CancelToken::new())
            .expect("remove");
        assert!(!dir.path().join("data.vol").exists());
        assert!(matches!(
            manager.volume(volume.id),
            Err(StorageError::Store(haven_db::Error::NotFound("volume")))
        ));
    }
}
