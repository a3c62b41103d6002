//! Sector index: root lookup, locking, temporary leases, pruning.
//!
//! Storing a sector is a two-phase commit between the index and the
//! caller. [`SectorIndex::store_sector`] allocates (or finds) the slot,
//! writes the payload, and takes a lock on the root, returning a
//! [`SectorReservation`]. The caller registers the root with a contract
//! or temporary lease inside its own store transaction and commits the
//! reservation in that same transaction. A reservation dropped without a
//! commit releases the lock and, for a freshly allocated slot nothing
//! else references, frees the slot again.

use std::sync::Arc;

use haven_db::{queries, Store};
use haven_types::{merkle, Hash256, SectorLocation, TempSector, SECTOR_SIZE};

use crate::{Result, StorageError, VolumeManager};

/// Slots freed per pruning transaction.
const PRUNE_BATCH: usize = 64;

/// Root-to-location index over the volume fleet.
pub struct SectorIndex {
    store: Arc<Store>,
    volumes: Arc<VolumeManager>,
}

/// An uncommitted stored sector. See [`SectorIndex::store_sector`].
pub struct SectorReservation {
    store: Arc<Store>,
    location: SectorLocation,
    slot_id: i64,
    lock_id: i64,
    existed: bool,
    committed: bool,
}

/// A held read lock on a stored sector. The root cannot be pruned or
/// evacuated while the guard lives. Dropping the guard releases it;
/// guards must not be dropped inside a store transaction closure.
pub struct SectorLock {
    store: Arc<Store>,
    lock_id: i64,
    released: bool,
}

impl SectorIndex {
    /// Create an index over the given store and volume fleet.
    pub fn new(store: Arc<Store>, volumes: Arc<VolumeManager>) -> Self {
        SectorIndex { store, volumes }
    }

    /// The volume manager backing this index.
    pub fn volumes(&self) -> &Arc<VolumeManager> {
        &self.volumes
    }

    /// Store a sector payload under its root.
    ///
    /// If the root is already indexed the physical slot is shared and no
    /// data is written (a quarantined slot is rewritten and restored
    /// instead). Otherwise a slot is allocated, the payload written, and
    /// the index row inserted once the write syscall has succeeded, all
    /// under one transaction, so concurrent calls for the same root
    /// serialize and agree on a single slot.
    pub fn store_sector(&self, root: Hash256, data: &[u8]) -> Result<SectorReservation> {
        if data.len() != SECTOR_SIZE {
            return Err(StorageError::InvalidSectorLength(data.len()));
        }
        let computed = merkle::sector_root(data);
        if computed != root {
            return Err(StorageError::Integrity {
                expected: root,
                computed,
            });
        }

        let (location, slot_id, lock_id, existed) = self.store.transaction(|tx| {
            if let Some(slot) = queries::sectors::location(tx, &root)? {
                if slot.failed {
                    self.volumes.write_sector(&slot.location, data)?;
                    queries::sectors::clear_failed(tx, slot.id)?;
                }
                let lock_id = queries::sectors::insert_lock(tx, slot.id)?;
                return Ok((slot.location, slot.id, lock_id, true));
            }

            let (slot_id, volume_id, index) = queries::sectors::allocate(tx)?
                .ok_or(StorageError::NotEnoughStorage)?;
            let location = SectorLocation {
                volume_id,
                index,
                root,
            };
            // The row is only bound after the write syscall succeeds; an
            // allocation the transaction later abandons stays free.
            self.volumes.write_sector(&location, data)?;
            queries::sectors::commit_slot(tx, slot_id, &root)?;
            let lock_id = queries::sectors::insert_lock(tx, slot_id)?;
            Ok::<_, StorageError>((location, slot_id, lock_id, false))
        })?;

        tracing::debug!(root = %root, volume = location.volume_id, index = location.index,
            existed, "stored sector");
        Ok(SectorReservation {
            store: self.store.clone(),
            location,
            slot_id,
            lock_id,
            existed,
            committed: false,
        })
    }

    /// Insert temporary leases. Every leased root must already be stored.
    pub fn add_temp_sectors(&self, leases: &[TempSector]) -> Result<()> {
        self.store.transaction(|tx| {
            for lease in leases {
                if queries::sectors::location(tx, &lease.root)?.is_none() {
                    return Err(StorageError::SectorNotFound(lease.root));
                }
            }
            queries::sectors::insert_temp(tx, leases)?;
            Ok(())
        })
    }

    /// Remove every lease expiring at or below `height`.
    pub fn expire_temp_sectors(&self, height: u64) -> Result<usize> {
        let removed = self
            .store
            .transaction(|tx| queries::sectors::expire_temp(tx, height).map_err(StorageError::from))?;
        if removed > 0 {
            tracing::info!(height, removed, "expired temporary sectors");
        }
        Ok(removed)
    }

    /// Look up a sector's location, taking a read lock on the root.
    pub fn sector_location(&self, root: &Hash256) -> Result<(SectorLocation, SectorLock)> {
        let (location, lock_id) = self.store.transaction(|tx| {
            let slot = queries::sectors::location(tx, root)?
                .ok_or(StorageError::SectorNotFound(*root))?;
            if slot.failed {
                return Err(StorageError::SectorFailed(*root));
            }
            let lock_id = queries::sectors::insert_lock(tx, slot.id)?;
            Ok((slot.location, lock_id))
        })?;
        Ok((
            location,
            SectorLock {
                store: self.store.clone(),
                lock_id,
                released: false,
            },
        ))
    }

    /// Read a sector by root, verifying its payload. A verification
    /// failure quarantines the index row and surfaces the integrity
    /// error; the row is excluded from reads until rewritten.
    pub fn read_sector(&self, root: &Hash256) -> Result<Vec<u8>> {
        let (location, lock) = self.sector_location(root)?;
        let result = self.volumes.read_sector(&location);
        if let Err(StorageError::Integrity { .. }) = &result {
            tracing::error!(root = %root, volume = location.volume_id,
                index = location.index, "sector failed verification; quarantining");
            self.store.transaction(|tx| {
                if let Some(slot) = queries::sectors::location(tx, root)? {
                    queries::sectors::mark_failed(tx, slot.id, unix_timestamp())?;
                }
                Ok::<_, StorageError>(())
            })?;
        }
        lock.release()?;
        result
    }

    /// Free every indexed sector with no contract reference, no
    /// unexpired lease, and no lock. Runs in bounded batches, one
    /// transaction each, so pruning never starves ingest.
    pub fn prune_sectors(&self) -> Result<u64> {
        let mut pruned = 0u64;
        loop {
            let batch = self.store.transaction(|tx| {
                let slots = queries::sectors::prunable(tx, PRUNE_BATCH)?;
                for slot_id in &slots {
                    queries::sectors::clear_slot(tx, *slot_id)?;
                }
                Ok::<_, StorageError>(slots.len() as u64)
            })?;
            pruned += batch;
            if batch == 0 {
                break;
            }
        }
        if pruned > 0 {
            tracing::info!(pruned, "pruned unreferenced sectors");
        }
        Ok(pruned)
    }
}

impl std::fmt::Debug for SectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorIndex").finish_non_exhaustive()
    }
}

impl SectorReservation {
    /// The sector's physical location.
    pub fn location(&self) -> SectorLocation {
        self.location
    }

    /// True if the root was already indexed before this reservation.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// Commit inside the caller's transaction: the lock is released and
    /// the index row stays. The caller registers the root with a
    /// contract or lease in the same transaction, making payment and
    /// placement atomic.
    pub fn commit(&mut self, tx: &haven_db::Transaction<'_>) -> Result<()> {
        queries::sectors::remove_lock(tx, self.lock_id)?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for SectorReservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let result = self.store.transaction(|tx| {
            queries::sectors::remove_lock(tx, self.lock_id)?;
            if !self.existed {
                let (contracts, leases, locks) =
                    queries::sectors::root_references(tx, &self.location.root)?;
                if contracts == 0 && leases == 0 && locks == 0 {
                    queries::sectors::clear_slot(tx, self.slot_id)?;
                }
            }
            Ok::<_, StorageError>(())
        });
        if let Err(err) = result {
            tracing::error!(root = %self.location.root, %err,
                "failed to roll back sector reservation");
        }
    }
}

impl std::fmt::Debug for SectorReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SectorReservation")
            .field("location", &self.location)
            .field("existed", &self.existed)
            .field("committed", &self.committed)
            .finish()
    }
}

impl SectorLock {
    /// Release the lock.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store
            .transaction(|tx| queries::sectors::remove_lock(tx, self.lock_id).map_err(StorageError::from))
    }
}

impl Drop for SectorLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let result: Result<()> = self
            .store
            .transaction(|tx| queries::sectors::remove_lock(tx, self.lock_id).map_err(StorageError::from));
        if let Err(err) = result {
            tracing::error!(%err, "failed to release sector lock");
        }
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_types::CancelToken;
    use rand::RngCore;

    fn fixture(sectors: u64) -> (tempfile::TempDir, Arc<Store>, SectorIndex) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Store::open(&dir.path().join("host.db")).expect("open store"));
        let volumes = Arc::new(VolumeManager::new(store.clone()).expect("manager"));
        volumes
            .add_volume(&dir.path().join("data.vol"), sectors, false, &CancelToken::new())
            .expect("add volume");
        let index = SectorIndex::new(store.clone(), volumes);
        (dir, store, index)
    }

    fn random_sector() -> (Hash256, Vec<u8>) {
        let mut data = vec![0u8; SECTOR_SIZE];
        rand::thread_rng().fill_bytes(&mut data[..256]);
        (merkle::sector_root(&data), data)
    }

    fn commit(store: &Store, reservation: &mut SectorReservation) {
        store
            .transaction(|tx| reservation.commit(tx))
            .expect("commit reservation");
    }

    #[test]
    fn test_store_read_roundtrip() {
        let (_dir, store, index) = fixture(4);
        let (root, data) = random_sector();

        let mut reservation = index.store_sector(root, &data).expect("store");
        assert!(!reservation.existed());
        assert_eq!(reservation.location().root, root);
        commit(&store, &mut reservation);

        let read = index.read_sector(&root).expect("read");
        assert_eq!(read, data);
    }

    #[test]
    fn test_store_rejects_root_mismatch() {
        let (_dir, _store, index) = fixture(4);
        let (_, data) = random_sector();
        let err = index
            .store_sector(Hash256([0xEE; 32]), &data)
            .expect_err("mismatched root");
        assert!(matches!(err, StorageError::Integrity { .. }));
    }

    #[test]
    fn test_store_same_root_shares_slot() {
        let (_dir, store, index) = fixture(4);
        let (root, data) = random_sector();

        let mut first = index.store_sector(root, &data).expect("store");
        commit(&store, &mut first);
        let mut second = index.store_sector(root, &data).expect("store again");
        assert!(second.existed());
        assert_eq!(second.location(), first.location());
        commit(&store, &mut second);

        let physical = store
            .read(|c| queries::sectors::count_physical(c))
            .expect("count");
        assert_eq!(physical, 1);
    }

    #[test]
    fn test_uncommitted_reservation_rolls_back() {
        let (_dir, store, index) = fixture(4);
        let (root, data) = random_sector();

        let reservation = index.store_sector(root, &data).expect("store");
        drop(reservation);

        let physical = store
            .read(|c| queries::sectors::count_physical(c))
            .expect("count");
        assert_eq!(physical, 0, "unreferenced fresh slot must be freed");
        let locks = store.read(|c| queries::sectors::count_locks(c)).expect("locks");
        assert_eq!(locks, 0);
        assert!(matches!(
            index.read_sector(&root),
            Err(StorageError::SectorNotFound(_))
        ));
    }

    #[test]
    fn test_uncommitted_reservation_keeps_referenced_sector() {
        let (_dir, store, index) = fixture(4);
        let (root, data) = random_sector();

        // A lease registered mid-flight keeps the slot when the
        // reservation is abandoned.
        let reservation = index.store_sector(root, &data).expect("store");
        store
            .transaction(|tx| {
                queries::sectors::insert_temp(
                    tx,
                    &[TempSector {
                        root,
                        expiration_height: 100,
                    }],
                )
                .map_err(StorageError::from)
            })
            .expect("lease");
        drop(reservation);

        let read = index.read_sector(&root).expect("read");
        assert_eq!(read, data);
    }

    #[test]
    fn test_sector_location_locks_root() {
        let (_dir, store, index) = fixture(4);
        let (root, data) = random_sector();
        let mut reservation = index.store_sector(root, &data).expect("store");
        commit(&store, &mut reservation);

        let (loc, lock) = index.sector_location(&root).expect("locate");
        assert_eq!(loc.root, root);
        assert_eq!(
            store.read(|c| queries::sectors::count_locks(c)).expect("locks"),
            1
        );
        lock.release().expect("release");
        assert_eq!(
            store.read(|c| queries::sectors::count_locks(c)).expect("locks"),
            0
        );
    }

    #[test]
    fn test_missing_root_not_found() {
        let (_dir, _store, index) = fixture(2);
        assert!(matches!(
            index.sector_location(&Hash256([1u8; 32])),
            Err(StorageError::SectorNotFound(_))
        ));
    }

    #[test]
    fn test_temp_lease_requires_stored_root() {
        let (_dir, _store, index) = fixture(2);
        let err = index
            .add_temp_sectors(&[TempSector {
                root: Hash256([2u8; 32]),
                expiration_height: 10,
            }])
            .expect_err("lease on unknown root");
        assert!(matches!(err, StorageError::SectorNotFound(_)));
    }

    #[test]
    fn test_expire_and_prune_removes_sector() {
        let (_dir, store, index) = fixture(4);
        let (root, data) = random_sector();

        let mut reservation = index.store_sector(root, &data).expect("store");
        index
            .add_temp_sectors(&[TempSector {
                root,
                expiration_height: 10,
            }])
            .expect("lease");
        commit(&store, &mut reservation);

        // Not yet expired: nothing to prune.
        index.expire_temp_sectors(9).expect("expire");
        assert_eq!(index.prune_sectors().expect("prune"), 0);
        index.read_sector(&root).expect("still readable");

        index.expire_temp_sectors(10).expect("expire");
        assert_eq!(index.prune_sectors().expect("prune"), 1);
        assert!(matches!(
            index.read_sector(&root),
            Err(StorageError::SectorNotFound(_))
        ));
    }

    #[test]
    fn test_prune_spares_contract_referenced_roots() {
        let (_dir, store, index) = fixture(4);
        let (root, data) = random_sector();
        let mut reservation = index.store_sector(root, &data).expect("store");

        let contract = haven_types::Contract {
            revision: haven_types::Revision {
                contract_id: haven_types::ContractId(Hash256([5u8; 32])),
                window_end: 100,
                ..Default::default()
            },
            renter_key: haven_types::PublicKey([1u8; 32]),
            host_signature: haven_types::Signature([0u8; 64]),
            renter_signature: haven_types::Signature([0u8; 64]),
            status: haven_types::ContractStatus::Active,
            locked_collateral: haven_types::Currency::ZERO,
            usage: Default::default(),
            renewed_from: None,
            renewed_to: None,
            negotiation_height: 0,
            formation_confirmed: true,
        };
        store
            .transaction(|tx| {
                queries::contracts::insert(tx, &contract)?;
                queries::contracts::append_roots(tx, &contract.id(), &[root])?;
                reservation.commit(tx)
            })
            .expect("register with contract");

        assert_eq!(index.prune_sectors().expect("prune"), 0);
        index.read_sector(&root).expect("still readable");
    }

    #[test]
    fn test_quarantine_and_rewrite() {
        let (_dir, store, index) = fixture(2);
        let (root, data) = random_sector();
        let mut reservation = index.store_sector(root, &data).expect("store");
        let location = reservation.location();
        index
            .add_temp_sectors(&[TempSector {
                root,
                expiration_height: 1000,
            }])
            .expect("lease");
        commit(&store, &mut reservation);

        // Corrupt the payload behind the index's back.
        let mut tampered = data.clone();
        tampered[100] ^= 0x01;
        index
            .volumes()
            .write_sector(&location, &tampered)
            .expect("tamper");

        assert!(matches!(
            index.read_sector(&root),
            Err(StorageError::Integrity { .. })
        ));
        // Quarantined: lookups now refuse the root.
        assert!(matches!(
            index.sector_location(&root),
            Err(StorageError::SectorFailed(_))
        ));

        // Rewriting restores it.
        let mut rewrite = index.store_sector(root, &data).expect("rewrite");
        commit(&store, &mut rewrite);
        assert_eq!(index.read_sector(&root).expect("read"), data);
    }

    #[test]
    fn test_clear_locked_sectors_sequence() {
        const SECTORS: u64 = 32;
        let (_dir, store, index) = fixture(SECTORS);

        let check = |locked: u64, temp: u64| {
            let locks = store.read(|c| queries::sectors::count_locks(c)).expect("locks");
            assert_eq!(locks, locked, "lock count");
            let leases = store.read(|c| queries::sectors::count_temp(c)).expect("temp");
            assert_eq!(leases, temp, "lease count");
            let metrics = store.metrics(0).expect("metrics");
            assert_eq!(metrics.storage.temp_sectors, temp, "temp metric");
        };

        let mut roots = Vec::new();
        for i in 0..SECTORS {
            let (root, data) = random_sector();
            let mut reservation = index.store_sector(root, &data).expect("store");
            store
                .transaction(|tx| {
                    queries::sectors::insert_temp(
                        tx,
                        &[TempSector {
                            root,
                            expiration_height: i + 1,
                        }],
                    )?;
                    reservation.commit(tx)
                })
                .expect("commit");
            roots.push(root);
        }

        // All committed: no locks, every lease present. Clearing is a
        // no-op when nothing is locked.
        check(0, SECTORS);
        store.clear_locked_sectors().expect("clear");
        check(0, SECTORS);

        // Hold locks on the first half, then expire their leases.
        let (locked, rest) = roots.split_at(SECTORS as usize / 2);
        let mut guards: Vec<SectorLock> = locked
            .iter()
            .map(|root| index.sector_location(root).expect("lock").1)
            .collect();
        index.expire_temp_sectors(SECTORS / 2).expect("expire");
        check(locked.len() as u64, rest.len() as u64);

        // Startup recovery drops every lock unconditionally.
        store.clear_locked_sectors().expect("clear");
        check(0, rest.len() as u64);
        for guard in guards.drain(..) {
            // The rows are already gone; releasing is a no-op.
            guard.release().expect("release");
        }

        // Lock the rest, expire everything, clear again.
        let guards: Vec<SectorLock> = rest
            .iter()
            .map(|root| index.sector_location(root).expect("lock").1)
            .collect();
        index.expire_temp_sectors(SECTORS).expect("expire");
        check(rest.len() as u64, 0);
        store.clear_locked_sectors().expect("clear");
        check(0, 0);
        drop(guards);
    }
}
