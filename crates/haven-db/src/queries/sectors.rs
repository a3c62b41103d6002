//! Sector index rows: locations, locks, temporary leases, pruning.

use haven_types::{Hash256, SectorLocation, TempSector};
use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

/// A sector index row.
#[derive(Clone, Copy, Debug)]
pub struct SectorSlot {
    /// Row ID of the `volume_sectors` entry.
    pub id: i64,
    /// Physical location.
    pub location: SectorLocation,
    /// True when the on-disk payload failed root verification.
    pub failed: bool,
}

/// Look up the slot holding `root`.
pub fn location(conn: &Connection, root: &Hash256) -> Result<Option<SectorSlot>> {
    let slot = conn
        .query_row(
            "SELECT id, volume_id, volume_index, failed_at IS NOT NULL
             FROM volume_sectors WHERE sector_root=?1",
            [root.as_bytes().as_slice()],
            |row| {
                Ok(SectorSlot {
                    id: row.get(0)?,
                    location: SectorLocation {
                        volume_id: row.get::<_, i64>(1)? as u64,
                        index: row.get::<_, i64>(2)? as u64,
                        root: *root,
                    },
                    failed: row.get(3)?,
                })
            },
        )
        .optional()?;
    Ok(slot)
}

/// Insert a lock row for a slot. Returns the lock ID.
pub fn insert_lock(conn: &Connection, slot_id: i64) -> Result<i64> {
    conn.execute(
        "INSERT INTO locked_volume_sectors (volume_sector_id) VALUES (?1)",
        [slot_id],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Remove a single lock row.
pub fn remove_lock(conn: &Connection, lock_id: i64) -> Result<()> {
    conn.execute("DELETE FROM locked_volume_sectors WHERE id=?1", [lock_id])?;
    Ok(())
}

/// Drop every lock row. Returns the number removed.
pub fn clear_locks(conn: &Connection) -> Result<usize> {
    let removed = conn.execute("DELETE FROM locked_volume_sectors", [])?;
    Ok(removed)
}

/// Total outstanding lock rows.
pub fn count_locks(conn: &Connection) -> Result<u64> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM locked_volume_sectors", [], |r| r.get(0))?;
    Ok(count as u64)
}

/// Pick a free slot for a new sector.
///
/// Only `ready`, writable, available volumes qualify. Among them the
/// volume with the most remaining capacity wins, then the lowest
/// `(volume_id, index)` pair, which balances wear across the fleet while
/// keeping allocation deterministic.
pub fn allocate(conn: &Connection) -> Result<Option<(i64, u64, u64)>> {
    let slot = conn
        .query_row(
            "SELECT vs.id, vs.volume_id, vs.volume_index
             FROM volume_sectors vs
             INNER JOIN storage_volumes v ON v.id = vs.volume_id
             WHERE vs.sector_root IS NULL AND v.available=1 AND v.read_only=0
               AND v.status='ready'
             ORDER BY (v.total_sectors - v.used_sectors) DESC,
                      vs.volume_id ASC, vs.volume_index ASC
             LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )
        .optional()?;
    Ok(slot)
}

/// Pick a destination slot for evacuating a sector out of `from_volume`.
///
/// Targets are free slots on other ready writable volumes, or slots on
/// the source volume itself below `below_index` (the region that survives
/// a shrink).
pub fn allocate_for_migration(
    conn: &Connection,
    from_volume: u64,
    below_index: u64,
) -> Result<Option<(i64, u64, u64)>> {
    let slot = conn
        .query_row(
            "SELECT vs.id, vs.volume_id, vs.volume_index
             FROM volume_sectors vs
             INNER JOIN storage_volumes v ON v.id = vs.volume_id
             WHERE vs.sector_root IS NULL AND (
                 (v.id != ?1 AND v.available=1 AND v.read_only=0 AND v.status='ready')
                 OR (v.id = ?1 AND vs.volume_index < ?2)
             )
             ORDER BY (v.total_sectors - v.used_sectors) DESC,
                      vs.volume_id ASC, vs.volume_index ASC
             LIMIT 1",
            rusqlite::params![from_volume as i64, below_index as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)? as u64,
                    row.get::<_, i64>(2)? as u64,
                ))
            },
        )
        .optional()?;
    Ok(slot)
}

/// Bind a root to a free slot and bump the volume's used count.
pub fn commit_slot(conn: &Connection, slot_id: i64, root: &Hash256) -> Result<()> {
    let updated = conn.execute(
        "UPDATE volume_sectors SET sector_root=?1, failed_at=NULL
         WHERE id=?2 AND sector_root IS NULL",
        rusqlite::params![root.as_bytes().as_slice(), slot_id],
    )?;
    if updated == 0 {
        return Err(Error::InvalidRow(format!("slot {slot_id} is not free")));
    }
    conn.execute(
        "UPDATE storage_volumes SET used_sectors = used_sectors + 1
         WHERE id = (SELECT volume_id FROM volume_sectors WHERE id=?1)",
        [slot_id],
    )?;
    Ok(())
}

/// Free a slot and drop the volume's used count.
pub fn clear_slot(conn: &Connection, slot_id: i64) -> Result<()> {
    let updated = conn.execute(
        "UPDATE storage_volumes SET used_sectors = used_sectors - 1
         WHERE id = (SELECT volume_id FROM volume_sectors
                     WHERE id=?1 AND sector_root IS NOT NULL)",
        [slot_id],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("sector"));
    }
    conn.execute(
        "UPDATE volume_sectors SET sector_root=NULL, failed_at=NULL WHERE id=?1",
        [slot_id],
    )?;
    Ok(())
}

/// Move a root from one slot to another, keeping used counts straight.
/// The physical copy must already have happened.
pub fn move_sector(conn: &Connection, from_slot: i64, to_slot: i64) -> Result<()> {
    let root: Vec<u8> = conn
        .query_row(
            "SELECT sector_root FROM volume_sectors WHERE id=?1 AND sector_root IS NOT NULL",
            [from_slot],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(Error::NotFound("sector"))?;
    clear_slot(conn, from_slot)?;
    commit_slot(conn, to_slot, &Hash256::from_slice(&root)?)?;
    Ok(())
}

/// Mark a slot's payload as failing root verification.
pub fn mark_failed(conn: &Connection, slot_id: i64, timestamp: u64) -> Result<()> {
    conn.execute(
        "UPDATE volume_sectors SET failed_at=?1 WHERE id=?2",
        rusqlite::params![timestamp as i64, slot_id],
    )?;
    Ok(())
}

/// Clear a slot's failure marker after its payload has been rewritten.
pub fn clear_failed(conn: &Connection, slot_id: i64) -> Result<()> {
    conn.execute(
        "UPDATE volume_sectors SET failed_at=NULL WHERE id=?1",
        [slot_id],
    )?;
    Ok(())
}

/// Occupied slots on a volume at or above `from_index`, lowest first.
pub fn occupied_in_range(
    conn: &Connection,
    volume_id: u64,
    from_index: u64,
) -> Result<Vec<SectorSlot>> {
    let mut stmt = conn.prepare(
        "SELECT id, volume_index, sector_root, failed_at IS NOT NULL
         FROM volume_sectors
         WHERE volume_id=?1 AND volume_index>=?2 AND sector_root IS NOT NULL
         ORDER BY volume_index",
    )?;
    let rows = stmt
        .query_map(rusqlite::params![volume_id as i64, from_index as i64], |row| {
            let root: Vec<u8> = row.get(2)?;
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)? as u64, root, row.get::<_, bool>(3)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|(id, index, root, failed)| {
            Ok(SectorSlot {
                id,
                location: SectorLocation {
                    volume_id,
                    index,
                    root: Hash256::from_slice(&root)?,
                },
                failed,
            })
        })
        .collect()
}

/// Number of locks held on a slot.
pub fn slot_lock_count(conn: &Connection, slot_id: i64) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM locked_volume_sectors WHERE volume_sector_id=?1",
        [slot_id],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Reference counts pinning a root: (contract refs, leases, locks).
pub fn root_references(conn: &Connection, root: &Hash256) -> Result<(u64, u64, u64)> {
    let root = root.as_bytes().as_slice();
    let contracts: i64 = conn.query_row(
        "SELECT COUNT(*) FROM contract_sector_roots WHERE sector_root=?1",
        [root],
        |row| row.get(0),
    )?;
    let leases: i64 = conn.query_row(
        "SELECT COUNT(*) FROM temp_storage_sector_roots WHERE sector_root=?1",
        [root],
        |row| row.get(0),
    )?;
    let locks: i64 = conn.query_row(
        "SELECT COUNT(*) FROM locked_volume_sectors
         WHERE volume_sector_id = (SELECT id FROM volume_sectors WHERE sector_root=?1)",
        [root],
        |row| row.get(0),
    )?;
    Ok((contracts as u64, leases as u64, locks as u64))
}

/// Insert temporary leases.
pub fn insert_temp(conn: &Connection, leases: &[TempSector]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO temp_storage_sector_roots (sector_root, expiration_height)
         VALUES (?1, ?2)",
    )?;
    for lease in leases {
        stmt.execute(rusqlite::params![
            lease.root.as_bytes().as_slice(),
            lease.expiration_height as i64
        ])?;
    }
    Ok(())
}

/// Delete leases with `expiration_height <= height`. Returns the number
/// removed.
pub fn expire_temp(conn: &Connection, height: u64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM temp_storage_sector_roots WHERE expiration_height <= ?1",
        [height as i64],
    )?;
    Ok(removed)
}

/// Count outstanding leases.
pub fn count_temp(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM temp_storage_sector_roots",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Count occupied slots.
pub fn count_physical(conn: &Connection) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM volume_sectors WHERE sector_root IS NOT NULL",
        [],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Occupied slots with no contract reference, no lease, and no lock,
/// which makes them eligible for pruning. Bounded by `limit`.
pub fn prunable(conn: &Connection, limit: usize) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT vs.id FROM volume_sectors vs
         WHERE vs.sector_root IS NOT NULL
           AND NOT EXISTS (SELECT 1 FROM contract_sector_roots c
                           WHERE c.sector_root = vs.sector_root)
           AND NOT EXISTS (SELECT 1 FROM temp_storage_sector_roots t
                           WHERE t.sector_root = vs.sector_root)
           AND NOT EXISTS (SELECT 1 FROM locked_volume_sectors l
                           WHERE l.volume_sector_id = vs.id)
         LIMIT ?1",
    )?;
    let rows = stmt
        .query_map([limit as i64], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(rows)
}
