//! Storage volume rows.

use haven_types::{Volume, VolumeStatus};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::{Error, Result};

fn volume_from_row(row: &Row<'_>) -> rusqlite::Result<(Volume, String)> {
    let status: String = row.get(6)?;
    let volume = Volume {
        id: row.get::<_, i64>(0)? as u64,
        path: std::path::PathBuf::from(row.get::<_, String>(1)?),
        used_sectors: row.get::<_, i64>(2)? as u64,
        total_sectors: row.get::<_, i64>(3)? as u64,
        available: row.get(4)?,
        read_only: row.get(5)?,
        status: VolumeStatus::Unavailable,
    };
    Ok((volume, status))
}

fn parse_volume(pair: (Volume, String)) -> Result<Volume> {
    let (mut volume, status) = pair;
    volume.status = VolumeStatus::parse(&status)
        .ok_or_else(|| Error::InvalidRow(format!("unknown volume status {status:?}")))?;
    Ok(volume)
}

const VOLUME_COLUMNS: &str =
    "id, disk_path, used_sectors, total_sectors, available, read_only, status";

/// Insert a new volume row in the `Creating` state. Returns its ID.
pub fn insert(conn: &Connection, path: &str, read_only: bool) -> Result<u64> {
    conn.execute(
        "INSERT INTO storage_volumes (disk_path, read_only, status, available)
         VALUES (?1, ?2, 'creating', 0)",
        rusqlite::params![path, read_only],
    )?;
    Ok(conn.last_insert_rowid() as u64)
}

/// Fetch a volume by ID.
pub fn get(conn: &Connection, id: u64) -> Result<Volume> {
    let pair = conn
        .query_row(
            &format!("SELECT {VOLUME_COLUMNS} FROM storage_volumes WHERE id=?1"),
            [id as i64],
            volume_from_row,
        )
        .optional()?
        .ok_or(Error::NotFound("volume"))?;
    parse_volume(pair)
}

/// List every volume, ordered by ID.
pub fn list(conn: &Connection) -> Result<Vec<Volume>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {VOLUME_COLUMNS} FROM storage_volumes ORDER BY id"
    ))?;
    let rows = stmt
        .query_map([], volume_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(parse_volume).collect()
}

/// Grow a volume: insert free slot rows for `[old_total, new_total)` and
/// update the capacity.
pub fn grow(conn: &Connection, id: u64, old_total: u64, new_total: u64) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO volume_sectors (volume_id, volume_index) VALUES (?1, ?2)",
    )?;
    for index in old_total..new_total {
        stmt.execute(rusqlite::params![id as i64, index as i64])?;
    }
    conn.execute(
        "UPDATE storage_volumes SET total_sectors=?1 WHERE id=?2",
        rusqlite::params![new_total as i64, id as i64],
    )?;
    Ok(())
}

/// Shrink a volume: drop the free slot rows at and above `new_total` and
/// update the capacity. Fails if any of those slots still holds a sector.
pub fn shrink(conn: &Connection, id: u64, new_total: u64) -> Result<()> {
    let occupied: i64 = conn.query_row(
        "SELECT COUNT(*) FROM volume_sectors
         WHERE volume_id=?1 AND volume_index>=?2 AND sector_root IS NOT NULL",
        rusqlite::params![id as i64, new_total as i64],
        |row| row.get(0),
    )?;
    if occupied != 0 {
        return Err(Error::InvalidRow(format!(
            "cannot shrink volume {id}: {occupied} sectors above index {new_total}"
        )));
    }
    conn.execute(
        "DELETE FROM volume_sectors WHERE volume_id=?1 AND volume_index>=?2",
        rusqlite::params![id as i64, new_total as i64],
    )?;
    conn.execute(
        "UPDATE storage_volumes SET total_sectors=?1 WHERE id=?2",
        rusqlite::params![new_total as i64, id as i64],
    )?;
    Ok(())
}

/// Delete a volume row and its (empty) slots.
pub fn remove(conn: &Connection, id: u64) -> Result<()> {
    let occupied: i64 = conn.query_row(
        "SELECT COUNT(*) FROM volume_sectors WHERE volume_id=?1 AND sector_root IS NOT NULL",
        [id as i64],
        |row| row.get(0),
    )?;
    if occupied != 0 {
        return Err(Error::InvalidRow(format!(
            "cannot remove volume {id}: {occupied} sectors remain"
        )));
    }
    conn.execute("DELETE FROM volume_sectors WHERE volume_id=?1", [id as i64])?;
    conn.execute("DELETE FROM storage_volumes WHERE id=?1", [id as i64])?;
    Ok(())
}

/// Flip the `available` flag.
pub fn set_available(conn: &Connection, id: u64, available: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE storage_volumes SET available=?1 WHERE id=?2",
        rusqlite::params![available, id as i64],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("volume"));
    }
    Ok(())
}

/// Flip the `read_only` flag.
pub fn set_read_only(conn: &Connection, id: u64, read_only: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE storage_volumes SET read_only=?1 WHERE id=?2",
        rusqlite::params![read_only, id as i64],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("volume"));
    }
    Ok(())
}

/// Update the lifecycle status.
pub fn set_status(conn: &Connection, id: u64, status: VolumeStatus) -> Result<()> {
    let updated = conn.execute(
        "UPDATE storage_volumes SET status=?1 WHERE id=?2",
        rusqlite::params![status.as_str(), id as i64],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("volume"));
    }
    Ok(())
}

/// Total free slots across volumes that accept writes.
pub fn writable_free_sectors(conn: &Connection) -> Result<u64> {
    let free: i64 = conn.query_row(
        "SELECT COUNT(*) FROM volume_sectors vs
         INNER JOIN storage_volumes v ON v.id = vs.volume_id
         WHERE vs.sector_root IS NULL AND v.available=1 AND v.read_only=0
           AND v.status='ready'",
        [],
        |row| row.get(0),
    )?;
    Ok(free as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn test_insert_and_get() {
        let store = Store::open_memory().expect("open");
        let id = store
            .transaction(|tx| insert(tx, "/tmp/data.vol", false))
            .expect("insert");
        let volume = store.read(|conn| get(conn, id)).expect("get");
        assert_eq!(volume.id, id);
        assert_eq!(volume.status, VolumeStatus::Creating);
        assert!(!volume.available);
        assert_eq!(volume.total_sectors, 0);
    }

    #[test]
    fn test_grow_creates_slots() {
        let store = Store::open_memory().expect("open");
        let id = store
            .transaction(|tx| insert(tx, "/tmp/data.vol", false))
            .expect("insert");
        store.transaction(|tx| grow(tx, id, 0, 64)).expect("grow");

        let volume = store.read(|conn| get(conn, id)).expect("get");
        assert_eq!(volume.total_sectors, 64);
        let free = store
            .transaction(|tx| {
                set_status(tx, id, VolumeStatus::Ready)?;
                set_available(tx, id, true)?;
                writable_free_sectors(tx)
            })
            .expect("count");
        assert_eq!(free, 64);
    }

    #[test]
    fn test_shrink_requires_empty_slots() {
        let store = Store::open_memory().expect("open");
        let id = store
            .transaction(|tx| insert(tx, "/tmp/data.vol", false))
            .expect("insert");
        store.transaction(|tx| grow(tx, id, 0, 8)).expect("grow");

        // Occupy the last slot.
        store
            .transaction(|tx| {
                tx.execute(
                    "UPDATE volume_sectors SET sector_root=?1
                     WHERE volume_id=?2 AND volume_index=7",
                    rusqlite::params![[9u8; 32].as_slice(), id as i64],
                )?;
                Ok::<_, Error>(())
            })
            .expect("occupy");

        assert!(store.transaction(|tx| shrink(tx, id, 4)).is_err());

        store
            .transaction(|tx| {
                tx.execute(
                    "UPDATE volume_sectors SET sector_root=NULL WHERE volume_id=?1",
                    [id as i64],
                )?;
                Ok::<_, Error>(())
            })
            .expect("clear");
        store.transaction(|tx| shrink(tx, id, 4)).expect("shrink");
        let volume = store.read(|conn| get(conn, id)).expect("get");
        assert_eq!(volume.total_sectors, 4);
    }

    #[test]
    fn test_remove() {
        let store = Store::open_memory().expect("open");
        let id = store
            .transaction(|tx| insert(tx, "/tmp/data.vol", false))
            .expect("insert");
        store.transaction(|tx| grow(tx, id, 0, 4)).expect("grow");
        store.transaction(|tx| remove(tx, id)).expect("remove");
        assert!(matches!(
            store.read(|conn| get(conn, id)),
            Err(Error::NotFound("volume"))
        ));
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let store = Store::open_memory().expect("open");
        store
            .transaction(|tx| insert(tx, "/tmp/data.vol", false))
            .expect("insert");
        assert!(store
            .transaction(|tx| insert(tx, "/tmp/data.vol", false))
            .is_err());
    }
}
