//! Singleton settings row.

use haven_types::PublicKey;
use rusqlite::{Connection, OptionalExtension};

use crate::queries::column_pubkey;
use crate::Result;

/// Store the host's public key.
pub fn set_host_key(conn: &Connection, key: &PublicKey) -> Result<()> {
    conn.execute(
        "UPDATE global_settings SET host_key=?1 WHERE id=1",
        [key.as_bytes().as_slice()],
    )?;
    Ok(())
}

/// Fetch the host's public key, if one has been stored.
pub fn host_key(conn: &Connection) -> Result<Option<PublicKey>> {
    let key = conn
        .query_row(
            "SELECT host_key FROM global_settings WHERE id=1 AND host_key IS NOT NULL",
            [],
            |row| column_pubkey(row, 0),
        )
        .optional()?;
    Ok(key)
}
