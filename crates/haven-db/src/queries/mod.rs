//! Typed query functions over the raw connection.
//!
//! Every function takes a `&Connection` and composes inside
//! [`crate::Store::transaction`] closures (a transaction handle derefs to
//! the connection). Functions never begin or commit transactions
//! themselves.

pub mod accounts;
pub mod contracts;
pub mod metrics;
pub mod sectors;
pub mod settings;
pub mod volumes;

use haven_types::{Currency, Hash256, PublicKey, Signature};
use rusqlite::types::Type;
use rusqlite::Row;

/// Decode a 16-byte big-endian currency column.
pub(crate) fn column_currency(row: &Row<'_>, idx: usize) -> rusqlite::Result<Currency> {
    let blob: Vec<u8> = row.get(idx)?;
    Currency::from_be_slice(&blob)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))
}

/// Decode a 32-byte hash column.
pub(crate) fn column_hash(row: &Row<'_>, idx: usize) -> rusqlite::Result<Hash256> {
    let blob: Vec<u8> = row.get(idx)?;
    Hash256::from_slice(&blob)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))
}

/// Decode a nullable 32-byte hash column.
pub(crate) fn column_opt_hash(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Hash256>> {
    let blob: Option<Vec<u8>> = row.get(idx)?;
    blob.map(|b| {
        Hash256::from_slice(&b).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e))
        })
    })
    .transpose()
}

/// Decode a 32-byte public key column.
pub(crate) fn column_pubkey(row: &Row<'_>, idx: usize) -> rusqlite::Result<PublicKey> {
    let blob: Vec<u8> = row.get(idx)?;
    PublicKey::from_slice(&blob)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))
}

/// Decode a 64-byte signature column.
pub(crate) fn column_signature(row: &Row<'_>, idx: usize) -> rusqlite::Result<Signature> {
    let blob: Vec<u8> = row.get(idx)?;
    Signature::from_slice(&blob)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))
}
