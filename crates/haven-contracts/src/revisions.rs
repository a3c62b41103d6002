//! Revision acceptance checks.
//!
//! A proposed revision is accepted only if every check here passes; the
//! checks are pure so they can run inside a store transaction without
//! side effects.

use haven_types::{Currency, Hash256, PublicKey, Revision, Signature};

use crate::{ContractError, Result};

/// Validate a proposed revision against the current one.
///
/// - the revision number strictly increases,
/// - contract identity and proof window are untouched,
/// - `filesize` and `file_merkle_root` match the sector set the caller
///   derived (current roots plus any appended delta),
/// - the renter-to-host payout shift equals `expected_transfer`.
pub fn validate(
    current: &Revision,
    proposed: &Revision,
    expected_filesize: u64,
    expected_root: Hash256,
    expected_transfer: Currency,
) -> Result<()> {
    if proposed.revision_number <= current.revision_number {
        return Err(ContractError::RevisionNumber {
            current: current.revision_number,
            proposed: proposed.revision_number,
        });
    }
    if proposed.contract_id != current.contract_id {
        return Err(ContractError::ImmutableField("contract_id"));
    }
    if proposed.window_start != current.window_start {
        return Err(ContractError::ImmutableField("window_start"));
    }
    if proposed.window_end != current.window_end {
        return Err(ContractError::ImmutableField("window_end"));
    }
    if proposed.filesize != expected_filesize {
        return Err(ContractError::FilesizeMismatch {
            expected: expected_filesize,
            got: proposed.filesize,
        });
    }
    if proposed.file_merkle_root != expected_root {
        return Err(ContractError::MerkleRootMismatch {
            expected: expected_root,
            got: proposed.file_merkle_root,
        });
    }
    let transfer = proposed
        .payout_transfer(current)
        .ok_or(ContractError::PayoutMismatch {
            expected: expected_transfer.0,
            got: u128::MAX,
        })?;
    if transfer != expected_transfer {
        return Err(ContractError::PayoutMismatch {
            expected: expected_transfer.0,
            got: transfer.0,
        });
    }
    Ok(())
}

/// Verify a renter signature over a revision.
pub fn verify_renter_signature(
    revision: &Revision,
    renter_key: &PublicKey,
    signature: &Signature,
) -> Result<()> {
    renter_key
        .verify(&revision.signing_bytes(), signature)
        .map_err(|_| ContractError::InvalidSignature)
}
