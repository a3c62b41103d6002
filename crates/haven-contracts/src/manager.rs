//! Contract manager: revisions, renewals, and chain-driven lifecycle.

use std::sync::Arc;

use haven_db::{queries, Store, Transaction};
use haven_types::{
    merkle, ChainIndex, Contract, ContractId, ContractStatus, Currency, Hash256, HostSettings,
    PublicKey, Revision, Signature, SigningKey, Usage, SECTOR_SIZE,
};
use parking_lot::RwLock;

use crate::{revisions, ChainClient, ContractError, Result};

/// A renewal proposal from a renter: the clearing revision of the old
/// contract and the initial revision of its successor.
#[derive(Clone, Debug)]
pub struct Renewal {
    /// Final revision of the old contract: filesize zeroed, root cleared.
    pub final_revision: Revision,
    /// Renter signature over the final revision.
    pub final_renter_signature: Signature,
    /// Initial revision of the new contract, carrying the data forward.
    pub new_revision: Revision,
    /// Renter signature over the new revision.
    pub new_renter_signature: Signature,
    /// Key controlling the new contract.
    pub renter_key: PublicKey,
    /// Collateral the host locks beyond what the stored data risks.
    pub additional_collateral: Currency,
}

/// Manages contract state atop the persistent store.
pub struct ContractManager {
    store: Arc<Store>,
    chain: Arc<dyn ChainClient>,
    settings: Arc<RwLock<HostSettings>>,
    host_key: SigningKey,
}

impl ContractManager {
    /// Create a manager over the given store and chain client.
    pub fn new(
        store: Arc<Store>,
        chain: Arc<dyn ChainClient>,
        settings: Arc<RwLock<HostSettings>>,
        host_key: SigningKey,
    ) -> Self {
        ContractManager {
            store,
            chain,
            settings,
            host_key,
        }
    }

    /// The host's public key; renters verify revision countersignatures
    /// against it.
    pub fn host_key(&self) -> PublicKey {
        self.host_key.public_key()
    }

    /// Track a newly formed contract.
    pub fn add_contract(&self, contract: Contract) -> Result<()> {
        self.store.transaction(|tx| {
            queries::contracts::insert(tx, &contract)?;
            queries::metrics::apply_usage(tx, &contract.usage, unix_timestamp())?;
            Ok::<_, ContractError>(())
        })?;
        tracing::info!(contract = %contract.id(), "added contract");
        Ok(())
    }

    /// Fetch a contract.
    pub fn contract(&self, id: &ContractId) -> Result<Contract> {
        self.store
            .read(|conn| queries::contracts::get(conn, id))
            .map_err(map_not_found)
    }

    /// The contract's ordered sector roots.
    pub fn sector_roots(&self, id: &ContractId) -> Result<Vec<Hash256>> {
        self.store
            .read(|conn| queries::contracts::roots(conn, id))
            .map_err(map_not_found)
    }

    /// Apply a renter-proposed revision inside the caller's transaction.
    ///
    /// The revision must strictly advance, leave identity and window
    /// untouched, describe the sector set after `appended_roots`, move
    /// exactly `expected_transfer` from renter to host, and carry a valid
    /// renter signature. On success the host countersignature is stored
    /// and returned, and `usage_delta` is attributed to the contract.
    pub fn apply_revision(
        &self,
        tx: &Transaction<'_>,
        proposed: Revision,
        renter_signature: Signature,
        expected_transfer: Currency,
        usage_delta: Usage,
        appended_roots: &[Hash256],
    ) -> Result<Signature> {
        let id = proposed.contract_id;
        let contract = queries::contracts::get(tx, &id).map_err(map_not_found)?;
        self.check_revisable(&contract)?;

        let mut roots = queries::contracts::roots(tx, &id)?;
        roots.extend_from_slice(appended_roots);
        let expected_filesize = roots.len() as u64 * SECTOR_SIZE as u64;
        let expected_root = merkle::meta_root(&roots);

        revisions::validate(
            &contract.revision,
            &proposed,
            expected_filesize,
            expected_root,
            expected_transfer,
        )?;
        revisions::verify_renter_signature(&proposed, &contract.renter_key, &renter_signature)?;

        let host_signature = self.host_key.sign(&proposed.signing_bytes());
        queries::contracts::update_revision(tx, &proposed, &renter_signature, &host_signature)?;
        if !appended_roots.is_empty() {
            queries::contracts::append_roots(tx, &id, appended_roots)?;
        }
        queries::contracts::add_usage(tx, &id, &usage_delta)?;
        queries::metrics::apply_usage(tx, &usage_delta, unix_timestamp())?;
        Ok(host_signature)
    }

    /// Renew a contract inside the caller's transaction.
    ///
    /// The old contract's stored sector set carries over to the new one;
    /// the host charges `renew_contract_price` plus storage over the
    /// extension and locks `additional_collateral` plus the risked
    /// portion. The old contract keeps its proof window for the pending
    /// storage proof and is linked to its successor.
    pub fn renew(&self, tx: &Transaction<'_>, renewal: &Renewal) -> Result<(Contract, Signature)> {
        let settings = self.settings.read().clone();
        let old_id = renewal.final_revision.contract_id;
        let old = queries::contracts::get(tx, &old_id).map_err(map_not_found)?;
        self.check_revisable(&old)?;
        if let Some(next) = old.renewed_to {
            return Err(ContractError::AlreadyRenewed(next));
        }

        // The clearing revision empties the old contract in place.
        let final_revision = renewal.final_revision;
        if final_revision.revision_number <= old.revision.revision_number {
            return Err(ContractError::RevisionNumber {
                current: old.revision.revision_number,
                proposed: final_revision.revision_number,
            });
        }
        if final_revision.filesize != 0 {
            return Err(ContractError::FilesizeMismatch {
                expected: 0,
                got: final_revision.filesize,
            });
        }
        if final_revision.file_merkle_root != Hash256::ZERO {
            return Err(ContractError::MerkleRootMismatch {
                expected: Hash256::ZERO,
                got: final_revision.file_merkle_root,
            });
        }
        if final_revision.window_start != old.revision.window_start
            || final_revision.window_end != old.revision.window_end
        {
            return Err(ContractError::InvalidRenewal(
                "clearing revision must keep the proof window",
            ));
        }
        revisions::verify_renter_signature(
            &final_revision,
            &old.renter_key,
            &renewal.final_renter_signature,
        )?;

        // The new contract must carry the old data forward.
        let new_revision = renewal.new_revision;
        if new_revision.contract_id == old_id {
            return Err(ContractError::InvalidRenewal(
                "renewal must form a new contract id",
            ));
        }
        if new_revision.filesize != old.revision.filesize {
            return Err(ContractError::FilesizeMismatch {
                expected: old.revision.filesize,
                got: new_revision.filesize,
            });
        }
        if new_revision.file_merkle_root != old.revision.file_merkle_root {
            return Err(ContractError::MerkleRootMismatch {
                expected: old.revision.file_merkle_root,
                got: new_revision.file_merkle_root,
            });
        }
        if new_revision.window_end <= old.revision.window_end {
            return Err(ContractError::InvalidRenewal(
                "renewal must extend the proof window",
            ));
        }
        revisions::verify_renter_signature(
            &new_revision,
            &renewal.renter_key,
            &renewal.new_renter_signature,
        )?;

        let extension = new_revision.window_end - old.revision.window_end;
        let filesize = old.revision.filesize;
        let storage_revenue = settings
            .storage_price
            .checked_mul(filesize)
            .and_then(|c| c.checked_mul(extension))
            .and_then(|c| c.checked_add(settings.renew_contract_price))
            .ok_or(ContractError::Overflow)?;
        let risked_collateral = settings
            .collateral_per_byte
            .checked_mul(filesize)
            .and_then(|c| c.checked_mul(extension))
            .ok_or(ContractError::Overflow)?;
        let locked_collateral = renewal
            .additional_collateral
            .checked_add(risked_collateral)
            .ok_or(ContractError::Overflow)?;
        if locked_collateral > settings.max_collateral {
            return Err(ContractError::CollateralExceeded {
                required: locked_collateral.0,
                max: settings.max_collateral.0,
            });
        }
        let charges = settings
            .contract_price
            .checked_add(storage_revenue)
            .ok_or(ContractError::Overflow)?;
        if new_revision.valid_host_payout < charges {
            return Err(ContractError::InsufficientPayout {
                payout: new_revision.valid_host_payout.0,
                charges: charges.0,
            });
        }
        if new_revision.valid_host_payout.saturating_sub(risked_collateral)
            != new_revision.missed_host_payout
        {
            return Err(ContractError::InvalidRenewal(
                "missed host payout must equal valid payout minus risked collateral",
            ));
        }

        let final_host_signature = self.host_key.sign(&final_revision.signing_bytes());
        queries::contracts::update_revision(
            tx,
            &final_revision,
            &renewal.final_renter_signature,
            &final_host_signature,
        )?;

        let usage = Usage {
            rpc_revenue: settings.contract_price,
            storage_revenue,
            risked_collateral,
            ..Default::default()
        };
        let new_contract = Contract {
            revision: new_revision,
            renter_key: renewal.renter_key,
            host_signature: self.host_key.sign(&new_revision.signing_bytes()),
            renter_signature: renewal.new_renter_signature,
            status: ContractStatus::Pending,
            locked_collateral,
            usage,
            renewed_from: Some(old_id),
            renewed_to: None,
            negotiation_height: self.chain.tip().height,
            formation_confirmed: false,
        };
        queries::contracts::insert(tx, &new_contract)?;
        queries::contracts::copy_roots(tx, &old_id, &new_contract.id())?;
        queries::contracts::set_renewed(tx, &old_id, &new_contract.id())?;
        queries::metrics::apply_usage(tx, &usage, unix_timestamp())?;

        tracing::info!(old = %old_id, new = %new_contract.id(), extension,
            "renewed contract");
        Ok((new_contract, final_host_signature))
    }

    /// Advance contract lifecycle for a new chain tip: activate pending
    /// contracts whose formation confirmed, reject those whose window
    /// opened unconfirmed, and settle active contracts past their window
    /// by storage-proof presence.
    pub fn process_chain_update(&self, tip: ChainIndex) -> Result<()> {
        let pending = self
            .store
            .read(|conn| queries::contracts::by_status(conn, ContractStatus::Pending))?;
        for id in pending {
            if self.chain.formation_confirmed(&id) {
                self.store.transaction(|tx| {
                    queries::contracts::set_formation_confirmed(tx, &id)?;
                    queries::contracts::set_status(tx, &id, ContractStatus::Active)?;
                    Ok::<_, ContractError>(())
                })?;
                tracing::info!(contract = %id, "contract active");
            } else {
                let contract = self.contract(&id)?;
                if tip.height >= contract.revision.window_start {
                    self.store.transaction(|tx| {
                        queries::contracts::set_status(tx, &id, ContractStatus::Rejected)
                            .map_err(ContractError::from)
                    })?;
                    tracing::warn!(contract = %id, "contract rejected: formation never confirmed");
                }
            }
        }

        let expired = self.store.read(|conn| {
            queries::contracts::expired(conn, ContractStatus::Active, tip.height)
        })?;
        for id in expired {
            let resolved = if self.chain.proof_confirmed(&id) {
                ContractStatus::Successful
            } else {
                ContractStatus::Failed
            };
            self.store.transaction(|tx| {
                queries::contracts::set_status(tx, &id, resolved).map_err(ContractError::from)
            })?;
            tracing::info!(contract = %id, status = %resolved, "contract resolved");
        }
        Ok(())
    }

    /// A contract can be revised while it is pending or active and its
    /// proof window has not opened.
    fn check_revisable(&self, contract: &Contract) -> Result<()> {
        if contract.status.is_final() {
            return Err(ContractError::Expired {
                window_end: contract.revision.window_end,
                height: self.chain.tip().height,
            });
        }
        let height = self.chain.tip().height;
        if height >= contract.revision.window_start {
            return Err(ContractError::Expired {
                window_end: contract.revision.window_end,
                height,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContractManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractManager")
            .field("host_key", &self.host_key.public_key())
            .finish_non_exhaustive()
    }
}

fn map_not_found(err: haven_db::Error) -> ContractError {
    match err {
        haven_db::Error::NotFound("contract") => ContractError::NotFound,
        other => ContractError::Store(other),
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
