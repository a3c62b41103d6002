//! Contract, revision, and usage models.

use serde::{Deserialize, Serialize};

use crate::{Currency, Hash256, PublicKey, Signature};

/// A contract identifier.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ContractId(pub Hash256);

impl ContractId {
    /// Borrow the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl std::fmt::Display for ContractId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::fmt::Debug for ContractId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContractId({})", self.0)
    }
}

/// A reference to a block in the chain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainIndex {
    /// Block height.
    pub height: u64,
    /// Block identifier.
    pub id: Hash256,
}

/// A signed state of a contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    /// The contract this revision belongs to.
    pub contract_id: ContractId,
    /// Strictly increasing revision counter.
    pub revision_number: u64,
    /// Total size of the stored data in bytes.
    pub filesize: u64,
    /// Merkle root over the contract's ordered sector roots.
    pub file_merkle_root: Hash256,
    /// First block of the proof window.
    pub window_start: u64,
    /// Last block of the proof window.
    pub window_end: u64,
    /// Payout to the renter if a valid storage proof is submitted.
    pub valid_renter_payout: Currency,
    /// Payout to the host if a valid storage proof is submitted.
    pub valid_host_payout: Currency,
    /// Payout to the renter if the proof window lapses.
    pub missed_renter_payout: Currency,
    /// Payout to the host if the proof window lapses.
    pub missed_host_payout: Currency,
}

impl Revision {
    /// Canonical byte encoding signed by both parties.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + 8 * 4 + 32 + 16 * 4);
        buf.extend_from_slice(self.contract_id.as_bytes());
        buf.extend_from_slice(&self.revision_number.to_le_bytes());
        buf.extend_from_slice(&self.filesize.to_le_bytes());
        buf.extend_from_slice(self.file_merkle_root.as_bytes());
        buf.extend_from_slice(&self.window_start.to_le_bytes());
        buf.extend_from_slice(&self.window_end.to_le_bytes());
        buf.extend_from_slice(&self.valid_renter_payout.to_be_bytes());
        buf.extend_from_slice(&self.valid_host_payout.to_be_bytes());
        buf.extend_from_slice(&self.missed_renter_payout.to_be_bytes());
        buf.extend_from_slice(&self.missed_host_payout.to_be_bytes());
        buf
    }

    /// The amount transferred from renter to host relative to an earlier
    /// revision, or `None` if the payout movement is inconsistent (the
    /// renter decrease must equal the host increase on both branches).
    pub fn payout_transfer(&self, prev: &Revision) -> Option<Currency> {
        let renter_shift = prev.valid_renter_payout.checked_sub(self.valid_renter_payout)?;
        let host_shift = self.valid_host_payout.checked_sub(prev.valid_host_payout)?;
        let missed_renter_shift = prev
            .missed_renter_payout
            .checked_sub(self.missed_renter_payout)?;
        if renter_shift != host_shift || renter_shift != missed_renter_shift {
            return None;
        }
        Some(renter_shift)
    }
}

/// Lifecycle status of a contract.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractStatus {
    /// Formed but not yet confirmed on chain.
    Pending,
    /// Confirmed and within its window.
    Active,
    /// Storage proof observed; payout settled on the valid branch.
    Successful,
    /// Window lapsed without a proof; payout settled on the missed branch.
    Failed,
    /// Formation never confirmed; the contract never bound the host.
    Rejected,
}

impl ContractStatus {
    /// Stable string form used in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Pending => "pending",
            ContractStatus::Active => "active",
            ContractStatus::Successful => "successful",
            ContractStatus::Failed => "failed",
            ContractStatus::Rejected => "rejected",
        }
    }

    /// Parse the database string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ContractStatus::Pending),
            "active" => Some(ContractStatus::Active),
            "successful" => Some(ContractStatus::Successful),
            "failed" => Some(ContractStatus::Failed),
            "rejected" => Some(ContractStatus::Rejected),
            _ => None,
        }
    }

    /// True once the contract can no longer change state.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ContractStatus::Successful | ContractStatus::Failed | ContractStatus::Rejected
        )
    }
}

impl std::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cumulative revenue and collateral attribution for a contract.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Revenue from RPC base costs and contract prices.
    pub rpc_revenue: Currency,
    /// Revenue from storing data over time.
    pub storage_revenue: Currency,
    /// Revenue from data uploaded to the host.
    pub ingress_revenue: Currency,
    /// Revenue from data downloaded from the host.
    pub egress_revenue: Currency,
    /// Revenue from registry reads and writes.
    pub registry_revenue: Currency,
    /// Amount moved into ephemeral accounts.
    pub account_funding: Currency,
    /// Collateral the host loses if the storage proof is missed.
    pub risked_collateral: Currency,
}

impl Usage {
    /// Checked element-wise accumulation.
    pub fn checked_add(&self, other: &Usage) -> Option<Usage> {
        Some(Usage {
            rpc_revenue: self.rpc_revenue.checked_add(other.rpc_revenue)?,
            storage_revenue: self.storage_revenue.checked_add(other.storage_revenue)?,
            ingress_revenue: self.ingress_revenue.checked_add(other.ingress_revenue)?,
            egress_revenue: self.egress_revenue.checked_add(other.egress_revenue)?,
            registry_revenue: self.registry_revenue.checked_add(other.registry_revenue)?,
            account_funding: self.account_funding.checked_add(other.account_funding)?,
            risked_collateral: self
                .risked_collateral
                .checked_add(other.risked_collateral)?,
        })
    }

    /// Total revenue across every category, excluding risked collateral.
    pub fn total_revenue(&self) -> Currency {
        self.rpc_revenue
            .saturating_add(self.storage_revenue)
            .saturating_add(self.ingress_revenue)
            .saturating_add(self.egress_revenue)
            .saturating_add(self.registry_revenue)
            .saturating_add(self.account_funding)
    }
}

/// A contract as tracked by the host.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contract {
    /// Latest accepted revision.
    pub revision: Revision,
    /// The renter's public key.
    pub renter_key: PublicKey,
    /// Host signature over the latest revision.
    pub host_signature: Signature,
    /// Renter signature over the latest revision.
    pub renter_signature: Signature,
    /// Lifecycle status.
    pub status: ContractStatus,
    /// Collateral the host committed at formation.
    pub locked_collateral: Currency,
    /// Cumulative usage attribution.
    pub usage: Usage,
    /// The contract this one renewed, if any.
    pub renewed_from: Option<ContractId>,
    /// The contract that renewed this one, if any.
    pub renewed_to: Option<ContractId>,
    /// Height at which the contract was negotiated.
    pub negotiation_height: u64,
    /// True once formation is observed on chain.
    pub formation_confirmed: bool,
}

impl Contract {
    /// The contract's identifier.
    pub fn id(&self) -> ContractId {
        self.revision.contract_id
    }
}
