//! Host settings supplied by the operator's settings provider.

use serde::{Deserialize, Serialize};

use crate::Currency;

/// Pricing and policy knobs the host advertises through its price table.
///
/// Per-byte prices are scaled by payload length; the storage and
/// collateral rates are additionally scaled by duration in blocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostSettings {
    /// Address announced to renters.
    pub announce_address: String,
    /// Whether new contracts are accepted.
    pub accepting_contracts: bool,
    /// Upper bound on any single account balance.
    pub max_account_balance: Currency,
    /// Upper bound on collateral locked into a single contract.
    pub max_collateral: Currency,
    /// Flat price charged when forming or renewing a contract.
    pub contract_price: Currency,
    /// Base cost charged for every priced RPC.
    pub base_rpc_price: Currency,
    /// Price per byte per block for stored data.
    pub storage_price: Currency,
    /// Price per byte uploaded to the host.
    pub ingress_price: Currency,
    /// Price per byte downloaded from the host.
    pub egress_price: Currency,
    /// Collateral risked per byte per block of stored data.
    pub collateral_per_byte: Currency,
    /// Flat cost of the renewal RPC, burned on proof failure.
    pub renew_contract_price: Currency,
    /// Flat cost of funding an account from a contract.
    pub fund_account_price: Currency,
    /// Length of the storage-proof window in blocks.
    pub window_size: u64,
    /// Longest contract duration the host accepts, in blocks.
    pub max_contract_duration: u64,
    /// How long a registered price table stays valid.
    pub price_table_validity: std::time::Duration,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            announce_address: String::new(),
            accepting_contracts: false,
            max_account_balance: Currency::coins(10),
            max_collateral: Currency::coins(1000),
            contract_price: Currency(200_000_000),
            base_rpc_price: Currency(100_000),
            storage_price: Currency(30),
            ingress_price: Currency(10),
            egress_price: Currency(50),
            collateral_per_byte: Currency(60),
            renew_contract_price: Currency(100_000_000),
            fund_account_price: Currency(100_000),
            window_size: 144,
            max_contract_duration: 4320,
            price_table_validity: std::time::Duration::from_secs(30 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let s = HostSettings::default();
        assert!(!s.accepting_contracts);
        assert!(s.max_account_balance > Currency::ZERO);
        assert!(s.window_size > 0);
        assert!(s.price_table_validity.as_secs() > 0);
    }
}
