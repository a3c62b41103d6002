//! Price tables and the expiring registry.
//!
//! A price table is the host's signed-off cost schedule for one renter
//! session window. Tables are registered at the moment of purchase and
//! expire exactly `validity` later. Because validity is a host-wide
//! constant while a table is live, insertion order equals expiry order:
//! the registry keeps a FIFO of expirations and a single pruner task
//! armed at the head's deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use haven_types::{Currency, HostSettings, Usage, SECTOR_SIZE};
use parking_lot::RwLock;
use rand::RngCore;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::{Result, RhpError};

/// A price table UID.
pub type PriceTableUid = [u8; 16];

/// Per-operation cost schedule advertised to renters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriceTable {
    /// Random identifier assigned at generation.
    pub uid: PriceTableUid,
    /// How long the table is valid once registered, in seconds.
    pub validity_secs: u64,
    /// Chain height the host generated the table at.
    pub host_height: u64,
    /// Cost of registering this table for paid use.
    pub update_price_table_cost: Currency,
    /// Flat price charged when forming or renewing a contract.
    pub contract_price: Currency,
    /// Base cost charged for every priced RPC.
    pub base_rpc_cost: Currency,
    /// Flat cost of funding an account from a contract.
    pub fund_account_cost: Currency,
    /// Flat cost of the renewal RPC.
    pub renew_contract_cost: Currency,
    /// Price per byte per block for stored data.
    pub write_store_cost: Currency,
    /// Price per byte uploaded.
    pub ingress_cost: Currency,
    /// Price per byte downloaded.
    pub egress_cost: Currency,
    /// Collateral risked per byte per block.
    pub collateral_cost: Currency,
    /// Upper bound on collateral locked into one contract.
    pub max_collateral: Currency,
    /// Longest accepted contract duration in blocks.
    pub max_duration: u64,
    /// Storage-proof window length in blocks.
    pub window_size: u64,
}

/// The priced components of one RPC. Kept separate until settlement so
/// each component lands in its revenue category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcCost {
    /// Flat per-call cost.
    pub base: Currency,
    /// Storage-over-time component.
    pub storage: Currency,
    /// Upload bandwidth component.
    pub ingress: Currency,
    /// Download bandwidth component.
    pub egress: Currency,
    /// Collateral the host puts at risk (not charged to the renter).
    pub collateral: Currency,
}

impl RpcCost {
    /// Combine two costs component-wise, saturating.
    pub fn add(&self, other: &RpcCost) -> RpcCost {
        RpcCost {
            base: self.base.saturating_add(other.base),
            storage: self.storage.saturating_add(other.storage),
            ingress: self.ingress.saturating_add(other.ingress),
            egress: self.egress.saturating_add(other.egress),
            collateral: self.collateral.saturating_add(other.collateral),
        }
    }

    /// Amount the renter pays: every component except collateral.
    pub fn total(&self) -> Currency {
        self.base
            .saturating_add(self.storage)
            .saturating_add(self.ingress)
            .saturating_add(self.egress)
    }

    /// Map the components onto revenue categories.
    pub fn to_usage(&self) -> Usage {
        Usage {
            rpc_revenue: self.base,
            storage_revenue: self.storage,
            ingress_revenue: self.ingress,
            egress_revenue: self.egress,
            risked_collateral: self.collateral,
            ..Default::default()
        }
    }
}

impl PriceTable {
    /// Generate a fresh table from the host's settings at the given
    /// chain height.
    pub fn generate(settings: &HostSettings, host_height: u64) -> PriceTable {
        let mut uid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut uid);
        PriceTable {
            uid,
            validity_secs: settings.price_table_validity.as_secs(),
            host_height,
            update_price_table_cost: settings.contract_price,
            contract_price: settings.contract_price,
            base_rpc_cost: settings.base_rpc_price,
            fund_account_cost: settings.fund_account_price,
            renew_contract_cost: settings.renew_contract_price,
            write_store_cost: settings.storage_price,
            ingress_cost: settings.ingress_price,
            egress_cost: settings.egress_price,
            collateral_cost: settings.collateral_per_byte,
            max_collateral: settings.max_collateral,
            max_duration: settings.max_contract_duration,
            window_size: settings.window_size,
        }
    }

    /// The table's validity window.
    pub fn validity(&self) -> Duration {
        Duration::from_secs(self.validity_secs)
    }

    /// Flat cost charged for any priced RPC.
    pub fn base_cost(&self) -> RpcCost {
        RpcCost {
            base: self.base_rpc_cost,
            ..Default::default()
        }
    }

    /// Cost of appending one sector to a contract lasting `duration`
    /// more blocks, and the collateral the host risks for it.
    pub fn append_sector_cost(&self, duration: u64) -> RpcCost {
        let sector = SECTOR_SIZE as u64;
        RpcCost {
            base: Currency::ZERO,
            storage: per_byte_block(self.write_store_cost, sector, duration),
            ingress: self.ingress_cost.saturating_mul(sector),
            egress: Currency::ZERO,
            collateral: per_byte_block(self.collateral_cost, sector, duration),
        }
    }

    /// Cost of holding one sector in temporary storage for `duration`
    /// blocks.
    pub fn store_sector_cost(&self, duration: u64) -> RpcCost {
        let sector = SECTOR_SIZE as u64;
        RpcCost {
            storage: per_byte_block(self.write_store_cost, sector, duration),
            ingress: self.ingress_cost.saturating_mul(sector),
            ..Default::default()
        }
    }

    /// Cost of reading `length` bytes.
    pub fn read_sector_cost(&self, length: u64) -> RpcCost {
        RpcCost {
            egress: self.egress_cost.saturating_mul(length),
            ..Default::default()
        }
    }
}

fn per_byte_block(rate: Currency, bytes: u64, blocks: u64) -> Currency {
    rate.checked_mul(bytes)
        .and_then(|c| c.checked_mul(blocks))
        .unwrap_or(Currency::MAX)
}

/// Registered price tables with a single scheduled pruner.
pub struct PriceTableRegistry {
    state: RwLock<RegistryState>,
    notify: Notify,
}

struct RegistryState {
    tables: HashMap<PriceTableUid, PriceTable>,
    /// FIFO of (uid, expiry); append order equals expiry order.
    expirations: VecDeque<(PriceTableUid, Instant)>,
}

impl PriceTableRegistry {
    /// An empty registry. Spawn [`PriceTableRegistry::run`] on the
    /// runtime to drive expiry.
    pub fn new() -> Arc<Self> {
        Arc::new(PriceTableRegistry {
            state: RwLock::new(RegistryState {
                tables: HashMap::new(),
                expirations: VecDeque::new(),
            }),
            notify: Notify::new(),
        })
    }

    /// Register a purchased table; it expires `validity` from now. Wakes
    /// the pruner so the timer covers the new head when the registry was
    /// empty or idle.
    pub fn register(&self, pt: PriceTable) {
        let expiry = Instant::now() + pt.validity();
        let mut state = self.state.write();
        let was_empty = state.tables.is_empty();
        state.tables.insert(pt.uid, pt);
        state.expirations.push_back((pt.uid, expiry));
        drop(state);
        if was_empty {
            self.notify.notify_one();
        }
        tracing::debug!(uid = hex::encode(pt.uid), "registered price table");
    }

    /// Fetch a registered, unexpired table.
    pub fn get(&self, uid: &PriceTableUid) -> Result<PriceTable> {
        self.state
            .read()
            .tables
            .get(uid)
            .copied()
            .ok_or(RhpError::NoPriceTable)
    }

    /// Number of live tables.
    pub fn len(&self) -> usize {
        self.state.read().tables.len()
    }

    /// True when no table is registered.
    pub fn is_empty(&self) -> bool {
        self.state.read().tables.is_empty()
    }

    /// Drive expiry: sleep until the head of the FIFO lapses, prune
    /// every expired entry, and re-arm on the new head. Registration
    /// wakes the loop, so re-arming is race-free against concurrent
    /// registers. Runs until the registry is dropped by every handle.
    pub async fn run(self: Arc<Self>) {
        loop {
            let deadline = self.state.read().expirations.front().map(|(_, t)| *t);
            match deadline {
                None => self.notify.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => self.prune_expired(),
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    /// Remove every entry at the head of the FIFO whose expiry has
    /// passed. Work is O(expired) per firing.
    fn prune_expired(&self) {
        let now = Instant::now();
        let mut state = self.state.write();
        let mut pruned = 0usize;
        while let Some((uid, expiry)) = state.expirations.front().copied() {
            if expiry > now {
                break;
            }
            state.expirations.pop_front();
            state.tables.remove(&uid);
            pruned += 1;
        }
        if pruned > 0 {
            tracing::debug!(pruned, remaining = state.tables.len(), "pruned price tables");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_table(validity_secs: u64) -> PriceTable {
        let settings = HostSettings {
            price_table_validity: Duration::from_secs(validity_secs),
            ..Default::default()
        };
        PriceTable::generate(&settings, 100)
    }

    #[test]
    fn test_generate_assigns_random_uid() {
        let a = test_table(60);
        let b = test_table(60);
        assert_ne!(a.uid, b.uid);
        assert_eq!(a.host_height, 100);
    }

    #[test]
    fn test_cost_composition() {
        let settings = HostSettings {
            base_rpc_price: Currency(7),
            storage_price: Currency(2),
            ingress_price: Currency(3),
            egress_price: Currency(5),
            collateral_per_byte: Currency(1),
            ..Default::default()
        };
        let pt = PriceTable::generate(&settings, 0);
        let sector = SECTOR_SIZE as u128;

        let append = pt.base_cost().add(&pt.append_sector_cost(10));
        assert_eq!(append.base, Currency(7));
        assert_eq!(append.storage, Currency(2 * sector * 10));
        assert_eq!(append.ingress, Currency(3 * sector));
        assert_eq!(append.collateral, Currency(sector * 10));
        assert_eq!(
            append.total(),
            Currency(7 + 2 * sector * 10 + 3 * sector),
            "collateral is not charged to the renter"
        );

        let read = pt.base_cost().add(&pt.read_sector_cost(1000));
        assert_eq!(read.total(), Currency(7 + 5 * 1000));

        let usage = append.to_usage();
        assert_eq!(usage.rpc_revenue, Currency(7));
        assert_eq!(usage.storage_revenue, append.storage);
        assert_eq!(usage.ingress_revenue, append.ingress);
        assert_eq!(usage.risked_collateral, append.collateral);
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = PriceTableRegistry::new();
        let pt = test_table(60);
        registry.register(pt);
        assert_eq!(registry.get(&pt.uid).expect("present"), pt);
        assert!(matches!(
            registry.get(&[0u8; 16]),
            Err(RhpError::NoPriceTable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_expires_head() {
        let registry = PriceTableRegistry::new();
        tokio::spawn(registry.clone().run());

        let pt = test_table(60);
        registry.register(pt);
        // Give the pruner a chance to arm on the new head.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.get(&pt.uid).is_ok());

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(registry.get(&pt.uid).is_ok(), "still within validity");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(
            matches!(registry.get(&pt.uid), Err(RhpError::NoPriceTable)),
            "expired tables must be gone within a pruner cycle"
        );
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruner_rearms_for_later_tables() {
        let registry = PriceTableRegistry::new();
        tokio::spawn(registry.clone().run());

        let first = test_table(30);
        registry.register(first);
        tokio::time::sleep(Duration::from_secs(10)).await;
        let second = test_table(30);
        registry.register(second);

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(matches!(
            registry.get(&first.uid),
            Err(RhpError::NoPriceTable)
        ));
        assert!(registry.get(&second.uid).is_ok(), "second expires later");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(registry.is_empty());
    }
}
