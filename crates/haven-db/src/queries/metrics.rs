//! Hour-bucketed host stats and the aggregate metrics snapshot.

use haven_types::{ContractStatus, Currency};
use rusqlite::{Connection, OptionalExtension};

use crate::queries::{accounts, column_currency, sectors};
use crate::{Error, Result};

/// Seconds per stats bucket.
const PERIOD_SECS: u64 = 3600;

/// Stat names for revenue categories.
pub mod stat {
    pub const RPC_REVENUE: &str = "rpc_revenue";
    pub const STORAGE_REVENUE: &str = "storage_revenue";
    pub const INGRESS_REVENUE: &str = "ingress_revenue";
    pub const EGRESS_REVENUE: &str = "egress_revenue";
    pub const REGISTRY_REVENUE: &str = "registry_revenue";
    pub const ACCOUNT_FUNDING: &str = "account_funding";
}

/// Round a timestamp down to its bucket start.
pub fn period_start(timestamp: u64) -> u64 {
    timestamp - timestamp % PERIOD_SECS
}

/// Add `delta` to a stat's bucket for the given timestamp.
pub fn incr_stat(conn: &Connection, name: &str, timestamp: u64, delta: Currency) -> Result<()> {
    if delta.is_zero() {
        return Ok(());
    }
    let period = period_start(timestamp);
    let current = conn
        .query_row(
            "SELECT value FROM host_stats WHERE stat=?1 AND period_start=?2",
            rusqlite::params![name, period as i64],
            |row| column_currency(row, 0),
        )
        .optional()?
        .unwrap_or(Currency::ZERO);
    let next = current
        .checked_add(delta)
        .ok_or_else(|| Error::InvalidRow(format!("stat {name} overflow")))?;
    conn.execute(
        "INSERT INTO host_stats (stat, period_start, value) VALUES (?1, ?2, ?3)
         ON CONFLICT(stat, period_start) DO UPDATE SET value=excluded.value",
        rusqlite::params![name, period as i64, next.to_be_bytes().as_slice()],
    )?;
    Ok(())
}

/// Record a usage delta across the matching revenue stats.
pub fn apply_usage(
    conn: &Connection,
    usage: &haven_types::Usage,
    timestamp: u64,
) -> Result<()> {
    incr_stat(conn, stat::RPC_REVENUE, timestamp, usage.rpc_revenue)?;
    incr_stat(conn, stat::STORAGE_REVENUE, timestamp, usage.storage_revenue)?;
    incr_stat(conn, stat::INGRESS_REVENUE, timestamp, usage.ingress_revenue)?;
    incr_stat(conn, stat::EGRESS_REVENUE, timestamp, usage.egress_revenue)?;
    incr_stat(conn, stat::REGISTRY_REVENUE, timestamp, usage.registry_revenue)?;
    incr_stat(conn, stat::ACCOUNT_FUNDING, timestamp, usage.account_funding)?;
    Ok(())
}

/// Sum a stat across all buckets.
pub fn stat_total(conn: &Connection, name: &str) -> Result<Currency> {
    let mut stmt = conn.prepare("SELECT value FROM host_stats WHERE stat=?1")?;
    let values = stmt
        .query_map([name], |row| column_currency(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(values.into_iter().sum())
}

/// Storage occupancy counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StorageMetrics {
    /// Fleet capacity in sectors.
    pub total_sectors: u64,
    /// Occupied slots.
    pub physical_sectors: u64,
    /// Outstanding temporary leases.
    pub temp_sectors: u64,
    /// Sector references held by contracts.
    pub contract_sectors: u64,
}

/// Contract counts by status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContractMetrics {
    pub pending: u64,
    pub active: u64,
    pub successful: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Revenue totals by category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RevenueMetrics {
    pub rpc: Currency,
    pub storage: Currency,
    pub ingress: Currency,
    pub egress: Currency,
    pub registry: Currency,
    pub account_funding: Currency,
}

/// Account totals.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccountMetrics {
    pub count: u64,
    pub balance: Currency,
}

/// Aggregate metrics snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Metrics {
    pub storage: StorageMetrics,
    pub contracts: ContractMetrics,
    pub revenue: RevenueMetrics,
    pub accounts: AccountMetrics,
}

/// Compute the aggregate snapshot.
pub fn snapshot(conn: &Connection, _timestamp: u64) -> Result<Metrics> {
    let total_sectors: i64 = conn.query_row(
        "SELECT COALESCE(SUM(total_sectors), 0) FROM storage_volumes",
        [],
        |row| row.get(0),
    )?;
    let contract_sectors: i64 = conn.query_row(
        "SELECT COUNT(*) FROM contract_sector_roots",
        [],
        |row| row.get(0),
    )?;

    let count_status = |status: ContractStatus| -> Result<u64> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM contracts WHERE status=?1",
            [status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    };

    let (account_count, account_balance) = accounts::totals(conn)?;

    Ok(Metrics {
        storage: StorageMetrics {
            total_sectors: total_sectors as u64,
            physical_sectors: sectors::count_physical(conn)?,
            temp_sectors: sectors::count_temp(conn)?,
            contract_sectors: contract_sectors as u64,
        },
        contracts: ContractMetrics {
            pending: count_status(ContractStatus::Pending)?,
            active: count_status(ContractStatus::Active)?,
            successful: count_status(ContractStatus::Successful)?,
            failed: count_status(ContractStatus::Failed)?,
            rejected: count_status(ContractStatus::Rejected)?,
        },
        revenue: RevenueMetrics {
            rpc: stat_total(conn, stat::RPC_REVENUE)?,
            storage: stat_total(conn, stat::STORAGE_REVENUE)?,
            ingress: stat_total(conn, stat::INGRESS_REVENUE)?,
            egress: stat_total(conn, stat::EGRESS_REVENUE)?,
            registry: stat_total(conn, stat::REGISTRY_REVENUE)?,
            account_funding: stat_total(conn, stat::ACCOUNT_FUNDING)?,
        },
        accounts: AccountMetrics {
            count: account_count,
            balance: account_balance,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn test_incr_stat_accumulates_within_bucket() {
        let store = Store::open_memory().expect("open");
        store
            .transaction(|tx| {
                incr_stat(tx, stat::RPC_REVENUE, 1000, Currency(5))?;
                incr_stat(tx, stat::RPC_REVENUE, 1500, Currency(7))
            })
            .expect("incr");
        let total = store
            .read(|c| stat_total(c, stat::RPC_REVENUE))
            .expect("total");
        assert_eq!(total, Currency(12));
    }

    #[test]
    fn test_incr_stat_separate_buckets() {
        let store = Store::open_memory().expect("open");
        store
            .transaction(|tx| {
                incr_stat(tx, stat::EGRESS_REVENUE, 0, Currency(1))?;
                incr_stat(tx, stat::EGRESS_REVENUE, PERIOD_SECS, Currency(2))
            })
            .expect("incr");
        let buckets: i64 = store
            .read(|c| {
                c.query_row(
                    "SELECT COUNT(*) FROM host_stats WHERE stat=?1",
                    [stat::EGRESS_REVENUE],
                    |r| r.get(0),
                )
                .map_err(Error::from)
            })
            .expect("count");
        assert_eq!(buckets, 2);
        assert_eq!(
            store
                .read(|c| stat_total(c, stat::EGRESS_REVENUE))
                .expect("total"),
            Currency(3)
        );
    }

    #[test]
    fn test_zero_delta_is_noop() {
        let store = Store::open_memory().expect("open");
        store
            .transaction(|tx| incr_stat(tx, stat::STORAGE_REVENUE, 0, Currency::ZERO))
            .expect("incr");
        let rows: i64 = store
            .read(|c| {
                c.query_row("SELECT COUNT(*) FROM host_stats", [], |r| r.get(0))
                    .map_err(Error::from)
            })
            .expect("count");
        assert_eq!(rows, 0);
    }

    #[test]
    fn test_snapshot_empty() {
        let store = Store::open_memory().expect("open");
        let metrics = store.metrics(0).expect("metrics");
        assert_eq!(metrics, Metrics::default());
    }

    #[test]
    fn test_period_start() {
        assert_eq!(period_start(0), 0);
        assert_eq!(period_start(3599), 0);
        assert_eq!(period_start(3600), 3600);
        assert_eq!(period_start(7201), 7200);
    }
}
