//! Contract rows and their sector sets.

use haven_types::{
    Contract, ContractId, ContractStatus, Hash256, Revision, Signature, Usage,
};
use rusqlite::{Connection, OptionalExtension, Row};

use crate::queries::{
    column_currency, column_hash, column_opt_hash, column_pubkey, column_signature,
};
use crate::{Error, Result};

const CONTRACT_COLUMNS: &str = "contract_id, renter_key, revision_number, filesize, \
     file_merkle_root, window_start, window_end, valid_renter_payout, valid_host_payout, \
     missed_renter_payout, missed_host_payout, host_signature, renter_signature, status, \
     locked_collateral, rpc_revenue, storage_revenue, ingress_revenue, egress_revenue, \
     registry_revenue, account_funding, risked_collateral, renewed_from, renewed_to, \
     negotiation_height, formation_confirmed";

fn contract_from_row(row: &Row<'_>) -> rusqlite::Result<(Contract, String)> {
    let revision = Revision {
        contract_id: ContractId(column_hash(row, 0)?),
        revision_number: row.get::<_, i64>(2)? as u64,
        filesize: row.get::<_, i64>(3)? as u64,
        file_merkle_root: column_hash(row, 4)?,
        window_start: row.get::<_, i64>(5)? as u64,
        window_end: row.get::<_, i64>(6)? as u64,
        valid_renter_payout: column_currency(row, 7)?,
        valid_host_payout: column_currency(row, 8)?,
        missed_renter_payout: column_currency(row, 9)?,
        missed_host_payout: column_currency(row, 10)?,
    };
    let usage = Usage {
        rpc_revenue: column_currency(row, 15)?,
        storage_revenue: column_currency(row, 16)?,
        ingress_revenue: column_currency(row, 17)?,
        egress_revenue: column_currency(row, 18)?,
        registry_revenue: column_currency(row, 19)?,
        account_funding: column_currency(row, 20)?,
        risked_collateral: column_currency(row, 21)?,
    };
    let status: String = row.get(13)?;
    let contract = Contract {
        revision,
        renter_key: column_pubkey(row, 1)?,
        host_signature: column_signature(row, 11)?,
        renter_signature: column_signature(row, 12)?,
        status: ContractStatus::Pending,
        locked_collateral: column_currency(row, 14)?,
        usage,
        renewed_from: column_opt_hash(row, 22)?.map(ContractId),
        renewed_to: column_opt_hash(row, 23)?.map(ContractId),
        negotiation_height: row.get::<_, i64>(24)? as u64,
        formation_confirmed: row.get(25)?,
    };
    Ok((contract, status))
}

fn parse_contract(pair: (Contract, String)) -> Result<Contract> {
    let (mut contract, status) = pair;
    contract.status = ContractStatus::parse(&status)
        .ok_or_else(|| Error::InvalidRow(format!("unknown contract status {status:?}")))?;
    Ok(contract)
}

/// Insert a new contract.
pub fn insert(conn: &Connection, contract: &Contract) -> Result<()> {
    let r = &contract.revision;
    let u = &contract.usage;
    conn.execute(
        "INSERT INTO contracts (contract_id, renter_key, revision_number, filesize, \
         file_merkle_root, window_start, window_end, valid_renter_payout, valid_host_payout, \
         missed_renter_payout, missed_host_payout, host_signature, renter_signature, status, \
         locked_collateral, rpc_revenue, storage_revenue, ingress_revenue, egress_revenue, \
         registry_revenue, account_funding, risked_collateral, renewed_from, renewed_to, \
         negotiation_height, formation_confirmed)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,\
         ?21,?22,?23,?24,?25,?26)",
        rusqlite::params![
            r.contract_id.as_bytes().as_slice(),
            contract.renter_key.as_bytes().as_slice(),
            r.revision_number as i64,
            r.filesize as i64,
            r.file_merkle_root.as_bytes().as_slice(),
            r.window_start as i64,
            r.window_end as i64,
            r.valid_renter_payout.to_be_bytes().as_slice(),
            r.valid_host_payout.to_be_bytes().as_slice(),
            r.missed_renter_payout.to_be_bytes().as_slice(),
            r.missed_host_payout.to_be_bytes().as_slice(),
            contract.host_signature.as_bytes().as_slice(),
            contract.renter_signature.as_bytes().as_slice(),
            contract.status.as_str(),
            contract.locked_collateral.to_be_bytes().as_slice(),
            u.rpc_revenue.to_be_bytes().as_slice(),
            u.storage_revenue.to_be_bytes().as_slice(),
            u.ingress_revenue.to_be_bytes().as_slice(),
            u.egress_revenue.to_be_bytes().as_slice(),
            u.registry_revenue.to_be_bytes().as_slice(),
            u.account_funding.to_be_bytes().as_slice(),
            u.risked_collateral.to_be_bytes().as_slice(),
            contract.renewed_from.map(|id| id.0 .0.to_vec()),
            contract.renewed_to.map(|id| id.0 .0.to_vec()),
            contract.negotiation_height as i64,
            contract.formation_confirmed,
        ],
    )?;
    Ok(())
}

/// Fetch a contract by ID.
pub fn get(conn: &Connection, id: &ContractId) -> Result<Contract> {
    let pair = conn
        .query_row(
            &format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE contract_id=?1"),
            [id.as_bytes().as_slice()],
            contract_from_row,
        )
        .optional()?
        .ok_or(Error::NotFound("contract"))?;
    parse_contract(pair)
}

/// Replace the stored revision and both signatures.
pub fn update_revision(
    conn: &Connection,
    revision: &Revision,
    renter_signature: &Signature,
    host_signature: &Signature,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE contracts SET revision_number=?1, filesize=?2, file_merkle_root=?3, \
         window_start=?4, window_end=?5, valid_renter_payout=?6, valid_host_payout=?7, \
         missed_renter_payout=?8, missed_host_payout=?9, renter_signature=?10, \
         host_signature=?11 WHERE contract_id=?12",
        rusqlite::params![
            revision.revision_number as i64,
            revision.filesize as i64,
            revision.file_merkle_root.as_bytes().as_slice(),
            revision.window_start as i64,
            revision.window_end as i64,
            revision.valid_renter_payout.to_be_bytes().as_slice(),
            revision.valid_host_payout.to_be_bytes().as_slice(),
            revision.missed_renter_payout.to_be_bytes().as_slice(),
            revision.missed_host_payout.to_be_bytes().as_slice(),
            renter_signature.as_bytes().as_slice(),
            host_signature.as_bytes().as_slice(),
            revision.contract_id.as_bytes().as_slice(),
        ],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("contract"));
    }
    Ok(())
}

/// Accumulate usage onto a contract.
pub fn add_usage(conn: &Connection, id: &ContractId, delta: &Usage) -> Result<()> {
    let contract = get(conn, id)?;
    let usage = contract
        .usage
        .checked_add(delta)
        .ok_or_else(|| Error::InvalidRow("contract usage overflow".into()))?;
    conn.execute(
        "UPDATE contracts SET rpc_revenue=?1, storage_revenue=?2, ingress_revenue=?3, \
         egress_revenue=?4, registry_revenue=?5, account_funding=?6, risked_collateral=?7 \
         WHERE contract_id=?8",
        rusqlite::params![
            usage.rpc_revenue.to_be_bytes().as_slice(),
            usage.storage_revenue.to_be_bytes().as_slice(),
            usage.ingress_revenue.to_be_bytes().as_slice(),
            usage.egress_revenue.to_be_bytes().as_slice(),
            usage.registry_revenue.to_be_bytes().as_slice(),
            usage.account_funding.to_be_bytes().as_slice(),
            usage.risked_collateral.to_be_bytes().as_slice(),
            id.as_bytes().as_slice(),
        ],
    )?;
    Ok(())
}

/// Append sector roots to a contract's ordered set.
pub fn append_roots(conn: &Connection, id: &ContractId, roots: &[Hash256]) -> Result<()> {
    let start = count_roots(conn, id)?;
    let mut stmt = conn.prepare(
        "INSERT INTO contract_sector_roots (contract_id, root_index, sector_root)
         VALUES (?1, ?2, ?3)",
    )?;
    for (offset, root) in roots.iter().enumerate() {
        stmt.execute(rusqlite::params![
            id.as_bytes().as_slice(),
            (start + offset as u64) as i64,
            root.as_bytes().as_slice()
        ])?;
    }
    Ok(())
}

/// The contract's ordered sector roots.
pub fn roots(conn: &Connection, id: &ContractId) -> Result<Vec<Hash256>> {
    let mut stmt = conn.prepare(
        "SELECT sector_root FROM contract_sector_roots
         WHERE contract_id=?1 ORDER BY root_index",
    )?;
    let rows = stmt
        .query_map([id.as_bytes().as_slice()], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|b| Hash256::from_slice(&b).map_err(Error::from))
        .collect()
}

/// Number of sector roots in the contract's set.
pub fn count_roots(conn: &Connection, id: &ContractId) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM contract_sector_roots WHERE contract_id=?1",
        [id.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(count as u64)
}

/// Copy the ordered sector set of one contract onto another (renewal).
pub fn copy_roots(conn: &Connection, from: &ContractId, to: &ContractId) -> Result<u64> {
    let copied = conn.execute(
        "INSERT INTO contract_sector_roots (contract_id, root_index, sector_root)
         SELECT ?1, root_index, sector_root FROM contract_sector_roots
         WHERE contract_id=?2",
        rusqlite::params![to.as_bytes().as_slice(), from.as_bytes().as_slice()],
    )?;
    Ok(copied as u64)
}

/// Link a renewal pair: the old contract's `renewed_to` and the new
/// contract's `renewed_from`.
pub fn set_renewed(conn: &Connection, old: &ContractId, new: &ContractId) -> Result<()> {
    let updated = conn.execute(
        "UPDATE contracts SET renewed_to=?1 WHERE contract_id=?2",
        rusqlite::params![new.as_bytes().as_slice(), old.as_bytes().as_slice()],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("contract"));
    }
    conn.execute(
        "UPDATE contracts SET renewed_from=?1 WHERE contract_id=?2",
        rusqlite::params![old.as_bytes().as_slice(), new.as_bytes().as_slice()],
    )?;
    Ok(())
}

/// Update lifecycle status.
pub fn set_status(conn: &Connection, id: &ContractId, status: ContractStatus) -> Result<()> {
    let updated = conn.execute(
        "UPDATE contracts SET status=?1 WHERE contract_id=?2",
        rusqlite::params![status.as_str(), id.as_bytes().as_slice()],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("contract"));
    }
    Ok(())
}

/// Record that formation was observed on chain.
pub fn set_formation_confirmed(conn: &Connection, id: &ContractId) -> Result<()> {
    let updated = conn.execute(
        "UPDATE contracts SET formation_confirmed=1 WHERE contract_id=?1",
        [id.as_bytes().as_slice()],
    )?;
    if updated == 0 {
        return Err(Error::NotFound("contract"));
    }
    Ok(())
}

/// IDs of contracts in a given status whose proof window ended at or
/// before `height`.
pub fn expired(conn: &Connection, status: ContractStatus, height: u64) -> Result<Vec<ContractId>> {
    let mut stmt = conn.prepare(
        "SELECT contract_id FROM contracts WHERE status=?1 AND window_end <= ?2",
    )?;
    let rows = stmt
        .query_map(
            rusqlite::params![status.as_str(), height as i64],
            |row| row.get::<_, Vec<u8>>(0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|b| Ok(ContractId(Hash256::from_slice(&b)?)))
        .collect()
}

/// IDs of contracts in a given status.
pub fn by_status(conn: &Connection, status: ContractStatus) -> Result<Vec<ContractId>> {
    let mut stmt = conn.prepare("SELECT contract_id FROM contracts WHERE status=?1")?;
    let rows = stmt
        .query_map([status.as_str()], |row| row.get::<_, Vec<u8>>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter()
        .map(|b| Ok(ContractId(Hash256::from_slice(&b)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;
    use haven_types::{Currency, PublicKey};

    fn test_contract(id: u8) -> Contract {
        Contract {
            revision: Revision {
                contract_id: ContractId(Hash256([id; 32])),
                revision_number: 1,
                filesize: 0,
                file_merkle_root: Hash256::ZERO,
                window_start: 100,
                window_end: 200,
                valid_renter_payout: Currency(1000),
                valid_host_payout: Currency(500),
                missed_renter_payout: Currency(1000),
                missed_host_payout: Currency(400),
            },
            renter_key: PublicKey([id; 32]),
            host_signature: Signature([1u8; 64]),
            renter_signature: Signature([2u8; 64]),
            status: ContractStatus::Pending,
            locked_collateral: Currency(5000),
            usage: Usage::default(),
            renewed_from: None,
            renewed_to: None,
            negotiation_height: 90,
            formation_confirmed: false,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let store = Store::open_memory().expect("open");
        let contract = test_contract(1);
        store
            .transaction(|tx| insert(tx, &contract))
            .expect("insert");
        let loaded = store.read(|c| get(c, &contract.id())).expect("get");
        assert_eq!(loaded.revision, contract.revision);
        assert_eq!(loaded.status, ContractStatus::Pending);
        assert_eq!(loaded.locked_collateral, Currency(5000));
        assert_eq!(loaded.renewed_from, None);
    }

    #[test]
    fn test_get_missing() {
        let store = Store::open_memory().expect("open");
        assert!(matches!(
            store.read(|c| get(c, &ContractId(Hash256([9u8; 32])))),
            Err(Error::NotFound("contract"))
        ));
    }

    #[test]
    fn test_update_revision() {
        let store = Store::open_memory().expect("open");
        let contract = test_contract(1);
        store.transaction(|tx| insert(tx, &contract)).expect("insert");

        let mut revision = contract.revision;
        revision.revision_number = 2;
        revision.filesize = haven_types::SECTOR_SIZE as u64;
        store
            .transaction(|tx| {
                update_revision(tx, &revision, &Signature([3u8; 64]), &Signature([4u8; 64]))
            })
            .expect("update");

        let loaded = store.read(|c| get(c, &contract.id())).expect("get");
        assert_eq!(loaded.revision.revision_number, 2);
        assert_eq!(loaded.renter_signature, Signature([3u8; 64]));
        assert_eq!(loaded.host_signature, Signature([4u8; 64]));
    }

    #[test]
    fn test_usage_accumulates() {
        let store = Store::open_memory().expect("open");
        let contract = test_contract(1);
        store.transaction(|tx| insert(tx, &contract)).expect("insert");

        let delta = Usage {
            rpc_revenue: Currency(10),
            storage_revenue: Currency(20),
            ..Default::default()
        };
        store
            .transaction(|tx| {
                add_usage(tx, &contract.id(), &delta)?;
                add_usage(tx, &contract.id(), &delta)
            })
            .expect("usage");

        let loaded = store.read(|c| get(c, &contract.id())).expect("get");
        assert_eq!(loaded.usage.rpc_revenue, Currency(20));
        assert_eq!(loaded.usage.storage_revenue, Currency(40));
    }

    #[test]
    fn test_roots_ordering_and_copy() {
        let store = Store::open_memory().expect("open");
        let a = test_contract(1);
        let b = test_contract(2);
        store
            .transaction(|tx| {
                insert(tx, &a)?;
                insert(tx, &b)
            })
            .expect("insert");

        let set: Vec<Hash256> = (10..13u8).map(|i| Hash256([i; 32])).collect();
        store
            .transaction(|tx| {
                append_roots(tx, &a.id(), &set[..2])?;
                append_roots(tx, &a.id(), &set[2..])
            })
            .expect("append");

        assert_eq!(store.read(|c| roots(c, &a.id())).expect("roots"), set);
        assert_eq!(store.read(|c| count_roots(c, &a.id())).expect("count"), 3);

        let copied = store
            .transaction(|tx| copy_roots(tx, &a.id(), &b.id()))
            .expect("copy");
        assert_eq!(copied, 3);
        assert_eq!(store.read(|c| roots(c, &b.id())).expect("roots"), set);
    }

    #[test]
    fn test_renewal_links() {
        let store = Store::open_memory().expect("open");
        let old = test_contract(1);
        let new = test_contract(2);
        store
            .transaction(|tx| {
                insert(tx, &old)?;
                insert(tx, &new)?;
                set_renewed(tx, &old.id(), &new.id())
            })
            .expect("setup");

        let old_loaded = store.read(|c| get(c, &old.id())).expect("old");
        let new_loaded = store.read(|c| get(c, &new.id())).expect("new");
        assert_eq!(old_loaded.renewed_to, Some(new.id()));
        assert_eq!(new_loaded.renewed_from, Some(old.id()));
    }

    #[test]
    fn test_expired_by_status() {
        let store = Store::open_memory().expect("open");
        let mut active = test_contract(1);
        active.status = ContractStatus::Active;
        let pending = test_contract(2);
        store
            .transaction(|tx| {
                insert(tx, &active)?;
                insert(tx, &pending)
            })
            .expect("insert");

        let hits = store
            .read(|c| expired(c, ContractStatus::Active, 200))
            .expect("expired");
        assert_eq!(hits, vec![active.id()]);
        let misses = store
            .read(|c| expired(c, ContractStatus::Active, 199))
            .expect("expired");
        assert!(misses.is_empty());
    }
}
