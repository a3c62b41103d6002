//! End-to-end RPC flows over an in-memory session stream.
//!
//! A renter scans and registers price tables, funds an account from a
//! contract, uploads and downloads sectors, and watches temporary
//! storage lapse, all through the framed wire protocol.

use haven_integration_tests::{random_sector, renter, TestHost};
use haven_rhp::RhpError;
use haven_types::{Currency, HostSettings, SigningKey, SECTOR_SIZE};

fn test_settings() -> HostSettings {
    HostSettings {
        accepting_contracts: true,
        max_account_balance: Currency::coins(100),
        max_collateral: Currency(u128::MAX / 4),
        contract_price: Currency(1_000),
        base_rpc_price: Currency(10),
        storage_price: Currency(2),
        ingress_price: Currency(1),
        egress_price: Currency(3),
        collateral_per_byte: Currency(4),
        renew_contract_price: Currency(500),
        fund_account_price: Currency(20),
        ..Default::default()
    }
}

const RENTER_FUNDS: Currency = Currency(1 << 90);

#[tokio::test]
async fn test_scan_price_table() {
    let host = TestHost::new(4, test_settings());
    let mut stream = host.connect();

    let pt = renter::scan_price_table(&mut stream).await.expect("scan");
    assert_eq!(pt.contract_price, Currency(1_000));
    assert_eq!(pt.base_rpc_cost, Currency(10));
    assert_eq!(pt.write_store_cost, Currency(2));
    assert_eq!(pt.window_size, 144);

    // Scanning does not register: the table cannot be used for paid
    // RPCs.
    assert!(host.registry.get(&pt.uid).is_err());

    // Two scans return distinct UIDs.
    let second = renter::scan_price_table(&mut stream).await.expect("scan");
    assert_ne!(pt.uid, second.uid);
}

#[tokio::test]
async fn test_update_price_table_registers_and_charges_contract() {
    let host = TestHost::new(4, test_settings());
    let renter_key = SigningKey::generate();
    let contract = host.form_contract(&renter_key, RENTER_FUNDS, 1000, 1144);
    let mut tracked = renter::TrackedContract::new(&contract);
    let mut stream = host.connect();

    let pt = renter::update_price_table(&mut stream, &renter_key, &mut tracked)
        .await
        .expect("update price table");
    assert!(host.registry.get(&pt.uid).is_ok(), "table must be registered");

    let stored = host.contracts.contract(&contract.id()).expect("contract");
    assert_eq!(stored.usage.rpc_revenue, pt.update_price_table_cost);
    assert_eq!(stored.revision.revision_number, 2);
    assert_eq!(
        stored.revision.valid_host_payout,
        pt.update_price_table_cost
    );
}

#[tokio::test]
async fn test_fund_account_durable_balance() {
    let host = TestHost::new(4, test_settings());
    let renter_key = SigningKey::generate();
    let account_key = SigningKey::generate();
    let contract = host.form_contract(&renter_key, RENTER_FUNDS, 1000, 1144);
    let mut tracked = renter::TrackedContract::new(&contract);
    let mut stream = host.connect();

    let pt = renter::update_price_table(&mut stream, &renter_key, &mut tracked)
        .await
        .expect("update price table");
    let balance = renter::fund_account(
        &mut stream,
        &pt,
        &renter_key,
        &mut tracked,
        account_key.public_key(),
        Currency(500_000),
    )
    .await
    .expect("fund account");
    assert_eq!(balance, Currency(500_000));
    assert_eq!(
        host.accounts
            .balance(&account_key.public_key())
            .expect("balance"),
        Currency(500_000)
    );

    // The contract absorbed deposit plus the funding fee.
    let stored = host.contracts.contract(&contract.id()).expect("contract");
    assert_eq!(stored.usage.account_funding, Currency(500_000));
    assert_eq!(
        stored.usage.rpc_revenue,
        pt.update_price_table_cost.saturating_add(pt.fund_account_cost)
    );
}

#[tokio::test]
async fn test_fund_account_respects_max_balance() {
    let mut settings = test_settings();
    settings.max_account_balance = Currency(1_000);
    let host = TestHost::new(4, settings);
    let renter_key = SigningKey::generate();
    let account_key = SigningKey::generate();
    let contract = host.form_contract(&renter_key, RENTER_FUNDS, 1000, 1144);
    let mut tracked = renter::TrackedContract::new(&contract);
    let mut stream = host.connect();

    let pt = renter::update_price_table(&mut stream, &renter_key, &mut tracked)
        .await
        .expect("update price table");
    let err = renter::fund_account(
        &mut stream,
        &pt,
        &renter_key,
        &mut tracked,
        account_key.public_key(),
        Currency(2_000),
    )
    .await
    .expect_err("deposit above cap");
    assert!(matches!(err, RhpError::Remote(_)));

    // The rejected deposit must not have moved any money.
    assert_eq!(
        host.accounts
            .balance(&account_key.public_key())
            .expect("balance"),
        Currency::ZERO
    );
    let stored = host.contracts.contract(&contract.id()).expect("contract");
    assert_eq!(stored.usage.account_funding, Currency::ZERO);
    // The renter's tracked revision is stale now; resync.
    let latest = renter::latest_revision(&mut stream, contract.id())
        .await
        .expect("latest revision");
    assert_eq!(latest.revision.revision_number, 2);
}

#[tokio::test]
async fn test_append_and_read_roundtrip() {
    let host = TestHost::new(8, test_settings());
    let renter_key = SigningKey::generate();
    let account_key = SigningKey::generate();
    let contract = host.form_contract(&renter_key, RENTER_FUNDS, 1000, 1144);
    let mut tracked = renter::TrackedContract::new(&contract);
    let mut stream = host.connect();

    let pt = renter::update_price_table(&mut stream, &renter_key, &mut tracked)
        .await
        .expect("update price table");
    renter::fund_account(
        &mut stream,
        &pt,
        &renter_key,
        &mut tracked,
        account_key.public_key(),
        Currency::coins(50),
    )
    .await
    .expect("fund account");

    let (root, sector) = random_sector();
    let resp = renter::append_sector(
        &mut stream,
        &pt,
        &account_key,
        &renter_key,
        &mut tracked,
        &sector,
    )
    .await
    .expect("append sector");

    // The host countersigned the revision we proposed.
    host.contracts
        .host_key()
        .verify(&tracked.revision.signing_bytes(), &resp.host_signature)
        .expect("host signature verifies");

    // The stored contract reflects the appended sector.
    let stored = host.contracts.contract(&contract.id()).expect("contract");
    assert_eq!(stored.revision.filesize, SECTOR_SIZE as u64);
    assert_eq!(
        host.contracts.sector_roots(&contract.id()).expect("roots"),
        vec![root]
    );

    // Download and compare.
    let data = renter::read_sector(&mut stream, &pt, &account_key, root, 0, SECTOR_SIZE as u64)
        .await
        .expect("read sector");
    assert_eq!(data, sector);

    // Partial reads slice the verified sector.
    let head = renter::read_sector(&mut stream, &pt, &account_key, root, 0, 128)
        .await
        .expect("partial read");
    assert_eq!(head, sector[..128]);

    // The account paid exactly the advertised costs.
    let duration = tracked.revision.window_end - pt.host_height;
    let append_cost = pt.base_cost().add(&pt.append_sector_cost(duration)).total();
    let full_read = pt
        .base_cost()
        .add(&pt.read_sector_cost(SECTOR_SIZE as u64))
        .total();
    let head_read = pt.base_cost().add(&pt.read_sector_cost(128)).total();
    let expected = Currency::coins(50)
        .saturating_sub(append_cost)
        .saturating_sub(full_read)
        .saturating_sub(head_read);
    assert_eq!(
        host.accounts
            .balance(&account_key.public_key())
            .expect("balance"),
        expected
    );
}

#[tokio::test]
async fn test_read_unknown_root_charges_base_only() {
    let host = TestHost::new(4, test_settings());
    let renter_key = SigningKey::generate();
    let account_key = SigningKey::generate();
    let contract = host.form_contract(&renter_key, RENTER_FUNDS, 1000, 1144);
    let mut tracked = renter::TrackedContract::new(&contract);
    let mut stream = host.connect();

    let pt = renter::update_price_table(&mut stream, &renter_key, &mut tracked)
        .await
        .expect("update price table");
    renter::fund_account(
        &mut stream,
        &pt,
        &renter_key,
        &mut tracked,
        account_key.public_key(),
        Currency(1_000_000),
    )
    .await
    .expect("fund account");

    let (missing_root, _) = random_sector();
    let err = renter::read_sector(&mut stream, &pt, &account_key, missing_root, 0, 64)
        .await
        .expect_err("unknown root");
    assert!(matches!(err, RhpError::Remote(ref msg) if msg.contains("not found")));

    // Only the base cost was retained.
    assert_eq!(
        host.accounts
            .balance(&account_key.public_key())
            .expect("balance"),
        Currency(1_000_000).saturating_sub(pt.base_rpc_cost)
    );
}

#[tokio::test]
async fn test_store_sector_expires_and_prunes() {
    let host = TestHost::new(4, test_settings());
    let renter_key = SigningKey::generate();
    let account_key = SigningKey::generate();
    let contract = host.form_contract(&renter_key, RENTER_FUNDS, 1000, 1144);
    let mut tracked = renter::TrackedContract::new(&contract);
    let mut stream = host.connect();

    let pt = renter::update_price_table(&mut stream, &renter_key, &mut tracked)
        .await
        .expect("update price table");
    renter::fund_account(
        &mut stream,
        &pt,
        &renter_key,
        &mut tracked,
        account_key.public_key(),
        Currency::coins(10),
    )
    .await
    .expect("fund account");

    let (root, sector) = random_sector();
    let resp = renter::store_sector(&mut stream, &pt, &account_key, 10, &sector)
        .await
        .expect("store sector");
    assert_eq!(resp.root, root);
    assert_eq!(resp.expiration_height, 10);

    // Readable while the lease is live.
    let data = renter::read_sector(&mut stream, &pt, &account_key, root, 0, SECTOR_SIZE as u64)
        .await
        .expect("read before expiry");
    assert_eq!(data, sector);

    // Pruning before expiry leaves the sector alone.
    host.mine_blocks(9);
    renter::read_sector(&mut stream, &pt, &account_key, root, 0, SECTOR_SIZE as u64)
        .await
        .expect("read at height 9");

    // One more block expires the lease and pruning reclaims the slot.
    host.mine_blocks(1);
    let err = renter::read_sector(&mut stream, &pt, &account_key, root, 0, SECTOR_SIZE as u64)
        .await
        .expect_err("pruned root");
    assert!(matches!(err, RhpError::Remote(ref msg) if msg.contains("not found")));
    assert_eq!(host.store.metrics(0).expect("metrics").storage.physical_sectors, 0);
}

#[tokio::test]
async fn test_unregistered_price_table_rejected() {
    let host = TestHost::new(4, test_settings());
    let account_key = SigningKey::generate();
    let mut stream = host.connect();

    // A scanned (free) table is not registered; paid RPCs refuse it.
    let pt = renter::scan_price_table(&mut stream).await.expect("scan");
    let (_, sector) = random_sector();
    let err = renter::store_sector(&mut stream, &pt, &account_key, 10, &sector)
        .await
        .expect_err("unregistered table");
    assert!(matches!(err, RhpError::Remote(ref msg) if msg.contains("no price table")));
}

#[tokio::test]
async fn test_append_rejects_underfunded_account() {
    let host = TestHost::new(4, test_settings());
    let renter_key = SigningKey::generate();
    let account_key = SigningKey::generate();
    let contract = host.form_contract(&renter_key, RENTER_FUNDS, 1000, 1144);
    let mut tracked = renter::TrackedContract::new(&contract);
    let mut stream = host.connect();

    let pt = renter::update_price_table(&mut stream, &renter_key, &mut tracked)
        .await
        .expect("update price table");
    renter::fund_account(
        &mut stream,
        &pt,
        &renter_key,
        &mut tracked,
        account_key.public_key(),
        Currency(5),
    )
    .await
    .expect("fund account");

    let (_, sector) = random_sector();
    let err = renter::append_sector(
        &mut stream,
        &pt,
        &account_key,
        &renter_key,
        &mut tracked,
        &sector,
    )
    .await
    .expect_err("underfunded");
    assert!(matches!(err, RhpError::Remote(ref msg) if msg.contains("insufficient funds")));

    // The failed append must leave the contract untouched.
    let stored = host.contracts.contract(&contract.id()).expect("contract");
    assert_eq!(stored.revision.filesize, 0);
    assert!(host
        .contracts
        .sector_roots(&contract.id())
        .expect("roots")
        .is_empty());
}
