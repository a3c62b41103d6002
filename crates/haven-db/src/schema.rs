//! SQL schema definitions.
//!
//! Currency values are stored as 16-byte big-endian blobs so that blob
//! comparison orders by magnitude. Heights and timestamps are integers;
//! timestamps are Unix epoch seconds.

/// Complete schema for a v1 database.
pub const SCHEMA_V1: &str = r#"
-- ============================================================
-- Singleton settings
-- ============================================================

CREATE TABLE IF NOT EXISTS global_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    db_version INTEGER NOT NULL,
    host_key BLOB
);

-- ============================================================
-- Volumes & sector index
-- ============================================================

CREATE TABLE IF NOT EXISTS storage_volumes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    disk_path TEXT NOT NULL UNIQUE,
    used_sectors INTEGER NOT NULL DEFAULT 0,
    total_sectors INTEGER NOT NULL DEFAULT 0,
    available INTEGER NOT NULL DEFAULT 0,
    read_only INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'creating'
);

-- One row per physical slot. A NULL sector_root marks a free slot;
-- failed_at marks a slot whose payload failed root verification.
CREATE TABLE IF NOT EXISTS volume_sectors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    volume_id INTEGER NOT NULL REFERENCES storage_volumes(id),
    volume_index INTEGER NOT NULL,
    sector_root BLOB UNIQUE,
    failed_at INTEGER,
    UNIQUE (volume_id, volume_index)
);

CREATE INDEX IF NOT EXISTS idx_volume_sectors_free
    ON volume_sectors(volume_id, volume_index) WHERE sector_root IS NULL;
CREATE INDEX IF NOT EXISTS idx_volume_sectors_root
    ON volume_sectors(sector_root) WHERE sector_root IS NOT NULL;

-- One row per outstanding read/write lock on a stored sector.
CREATE TABLE IF NOT EXISTS locked_volume_sectors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    volume_sector_id INTEGER NOT NULL REFERENCES volume_sectors(id)
);

CREATE INDEX IF NOT EXISTS idx_locked_volume_sectors_sector
    ON locked_volume_sectors(volume_sector_id);

-- One row per temporary lease; a root may carry several leases.
CREATE TABLE IF NOT EXISTS temp_storage_sector_roots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sector_root BLOB NOT NULL,
    expiration_height INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_temp_storage_expiration
    ON temp_storage_sector_roots(expiration_height);
CREATE INDEX IF NOT EXISTS idx_temp_storage_root
    ON temp_storage_sector_roots(sector_root);

-- ============================================================
-- Contracts
-- ============================================================

CREATE TABLE IF NOT EXISTS contracts (
    contract_id BLOB PRIMARY KEY,
    renter_key BLOB NOT NULL,
    revision_number INTEGER NOT NULL,
    filesize INTEGER NOT NULL,
    file_merkle_root BLOB NOT NULL,
    window_start INTEGER NOT NULL,
    window_end INTEGER NOT NULL,
    valid_renter_payout BLOB NOT NULL,
    valid_host_payout BLOB NOT NULL,
    missed_renter_payout BLOB NOT NULL,
    missed_host_payout BLOB NOT NULL,
    host_signature BLOB NOT NULL,
    renter_signature BLOB NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    locked_collateral BLOB NOT NULL,
    rpc_revenue BLOB NOT NULL,
    storage_revenue BLOB NOT NULL,
    ingress_revenue BLOB NOT NULL,
    egress_revenue BLOB NOT NULL,
    registry_revenue BLOB NOT NULL,
    account_funding BLOB NOT NULL,
    risked_collateral BLOB NOT NULL,
    renewed_from BLOB,
    renewed_to BLOB,
    negotiation_height INTEGER NOT NULL,
    formation_confirmed INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_contracts_window_end ON contracts(window_end);
CREATE INDEX IF NOT EXISTS idx_contracts_status ON contracts(status);

-- Ordered sector set per contract.
CREATE TABLE IF NOT EXISTS contract_sector_roots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contract_id BLOB NOT NULL REFERENCES contracts(contract_id),
    root_index INTEGER NOT NULL,
    sector_root BLOB NOT NULL,
    UNIQUE (contract_id, root_index)
);

CREATE INDEX IF NOT EXISTS idx_contract_sector_roots_root
    ON contract_sector_roots(sector_root);

-- ============================================================
-- Accounts & stats
-- ============================================================

CREATE TABLE IF NOT EXISTS accounts (
    account_id BLOB PRIMARY KEY,
    balance BLOB NOT NULL,
    expiration_height INTEGER NOT NULL,
    last_used INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accounts_last_used ON accounts(last_used);

-- Hour-bucketed counters; values share the 16-byte big-endian encoding
-- with currency so revenue and counts use one table.
CREATE TABLE IF NOT EXISTS host_stats (
    stat TEXT NOT NULL,
    period_start INTEGER NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (stat, period_start)
);
"#;
