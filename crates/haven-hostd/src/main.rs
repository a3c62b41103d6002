//! havend: the haven storage host daemon.
//!
//! Single OS process running a Tokio async runtime. Renters connect
//! over TCP to the RHP listener; the consensus daemon is reached over
//! its Unix socket; everything durable lives in one SQLite database
//! plus the volume files.

mod chain;
mod config;
mod lock;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use haven_accounts::AccountManager;
use haven_contracts::ContractManager;
use haven_db::{queries, Store};
use haven_rhp::{PriceTableRegistry, SessionHandler};
use haven_storage::{SectorIndex, VolumeManager};
use haven_types::{CancelToken, SigningKey};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::chain::{ConsensusClient, SocketWallet};
use crate::config::HostdConfig;
use crate::lock::DataDirLock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("haven=info".parse()?),
        )
        .init();

    info!("havend starting");

    let config = HostdConfig::load()?;
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    // One process per data directory; stale-lock clearing on open
    // depends on it.
    let _lock = DataDirLock::acquire(&data_dir)?;

    let host_key = load_or_create_host_key(&data_dir)?;
    info!(host_key = %host_key.public_key(), "host identity loaded");

    let store = Arc::new(Store::open(&data_dir.join("host.db"))?);
    store.transaction(|tx| queries::settings::set_host_key(tx, &host_key.public_key()))?;

    let settings = Arc::new(parking_lot::RwLock::new(config.host_settings()));
    let consensus_socket = data_dir.join(&config.network.consensus_socket);
    let consensus = Arc::new(ConsensusClient::new(consensus_socket.clone()));
    consensus.poll_tip();

    let volumes = Arc::new(VolumeManager::new(store.clone())?);
    let index = Arc::new(SectorIndex::new(store.clone(), volumes.clone()));
    let accounts = Arc::new(AccountManager::new(store.clone(), settings.clone()));
    let contracts = Arc::new(ContractManager::new(
        store.clone(),
        consensus.clone(),
        settings.clone(),
        host_key,
    ));
    let registry = PriceTableRegistry::new();

    // Garbage-collect data that became prunable during downtime.
    let startup_height = haven_contracts::ChainClient::tip(consensus.as_ref()).height;
    index.expire_temp_sectors(startup_height)?;
    let pruned = index.prune_sectors()?;
    if pruned > 0 {
        info!(pruned, "reclaimed sectors on startup");
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Price-table expiry task.
    let registry_task = tokio::spawn(registry.clone().run());

    // Periodic volume sync.
    let sync_volumes = volumes.clone();
    let sync_interval = Duration::from_secs(config.storage.sync_interval_secs.max(1));
    let mut sync_shutdown = shutdown_tx.subscribe();
    let sync_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sync_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = sync_volumes.sync() {
                        error!(%err, "volume sync failed");
                    }
                }
                _ = sync_shutdown.recv() => return,
            }
        }
    });

    // Chain follower: poll the tip, then expire leases, prune, advance
    // contract lifecycle, and prune stale accounts.
    let chain_consensus = consensus.clone();
    let chain_index = index.clone();
    let chain_contracts = contracts.clone();
    let chain_accounts = accounts.clone();
    let account_ttl = Duration::from_secs(config.storage.account_ttl_days * 24 * 3600);
    let poll_interval = Duration::from_secs(config.network.chain_poll_secs.max(1));
    let mut chain_shutdown = shutdown_tx.subscribe();
    let chain_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(tip) = chain_consensus.poll_tip() else { continue };
                    info!(height = tip.height, "chain tip advanced");
                    if let Err(err) = chain_index.expire_temp_sectors(tip.height) {
                        error!(%err, "temp sector expiry failed");
                    }
                    if let Err(err) = chain_index.prune_sectors() {
                        error!(%err, "sector pruning failed");
                    }
                    if let Err(err) = chain_contracts.process_chain_update(tip) {
                        error!(%err, "contract lifecycle update failed");
                    }
                    let cutoff = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .saturating_sub(account_ttl)
                        .as_secs();
                    if let Err(err) = chain_accounts.prune(cutoff) {
                        error!(%err, "account pruning failed");
                    }
                }
                _ = chain_shutdown.recv() => return,
            }
        }
    });

    // RHP listener.
    let listener = TcpListener::bind(&config.network.rhp_listen).await?;
    info!(addr = %config.network.rhp_listen, "RHP listener ready");
    let handler = Arc::new(SessionHandler {
        store: store.clone(),
        index: index.clone(),
        accounts,
        contracts,
        registry,
        chain: consensus,
        wallet: Arc::new(SocketWallet::new(consensus_socket)),
        settings,
    });

    let mut accept_shutdown = shutdown_tx.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                let handler = handler.clone();
                let mut session_shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move {
                    let cancel = CancelToken::new();
                    let session_cancel = cancel.clone();
                    let serve = handler.serve(socket, cancel);
                    tokio::select! {
                        result = serve => {
                            if let Err(err) = result {
                                warn!(%peer, %err, "session ended with error");
                            }
                        }
                        _ = session_shutdown.recv() => session_cancel.cancel(),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            _ = accept_shutdown.recv() => break,
        }
    }

    let _ = shutdown_tx.send(());
    registry_task.abort();
    let _ = sync_task.await;
    let _ = chain_task.await;
    if let Err(err) = index.volumes().sync() {
        error!(%err, "final volume sync failed");
    }
    info!("havend stopped");
    Ok(())
}

/// Load the host signing key from the data directory, generating one on
/// first run. The key file is created with owner-only permissions.
fn load_or_create_host_key(data_dir: &Path) -> anyhow::Result<SigningKey> {
    use std::os::unix::fs::OpenOptionsExt;

    let path = data_dir.join("host.key");
    if path.exists() {
        let encoded = std::fs::read_to_string(&path)?;
        let bytes = hex::decode(encoded.trim())
            .map_err(|err| anyhow::anyhow!("corrupt host key file: {err}"))?;
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("host key file must hold 32 hex-encoded bytes"))?;
        return Ok(SigningKey::from_bytes(&seed));
    }

    let key = SigningKey::generate();
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&path)?;
    use std::io::Write;
    writeln!(file, "{}", hex::encode(key.to_bytes()))?;
    info!(path = %path.display(), "generated new host key");
    Ok(key)
}
