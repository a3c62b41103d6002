//! Test harness for end-to-end flows across the haven workspace.
//!
//! [`TestHost`] wires a complete host out of a temp directory: store,
//! volume fleet, sector index, ledgers, contract manager, price-table
//! registry, and a session handler served over an in-memory duplex
//! stream. [`renter`] holds a minimal client side of the wire protocol
//! so tests can drive real RPC round trips.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use haven_accounts::AccountManager;
use haven_contracts::{ChainClient, ContractManager, Wallet};
use haven_db::Store;
use haven_rhp::{PriceTableRegistry, SessionHandler};
use haven_storage::{SectorIndex, VolumeManager};
use haven_types::{
    merkle, CancelToken, ChainIndex, Contract, ContractId, ContractStatus, Currency, Hash256,
    HostSettings, PublicKey, Revision, Signature, SigningKey, Usage, SECTOR_SIZE,
};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;

/// Chain stub with a manually advanced tip.
#[derive(Default)]
pub struct TestChain {
    height: AtomicU64,
    confirmed: Mutex<HashSet<ContractId>>,
    proven: Mutex<HashSet<ContractId>>,
}

impl TestChain {
    pub fn mine_to(&self, height: u64) {
        self.height.store(height, Ordering::SeqCst);
    }

    pub fn confirm_formation(&self, id: ContractId) {
        self.confirmed.lock().insert(id);
    }

    pub fn confirm_proof(&self, id: ContractId) {
        self.proven.lock().insert(id);
    }
}

impl ChainClient for TestChain {
    fn tip(&self) -> ChainIndex {
        ChainIndex {
            height: self.height.load(Ordering::SeqCst),
            id: Hash256::ZERO,
        }
    }

    fn formation_confirmed(&self, id: &ContractId) -> bool {
        self.confirmed.lock().contains(id)
    }

    fn proof_confirmed(&self, id: &ContractId) -> bool {
        self.proven.lock().contains(id)
    }
}

/// Wallet stub that signs with a throwaway key and records broadcasts.
pub struct TestWallet {
    key: SigningKey,
    pub broadcasts: Mutex<Vec<Vec<u8>>>,
}

impl Default for TestWallet {
    fn default() -> Self {
        TestWallet {
            key: SigningKey::generate(),
            broadcasts: Mutex::new(Vec::new()),
        }
    }
}

impl Wallet for TestWallet {
    fn sign(&self, digest: &Hash256) -> Signature {
        self.key.sign(digest.as_bytes())
    }

    fn broadcast(&self, txn: &[u8]) -> Result<(), String> {
        self.broadcasts.lock().push(txn.to_vec());
        Ok(())
    }
}

/// A complete host over a temp directory.
pub struct TestHost {
    pub dir: tempfile::TempDir,
    pub store: Arc<Store>,
    pub volumes: Arc<VolumeManager>,
    pub index: Arc<SectorIndex>,
    pub accounts: Arc<AccountManager>,
    pub contracts: Arc<ContractManager>,
    pub registry: Arc<PriceTableRegistry>,
    pub chain: Arc<TestChain>,
    pub wallet: Arc<TestWallet>,
    pub settings: Arc<RwLock<HostSettings>>,
    pub handler: Arc<SessionHandler>,
}

impl TestHost {
    /// Stand up a host with one volume of the given capacity.
    pub fn new(volume_sectors: u64, settings: HostSettings) -> TestHost {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(Store::open(&dir.path().join("host.db")).expect("open store"));
        let chain = Arc::new(TestChain::default());
        let wallet = Arc::new(TestWallet::default());
        let settings = Arc::new(RwLock::new(settings));

        let volumes = Arc::new(VolumeManager::new(store.clone()).expect("volume manager"));
        volumes
            .add_volume(
                &dir.path().join("data.vol"),
                volume_sectors,
                false,
                &CancelToken::new(),
            )
            .expect("add volume");
        let index = Arc::new(SectorIndex::new(store.clone(), volumes.clone()));
        let accounts = Arc::new(AccountManager::new(store.clone(), settings.clone()));
        let contracts = Arc::new(ContractManager::new(
            store.clone(),
            chain.clone(),
            settings.clone(),
            SigningKey::generate(),
        ));
        let registry = PriceTableRegistry::new();

        let handler = Arc::new(SessionHandler {
            store: store.clone(),
            index: index.clone(),
            accounts: accounts.clone(),
            contracts: contracts.clone(),
            registry: registry.clone(),
            chain: chain.clone(),
            wallet: wallet.clone(),
            settings: settings.clone(),
        });

        TestHost {
            dir,
            store,
            volumes,
            index,
            accounts,
            contracts,
            registry,
            chain,
            wallet,
            settings,
            handler,
        }
    }

    /// Spawn a session over an in-memory stream and return the renter
    /// end.
    pub fn connect(&self) -> tokio::io::DuplexStream {
        let (renter_end, host_end) = tokio::io::duplex(2 * SECTOR_SIZE);
        let handler = self.handler.clone();
        tokio::spawn(async move {
            let _ = handler.serve(host_end, CancelToken::new()).await;
        });
        renter_end
    }

    /// Advance the chain and run the work the chain follower performs
    /// per tip: lease expiry, pruning, and contract lifecycle.
    pub fn mine_blocks(&self, blocks: u64) {
        let tip = self.chain.tip().height + blocks;
        self.chain.mine_to(tip);
        self.index
            .expire_temp_sectors(tip)
            .expect("expire temp sectors");
        self.index.prune_sectors().expect("prune sectors");
        self.contracts
            .process_chain_update(self.chain.tip())
            .expect("process chain update");
    }

    /// Track a freshly formed, confirmed contract for the given renter.
    pub fn form_contract(
        &self,
        renter: &SigningKey,
        renter_funds: Currency,
        window_start: u64,
        window_end: u64,
    ) -> Contract {
        let mut id = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);
        let revision = Revision {
            contract_id: ContractId(Hash256(id)),
            revision_number: 1,
            filesize: 0,
            file_merkle_root: Hash256::ZERO,
            window_start,
            window_end,
            valid_renter_payout: renter_funds,
            valid_host_payout: Currency::ZERO,
            missed_renter_payout: renter_funds,
            missed_host_payout: Currency::ZERO,
        };
        let contract = Contract {
            renter_signature: renter.sign(&revision.signing_bytes()),
            revision,
            renter_key: renter.public_key(),
            host_signature: Signature::default(),
            status: ContractStatus::Active,
            locked_collateral: Currency::ZERO,
            usage: Usage::default(),
            renewed_from: None,
            renewed_to: None,
            negotiation_height: self.chain.tip().height,
            formation_confirmed: true,
        };
        self.contracts
            .add_contract(contract.clone())
            .expect("add contract");
        contract
    }
}

/// A random sector payload and its root.
pub fn random_sector() -> (Hash256, Vec<u8>) {
    let mut data = vec![0u8; SECTOR_SIZE];
    rand::thread_rng().fill_bytes(&mut data[..256]);
    (merkle::sector_root(&data), data)
}

/// Minimal renter-side protocol client.
pub mod renter {
    use super::*;
    use haven_rhp::messages::{
        AccountPayment, AppendSectorRequest, AppendSectorResponse, ContractPayment,
        FundAccountRequest, FundAccountResponse, LatestRevisionRequest, LatestRevisionResponse,
        Payment, ReadSectorRequest, ReadSectorResponse, RenewContractRequest,
        RenewContractResponse, StoreSectorRequest, StoreSectorResponse, RPC_APPEND_SECTOR,
        RPC_FUND_ACCOUNT, RPC_LATEST_REVISION, RPC_READ_SECTOR, RPC_RENEW_CONTRACT,
        RPC_SCAN_PRICE_TABLE, RPC_STORE_SECTOR, RPC_UPDATE_PRICE_TABLE,
    };
    use haven_rhp::session::read_response;
    use haven_rhp::wire::{write_frame, Specifier};
    use haven_rhp::{PriceTable, Result};
    use tokio::io::{AsyncRead, AsyncWrite};

    /// Renter-tracked contract state: the latest revision it has
    /// co-signed.
    #[derive(Clone, Debug)]
    pub struct TrackedContract {
        pub revision: Revision,
        pub roots: Vec<Hash256>,
    }

    impl TrackedContract {
        pub fn new(contract: &Contract) -> TrackedContract {
            TrackedContract {
                revision: contract.revision,
                roots: Vec::new(),
            }
        }

        /// Next revision paying `amount` to the host.
        fn pay(&self, amount: Currency) -> Revision {
            Revision {
                revision_number: self.revision.revision_number + 1,
                valid_renter_payout: self.revision.valid_renter_payout.saturating_sub(amount),
                valid_host_payout: self.revision.valid_host_payout.saturating_add(amount),
                missed_renter_payout: self.revision.missed_renter_payout.saturating_sub(amount),
                ..self.revision
            }
        }
    }

    /// Build a signed withdrawal authorization.
    pub fn account_payment(
        key: &SigningKey,
        amount: Currency,
        expiry_height: u64,
    ) -> AccountPayment {
        let account = key.public_key();
        let nonce = rand::random::<u64>();
        let digest = AccountPayment::digest(&account, amount, nonce, expiry_height);
        AccountPayment {
            account,
            amount,
            nonce,
            expiry_height,
            signature: key.sign(&digest),
        }
    }

    /// Fetch the free price table.
    pub async fn scan_price_table<S>(stream: &mut S) -> Result<PriceTable>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_frame(stream, &RPC_SCAN_PRICE_TABLE.0).await?;
        let body = read_response(stream).await?;
        Ok(PriceTable::decode(&body)?)
    }

    /// Purchase and register a price table, paying from a contract.
    pub async fn update_price_table<S>(
        stream: &mut S,
        renter: &SigningKey,
        contract: &mut TrackedContract,
    ) -> Result<PriceTable>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_frame(stream, &RPC_UPDATE_PRICE_TABLE.0).await?;
        let proposal = PriceTable::decode(&read_response(stream).await?)?;

        let revision = contract.pay(proposal.update_price_table_cost);
        let payment = Payment::Contract(ContractPayment {
            revision,
            renter_signature: renter.sign(&revision.signing_bytes()),
        });
        write_frame(stream, &payment.encode()).await?;
        read_response(stream).await?;
        contract.revision = revision;
        Ok(proposal)
    }

    /// Fund an account from a contract.
    pub async fn fund_account<S>(
        stream: &mut S,
        pt: &PriceTable,
        renter: &SigningKey,
        contract: &mut TrackedContract,
        account: PublicKey,
        deposit: Currency,
    ) -> Result<Currency>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_frame(stream, &RPC_FUND_ACCOUNT.0).await?;
        write_frame(stream, &Specifier(pt.uid).0).await?;
        write_frame(stream, &FundAccountRequest { account, deposit }.encode()).await?;

        let total = deposit.saturating_add(pt.fund_account_cost);
        let revision = contract.pay(total);
        let payment = Payment::Contract(ContractPayment {
            revision,
            renter_signature: renter.sign(&revision.signing_bytes()),
        });
        write_frame(stream, &payment.encode()).await?;

        let resp = FundAccountResponse::decode(&read_response(stream).await?)?;
        contract.revision = revision;
        Ok(resp.balance)
    }

    /// Fetch the host's latest stored revision.
    pub async fn latest_revision<S>(
        stream: &mut S,
        contract_id: ContractId,
    ) -> Result<LatestRevisionResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_frame(stream, &RPC_LATEST_REVISION.0).await?;
        write_frame(stream, &LatestRevisionRequest { contract_id }.encode()).await?;
        let resp = LatestRevisionResponse::decode(&read_response(stream).await?)?;
        Ok(resp)
    }

    /// Append a sector to a contract, paying from the account key.
    pub async fn append_sector<S>(
        stream: &mut S,
        pt: &PriceTable,
        account_key: &SigningKey,
        renter: &SigningKey,
        contract: &mut TrackedContract,
        sector: &[u8],
    ) -> Result<AppendSectorResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let root = merkle::sector_root(sector);
        let duration = contract.revision.window_end.saturating_sub(pt.host_height);
        let cost = pt.base_cost().add(&pt.append_sector_cost(duration));

        write_frame(stream, &RPC_APPEND_SECTOR.0).await?;
        write_frame(stream, &Specifier(pt.uid).0).await?;
        let payment = account_payment(
            account_key,
            cost.total(),
            contract.revision.window_end,
        );
        write_frame(stream, &Payment::Account(payment).encode()).await?;

        let mut roots = contract.roots.clone();
        roots.push(root);
        let mut revision = contract.pay(Currency::ZERO);
        revision.filesize = roots.len() as u64 * SECTOR_SIZE as u64;
        revision.file_merkle_root = merkle::meta_root(&roots);
        revision.missed_host_payout = revision
            .missed_host_payout
            .saturating_sub(cost.collateral);
        let request = AppendSectorRequest {
            revision,
            renter_signature: renter.sign(&revision.signing_bytes()),
            sector: sector.to_vec(),
        };
        write_frame(stream, &request.encode()).await?;

        let resp = AppendSectorResponse::decode(&read_response(stream).await?)?;
        contract.revision = revision;
        contract.roots = roots;
        Ok(resp)
    }

    /// Store a sector under a temporary lease, paying from the account
    /// key.
    pub async fn store_sector<S>(
        stream: &mut S,
        pt: &PriceTable,
        account_key: &SigningKey,
        duration: u64,
        sector: &[u8],
    ) -> Result<StoreSectorResponse>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cost = pt.base_cost().add(&pt.store_sector_cost(duration));
        write_frame(stream, &RPC_STORE_SECTOR.0).await?;
        write_frame(stream, &Specifier(pt.uid).0).await?;
        let payment = account_payment(account_key, cost.total(), pt.host_height + duration);
        write_frame(stream, &Payment::Account(payment).encode()).await?;
        write_frame(
            stream,
            &StoreSectorRequest {
                duration,
                sector: sector.to_vec(),
            }
            .encode(),
        )
        .await?;
        let resp = StoreSectorResponse::decode(&read_response(stream).await?)?;
        Ok(resp)
    }

    /// Read a byte range of a stored sector, paying from the account
    /// key.
    pub async fn read_sector<S>(
        stream: &mut S,
        pt: &PriceTable,
        account_key: &SigningKey,
        root: Hash256,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let cost = pt.base_cost().add(&pt.read_sector_cost(length));
        write_frame(stream, &RPC_READ_SECTOR.0).await?;
        write_frame(stream, &Specifier(pt.uid).0).await?;
        let payment = account_payment(account_key, cost.total(), pt.host_height + 1000);
        write_frame(stream, &Payment::Account(payment).encode()).await?;
        write_frame(
            stream,
            &ReadSectorRequest {
                root,
                offset,
                length,
            }
            .encode(),
        )
        .await?;
        let resp = ReadSectorResponse::decode(&read_response(stream).await?)?;
        Ok(resp.data)
    }

    /// Renew a contract, extending its window by `extension` blocks.
    #[allow(clippy::too_many_arguments)]
    pub async fn renew_contract<S>(
        stream: &mut S,
        pt: &PriceTable,
        renter: &SigningKey,
        contract: &mut TrackedContract,
        new_id: ContractId,
        renter_funds: Currency,
        additional_collateral: Currency,
        extension: u64,
    ) -> Result<(RenewContractResponse, Revision)>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let old = contract.revision;
        let filesize = old.filesize;
        let storage_cost = pt
            .renew_contract_cost
            .saturating_add(
                pt.write_store_cost
                    .saturating_mul(filesize)
                    .saturating_mul(extension),
            );
        let risked = pt
            .collateral_cost
            .saturating_mul(filesize)
            .saturating_mul(extension);
        let host_payout = pt.contract_price.saturating_add(storage_cost);

        let final_revision = Revision {
            revision_number: u64::MAX,
            filesize: 0,
            file_merkle_root: Hash256::ZERO,
            ..old
        };
        let new_revision = Revision {
            contract_id: new_id,
            revision_number: 1,
            filesize,
            file_merkle_root: old.file_merkle_root,
            window_start: old.window_start,
            window_end: old.window_end + extension,
            valid_renter_payout: renter_funds,
            valid_host_payout: host_payout,
            missed_renter_payout: renter_funds,
            missed_host_payout: host_payout.saturating_sub(risked),
        };

        write_frame(stream, &RPC_RENEW_CONTRACT.0).await?;
        write_frame(stream, &Specifier(pt.uid).0).await?;
        let request = RenewContractRequest {
            final_revision,
            final_renter_signature: renter.sign(&final_revision.signing_bytes()),
            new_revision,
            new_renter_signature: renter.sign(&new_revision.signing_bytes()),
            renter_key: renter.public_key(),
            additional_collateral,
        };
        write_frame(stream, &request.encode()).await?;

        let resp = RenewContractResponse::decode(&read_response(stream).await?)?;
        contract.revision = final_revision;
        Ok((resp, new_revision))
    }
}
