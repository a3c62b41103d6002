//! Per-stream RPC session handler.
//!
//! A session is a loop over one framed stream: read a 16-byte selector,
//! dispatch the RPC, write a response, repeat until the peer hangs up.
//! Payment is metered before (or atomically with) each action; when an
//! action fails after metering, everything but the base cost is
//! returned to the renter. Every settlement runs inside one store
//! transaction so a crash mid-RPC commits payment and action together
//! or not at all.

use std::sync::Arc;

use haven_accounts::AccountManager;
use haven_contracts::{ChainClient, ContractManager, Renewal, Wallet};
use haven_db::{queries, Store};
use haven_storage::SectorIndex;
use haven_types::{
    merkle, CancelToken, Currency, Hash256, HostSettings, TempSector, Usage, SECTOR_SIZE,
};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::messages::{
    AccountPayment, AppendSectorRequest, AppendSectorResponse, FundAccountRequest,
    FundAccountResponse, LatestRevisionRequest, LatestRevisionResponse, Payment,
    ReadSectorRequest, ReadSectorResponse, RenewContractRequest, RenewContractResponse,
    StoreSectorRequest, StoreSectorResponse, RPC_APPEND_SECTOR, RPC_FUND_ACCOUNT,
    RPC_LATEST_REVISION, RPC_READ_SECTOR, RPC_RENEW_CONTRACT, RPC_SCAN_PRICE_TABLE,
    RPC_STORE_SECTOR, RPC_UPDATE_PRICE_TABLE,
};
use crate::pricetable::{PriceTable, PriceTableRegistry};
use crate::wire::{self, Specifier, WireError};
use crate::{Result, RhpError};

/// Shared host state behind one renter session.
pub struct SessionHandler {
    pub store: Arc<Store>,
    pub index: Arc<SectorIndex>,
    pub accounts: Arc<AccountManager>,
    pub contracts: Arc<ContractManager>,
    pub registry: Arc<PriceTableRegistry>,
    pub chain: Arc<dyn ChainClient>,
    pub wallet: Arc<dyn Wallet>,
    pub settings: Arc<RwLock<HostSettings>>,
}

impl SessionHandler {
    /// Serve RPCs on the stream until the peer disconnects. The cancel
    /// token follows the connection lifetime; storage operations check
    /// it between sectors.
    pub async fn serve<S>(&self, mut stream: S, cancel: CancelToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let frame = match wire::read_frame(&mut stream).await {
                Ok(frame) => frame,
                // Disconnect between RPCs is a normal session end.
                Err(WireError::Io(_)) => return Ok(()),
                Err(err) => return Err(err.into()),
            };
            let selector = Specifier::from_slice(&frame)?;
            let result = match selector {
                RPC_SCAN_PRICE_TABLE => self.handle_scan_price_table(&mut stream).await,
                RPC_UPDATE_PRICE_TABLE => self.handle_update_price_table(&mut stream).await,
                RPC_FUND_ACCOUNT => self.handle_fund_account(&mut stream).await,
                RPC_LATEST_REVISION => self.handle_latest_revision(&mut stream).await,
                RPC_APPEND_SECTOR => self.handle_append_sector(&mut stream, &cancel).await,
                RPC_STORE_SECTOR => self.handle_store_sector(&mut stream, &cancel).await,
                RPC_READ_SECTOR => self.handle_read_sector(&mut stream).await,
                RPC_RENEW_CONTRACT => self.handle_renew_contract(&mut stream).await,
                other => {
                    let err = WireError::UnknownRpc(other.to_string());
                    write_err(&mut stream, &err.to_string()).await?;
                    return Err(err.into());
                }
            };
            match result {
                Ok(()) => {}
                // The stream is desynchronized; nothing more can be read.
                Err(RhpError::Wire(err)) => return Err(err.into()),
                Err(err) => {
                    tracing::debug!(rpc = %selector, %err, "rpc failed");
                    write_err(&mut stream, &err.to_string()).await?;
                }
            }
        }
    }

    /// Serve the current price table without registering it. Scans are
    /// free; the table cannot be used for paid RPCs.
    async fn handle_scan_price_table<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let pt = self.generate_price_table();
        write_ok(stream, &pt.encode()).await?;
        Ok(())
    }

    /// Sell a price table: send the proposal, collect payment, register.
    async fn handle_update_price_table<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let pt = self.generate_price_table();
        write_ok(stream, &pt.encode()).await?;

        let payment = Payment::decode(&wire::read_frame(stream).await?)?;
        let cost = pt.update_price_table_cost;
        let usage = Usage {
            rpc_revenue: cost,
            ..Default::default()
        };
        match payment {
            Payment::Account(p) => {
                crate::payment::verify_account_payment(&p, cost, self.chain.tip().height)?;
                self.store.transaction(|tx| {
                    crate::payment::debit_account(
                        tx,
                        &self.accounts,
                        &p,
                        cost,
                        &usage,
                        unix_timestamp(),
                    )
                })?;
            }
            Payment::Contract(p) => {
                self.store.transaction(|tx| {
                    self.contracts
                        .apply_revision(tx, p.revision, p.renter_signature, cost, usage, &[])
                        .map_err(RhpError::from)
                })?;
            }
        }

        self.registry.register(pt);
        write_ok(stream, &[]).await?;
        Ok(())
    }

    /// Credit an account from a contract payment. The deposit is durable
    /// before the response frame is written.
    async fn handle_fund_account<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let pt = self.read_price_table(stream).await?;
        let req = FundAccountRequest::decode(&wire::read_frame(stream).await?)?;
        let payment = Payment::decode(&wire::read_frame(stream).await?)?;
        let Payment::Contract(p) = payment else {
            return Err(RhpError::InvalidPayment(
                "funding an account requires a contract payment",
            ));
        };

        let total = req
            .deposit
            .checked_add(pt.fund_account_cost)
            .ok_or(RhpError::InvalidPayment("deposit overflows"))?;
        let usage = Usage {
            rpc_revenue: pt.fund_account_cost,
            account_funding: req.deposit,
            ..Default::default()
        };
        let balance = self.store.transaction(|tx| {
            self.contracts
                .apply_revision(tx, p.revision, p.renter_signature, total, usage, &[])?;
            let balance =
                self.accounts
                    .credit(tx, &req.account, req.deposit, p.revision.window_end)?;
            Ok::<_, RhpError>(balance)
        })?;

        write_ok(stream, &FundAccountResponse { balance }.encode()).await?;
        Ok(())
    }

    /// Return the latest stored revision. Free of charge.
    async fn handle_latest_revision<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let req = LatestRevisionRequest::decode(&wire::read_frame(stream).await?)?;
        let contract = self.contracts.contract(&req.contract_id)?;
        let resp = LatestRevisionResponse {
            revision: contract.revision,
            renter_signature: contract.renter_signature,
            host_signature: contract.host_signature,
        };
        write_ok(stream, &resp.encode()).await?;
        Ok(())
    }

    /// Append a sector to a contract: storing it, bumping the revision,
    /// and settling the account payment share one transaction.
    async fn handle_append_sector<S>(&self, stream: &mut S, cancel: &CancelToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let pt = self.read_price_table(stream).await?;
        let payment = Payment::decode(&wire::read_frame(stream).await?)?;
        let Payment::Account(p) = payment else {
            return Err(RhpError::InvalidPayment(
                "appending requires an account payment",
            ));
        };
        let req = AppendSectorRequest::decode(&wire::read_frame(stream).await?)?;
        if req.sector.len() != SECTOR_SIZE {
            return Err(RhpError::BadRequest("sector payload must be exactly 4 MiB"));
        }

        let duration = req.revision.window_end.saturating_sub(pt.host_height);
        let cost = pt.base_cost().add(&pt.append_sector_cost(duration));
        crate::payment::verify_account_payment(&p, cost.total(), self.chain.tip().height)?;

        // The proposed revision may burn at most the advertised
        // collateral out of the host's missed payout.
        let current = self.contracts.contract(&req.revision.contract_id)?;
        let burned = current
            .revision
            .missed_host_payout
            .saturating_sub(req.revision.missed_host_payout);
        if burned > cost.collateral {
            return Err(RhpError::InvalidPayment(
                "revision burns more collateral than advertised",
            ));
        }

        if cancel.is_cancelled() {
            return Err(RhpError::Cancelled);
        }
        let root = merkle::sector_root(&req.sector);
        let mut reservation = self.index.store_sector(root, &req.sector)?;
        let result = self.store.transaction(|tx| {
            crate::payment::debit_account(
                tx,
                &self.accounts,
                &p,
                cost.total(),
                &cost.to_usage(),
                unix_timestamp(),
            )?;
            let host_signature = self.contracts.apply_revision(
                tx,
                req.revision,
                req.renter_signature,
                Currency::ZERO,
                Usage {
                    risked_collateral: cost.collateral,
                    ..Default::default()
                },
                &[root],
            )?;
            reservation.commit(tx)?;
            Ok::<_, RhpError>(host_signature)
        });

        match result {
            Ok(host_signature) => {
                write_ok(stream, &AppendSectorResponse { host_signature }.encode()).await?;
                Ok(())
            }
            Err(err) => {
                // The reservation rolls back on drop; the base cost is
                // retained as the cost of being asked.
                drop(reservation);
                self.charge_base(&p, cost.base);
                Err(err)
            }
        }
    }

    /// Store a sector under a temporary lease.
    async fn handle_store_sector<S>(&self, stream: &mut S, cancel: &CancelToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let pt = self.read_price_table(stream).await?;
        let payment = Payment::decode(&wire::read_frame(stream).await?)?;
        let Payment::Account(p) = payment else {
            return Err(RhpError::InvalidPayment(
                "temporary storage requires an account payment",
            ));
        };
        let req = StoreSectorRequest::decode(&wire::read_frame(stream).await?)?;
        if req.sector.len() != SECTOR_SIZE {
            return Err(RhpError::BadRequest("sector payload must be exactly 4 MiB"));
        }
        if req.duration == 0 || req.duration > pt.max_duration {
            return Err(RhpError::BadRequest("lease duration out of bounds"));
        }

        let cost = pt.base_cost().add(&pt.store_sector_cost(req.duration));
        let height = self.chain.tip().height;
        crate::payment::verify_account_payment(&p, cost.total(), height)?;
        let expiration_height = height + req.duration;

        if cancel.is_cancelled() {
            return Err(RhpError::Cancelled);
        }
        let root = merkle::sector_root(&req.sector);
        let mut reservation = self.index.store_sector(root, &req.sector)?;
        let result = self.store.transaction(|tx| {
            crate::payment::debit_account(
                tx,
                &self.accounts,
                &p,
                cost.total(),
                &cost.to_usage(),
                unix_timestamp(),
            )?;
            queries::sectors::insert_temp(
                tx,
                &[TempSector {
                    root,
                    expiration_height,
                }],
            )?;
            reservation.commit(tx)?;
            Ok::<_, RhpError>(())
        });

        match result {
            Ok(()) => {
                let resp = StoreSectorResponse {
                    root,
                    expiration_height,
                };
                write_ok(stream, &resp.encode()).await?;
                Ok(())
            }
            Err(err) => {
                drop(reservation);
                self.charge_base(&p, cost.base);
                Err(err)
            }
        }
    }

    /// Read a byte range out of a stored sector. The base cost settles
    /// before the read; the bandwidth component settles only once the
    /// data is in hand, so a failed read costs the base alone.
    async fn handle_read_sector<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let pt = self.read_price_table(stream).await?;
        let payment = Payment::decode(&wire::read_frame(stream).await?)?;
        let Payment::Account(p) = payment else {
            return Err(RhpError::InvalidPayment("reading requires an account payment"));
        };
        let req = ReadSectorRequest::decode(&wire::read_frame(stream).await?)?;
        let end = req
            .offset
            .checked_add(req.length)
            .filter(|end| *end <= SECTOR_SIZE as u64)
            .ok_or(RhpError::BadRequest("read range out of bounds"))?;

        let cost = pt.base_cost().add(&pt.read_sector_cost(req.length));
        crate::payment::verify_account_payment(&p, cost.total(), self.chain.tip().height)?;

        self.store.transaction(|tx| {
            crate::payment::debit_account(
                tx,
                &self.accounts,
                &p,
                cost.base,
                &Usage {
                    rpc_revenue: cost.base,
                    ..Default::default()
                },
                unix_timestamp(),
            )
        })?;

        let data = self.index.read_sector(&req.root)?;

        let remainder = cost.total().saturating_sub(cost.base);
        self.store.transaction(|tx| {
            crate::payment::debit_account(
                tx,
                &self.accounts,
                &p,
                remainder,
                &Usage {
                    egress_revenue: cost.egress,
                    ..Default::default()
                },
                unix_timestamp(),
            )
        })?;

        let resp = ReadSectorResponse {
            data: data[req.offset as usize..end as usize].to_vec(),
        };
        write_ok(stream, &resp.encode()).await?;
        Ok(())
    }

    /// Renew a contract: clear the old one, form its successor carrying
    /// the sector set forward, and announce the formation on chain.
    async fn handle_renew_contract<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let pt = self.read_price_table(stream).await?;
        let req = RenewContractRequest::decode(&wire::read_frame(stream).await?)?;

        let height = self.chain.tip().height;
        let duration = req.new_revision.window_end.saturating_sub(height);
        if duration > pt.max_duration {
            return Err(RhpError::BadRequest("renewal exceeds maximum duration"));
        }

        let renewal = Renewal {
            final_revision: req.final_revision,
            final_renter_signature: req.final_renter_signature,
            new_revision: req.new_revision,
            new_renter_signature: req.new_renter_signature,
            renter_key: req.renter_key,
            additional_collateral: req.additional_collateral,
        };
        let (new_contract, final_host_signature) = self
            .store
            .transaction(|tx| self.contracts.renew(tx, &renewal).map_err(RhpError::from))?;

        // Announce the formation. Failure here is not fatal: the
        // renewal is committed and the renter may rebroadcast.
        let txn = formation_transaction(&renewal, &new_contract.host_signature);
        let digest = Hash256(*blake3::hash(&txn).as_bytes());
        let wallet_signature = self.wallet.sign(&digest);
        let mut announced = txn;
        announced.extend_from_slice(wallet_signature.as_bytes());
        if let Err(err) = self.wallet.broadcast(&announced) {
            tracing::warn!(contract = %new_contract.id(), error = %err, "renewal broadcast failed");
        }

        let resp = RenewContractResponse {
            final_host_signature,
            new_host_signature: new_contract.host_signature,
        };
        write_ok(stream, &resp.encode()).await?;
        Ok(())
    }

    /// Read a price-table UID frame and resolve it in the registry.
    async fn read_price_table<S>(&self, stream: &mut S) -> Result<PriceTable>
    where
        S: AsyncRead + Unpin,
    {
        let frame = wire::read_frame(stream).await?;
        let uid = Specifier::from_slice(&frame)?.0;
        self.registry.get(&uid)
    }

    fn generate_price_table(&self) -> PriceTable {
        let settings = self.settings.read().clone();
        PriceTable::generate(&settings, self.chain.tip().height)
    }

    /// After a failed action, keep the base cost. Best effort: the
    /// account row is left alone if even the base cannot be covered.
    fn charge_base(&self, payment: &AccountPayment, base: Currency) {
        if base.is_zero() {
            return;
        }
        let usage = Usage {
            rpc_revenue: base,
            ..Default::default()
        };
        let result = self.store.transaction(|tx| {
            crate::payment::debit_account(
                tx,
                &self.accounts,
                payment,
                base,
                &usage,
                unix_timestamp(),
            )
        });
        if let Err(err) = result {
            tracing::debug!(account = %payment.account, %err, "base charge not collected");
        }
    }
}

impl std::fmt::Debug for SessionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandler").finish_non_exhaustive()
    }
}

/// Encode the renewal formation transaction body: both revisions plus
/// the host countersignature on the new one.
fn formation_transaction(renewal: &Renewal, new_host_signature: &haven_types::Signature) -> Vec<u8> {
    let mut txn = renewal.final_revision.signing_bytes();
    txn.extend_from_slice(renewal.final_renter_signature.as_bytes());
    txn.extend_from_slice(&renewal.new_revision.signing_bytes());
    txn.extend_from_slice(renewal.new_renter_signature.as_bytes());
    txn.extend_from_slice(new_host_signature.as_bytes());
    txn
}

/// Write a success response: status byte `0`, then the payload.
pub async fn write_ok<S>(stream: &mut S, payload: &[u8]) -> std::result::Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(0);
    frame.extend_from_slice(payload);
    wire::write_frame(stream, &frame).await
}

/// Write an error response: status byte `1`, then the message.
pub async fn write_err<S>(stream: &mut S, message: &str) -> std::result::Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(1 + 8 + message.len());
    frame.push(1);
    let mut enc = wire::Encoder::new();
    enc.write_bytes(message.as_bytes());
    frame.extend_from_slice(&enc.finish());
    wire::write_frame(stream, &frame).await
}

/// Client-side: read a response frame, surfacing a reported error as
/// [`RhpError::Remote`].
pub async fn read_response<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let frame = wire::read_frame(stream).await?;
    let mut dec = wire::Decoder::new(&frame);
    match dec.read_u8()? {
        0 => Ok(frame[1..].to_vec()),
        1 => {
            let message = dec.read_bytes(4096)?;
            Err(RhpError::Remote(
                String::from_utf8_lossy(&message).into_owned(),
            ))
        }
        _ => Err(WireError::InvalidField("response status").into()),
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
