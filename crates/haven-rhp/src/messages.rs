//! Typed RPC messages.
//!
//! Each RPC begins with a 16-byte selector frame. Requests and
//! responses are single frames encoded with [`wire::Encoder`]; a
//! response frame opens with a status byte, `0` for success and `1` for
//! an error carrying a message string.

use haven_types::{
    ContractId, Currency, Hash256, PublicKey, Revision, Signature, SECTOR_SIZE,
};

use crate::pricetable::PriceTable;
use crate::wire::{Decoder, Encoder, Specifier, WireError};

/// RPC selectors.
pub const RPC_SCAN_PRICE_TABLE: Specifier = Specifier::new("ScanPriceTable");
pub const RPC_UPDATE_PRICE_TABLE: Specifier = Specifier::new("UpdatePriceTable");
pub const RPC_FUND_ACCOUNT: Specifier = Specifier::new("FundAccount");
pub const RPC_LATEST_REVISION: Specifier = Specifier::new("LatestRevision");
pub const RPC_APPEND_SECTOR: Specifier = Specifier::new("AppendSector");
pub const RPC_STORE_SECTOR: Specifier = Specifier::new("StoreSector");
pub const RPC_READ_SECTOR: Specifier = Specifier::new("ReadSector");
pub const RPC_RENEW_CONTRACT: Specifier = Specifier::new("RenewContract");

fn write_revision(enc: &mut Encoder, revision: &Revision) {
    enc.write_hash(&revision.contract_id.0);
    enc.write_u64(revision.revision_number);
    enc.write_u64(revision.filesize);
    enc.write_hash(&revision.file_merkle_root);
    enc.write_u64(revision.window_start);
    enc.write_u64(revision.window_end);
    enc.write_currency(revision.valid_renter_payout);
    enc.write_currency(revision.valid_host_payout);
    enc.write_currency(revision.missed_renter_payout);
    enc.write_currency(revision.missed_host_payout);
}

fn read_revision(dec: &mut Decoder<'_>) -> Result<Revision, WireError> {
    Ok(Revision {
        contract_id: ContractId(dec.read_hash()?),
        revision_number: dec.read_u64()?,
        filesize: dec.read_u64()?,
        file_merkle_root: dec.read_hash()?,
        window_start: dec.read_u64()?,
        window_end: dec.read_u64()?,
        valid_renter_payout: dec.read_currency()?,
        valid_host_payout: dec.read_currency()?,
        missed_renter_payout: dec.read_currency()?,
        missed_host_payout: dec.read_currency()?,
    })
}

impl PriceTable {
    /// Encode for transmission.
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_specifier(&Specifier(self.uid));
        enc.write_u64(self.validity_secs);
        enc.write_u64(self.host_height);
        enc.write_currency(self.update_price_table_cost);
        enc.write_currency(self.contract_price);
        enc.write_currency(self.base_rpc_cost);
        enc.write_currency(self.fund_account_cost);
        enc.write_currency(self.renew_contract_cost);
        enc.write_currency(self.write_store_cost);
        enc.write_currency(self.ingress_cost);
        enc.write_currency(self.egress_cost);
        enc.write_currency(self.collateral_cost);
        enc.write_currency(self.max_collateral);
        enc.write_u64(self.max_duration);
        enc.write_u64(self.window_size);
        enc.finish()
    }

    /// Decode from a frame.
    pub fn decode(frame: &[u8]) -> Result<PriceTable, WireError> {
        let mut dec = Decoder::new(frame);
        let pt = PriceTable {
            uid: dec.read_specifier()?.0,
            validity_secs: dec.read_u64()?,
            host_height: dec.read_u64()?,
            update_price_table_cost: dec.read_currency()?,
            contract_price: dec.read_currency()?,
            base_rpc_cost: dec.read_currency()?,
            fund_account_cost: dec.read_currency()?,
            renew_contract_cost: dec.read_currency()?,
            write_store_cost: dec.read_currency()?,
            ingress_cost: dec.read_currency()?,
            egress_cost: dec.read_currency()?,
            collateral_cost: dec.read_currency()?,
            max_collateral: dec.read_currency()?,
            max_duration: dec.read_u64()?,
            window_size: dec.read_u64()?,
        };
        dec.finish()?;
        Ok(pt)
    }
}

/// Payment drawn from a prefunded account: a signed withdrawal
/// authorization.
#[derive(Clone, Copy, Debug)]
pub struct AccountPayment {
    /// The paying account.
    pub account: PublicKey,
    /// Maximum amount this authorization covers.
    pub amount: Currency,
    /// Random value making the authorization unique.
    pub nonce: u64,
    /// Height after which the authorization is void.
    pub expiry_height: u64,
    /// Account-key signature over the withdrawal digest.
    pub signature: Signature,
}

impl AccountPayment {
    /// The digest the account key signs.
    pub fn digest(account: &PublicKey, amount: Currency, nonce: u64, expiry_height: u64) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"haven/withdrawal");
        hasher.update(account.as_bytes());
        hasher.update(&amount.to_be_bytes());
        hasher.update(&nonce.to_le_bytes());
        hasher.update(&expiry_height.to_le_bytes());
        *hasher.finalize().as_bytes()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_pubkey(&self.account);
        enc.write_currency(self.amount);
        enc.write_u64(self.nonce);
        enc.write_u64(self.expiry_height);
        enc.write_signature(&self.signature);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<AccountPayment, WireError> {
        let mut dec = Decoder::new(frame);
        let payment = AccountPayment {
            account: dec.read_pubkey()?,
            amount: dec.read_currency()?,
            nonce: dec.read_u64()?,
            expiry_height: dec.read_u64()?,
            signature: dec.read_signature()?,
        };
        dec.finish()?;
        Ok(payment)
    }
}

/// Payment carried by a contract revision that shifts payout from
/// renter to host.
#[derive(Clone, Copy, Debug)]
pub struct ContractPayment {
    /// The payment revision.
    pub revision: Revision,
    /// Renter signature over the revision.
    pub renter_signature: Signature,
}

impl ContractPayment {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        write_revision(&mut enc, &self.revision);
        enc.write_signature(&self.renter_signature);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<ContractPayment, WireError> {
        let mut dec = Decoder::new(frame);
        let payment = ContractPayment {
            revision: read_revision(&mut dec)?,
            renter_signature: dec.read_signature()?,
        };
        dec.finish()?;
        Ok(payment)
    }
}

/// Payment frame: a tag byte selecting the source.
#[derive(Clone, Copy, Debug)]
pub enum Payment {
    Account(AccountPayment),
    Contract(ContractPayment),
}

impl Payment {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        match self {
            Payment::Account(p) => {
                enc.write_u8(0);
                enc.write_bytes(&p.encode());
            }
            Payment::Contract(p) => {
                enc.write_u8(1);
                enc.write_bytes(&p.encode());
            }
        }
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<Payment, WireError> {
        let mut dec = Decoder::new(frame);
        let tag = dec.read_u8()?;
        let body = dec.read_bytes(1024)?;
        dec.finish()?;
        match tag {
            0 => Ok(Payment::Account(AccountPayment::decode(&body)?)),
            1 => Ok(Payment::Contract(ContractPayment::decode(&body)?)),
            _ => Err(WireError::InvalidField("payment tag")),
        }
    }
}

/// FundAccount request: credit `deposit` to `account`, paid by contract.
#[derive(Clone, Copy, Debug)]
pub struct FundAccountRequest {
    pub account: PublicKey,
    pub deposit: Currency,
}

impl FundAccountRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_pubkey(&self.account);
        enc.write_currency(self.deposit);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<FundAccountRequest, WireError> {
        let mut dec = Decoder::new(frame);
        let req = FundAccountRequest {
            account: dec.read_pubkey()?,
            deposit: dec.read_currency()?,
        };
        dec.finish()?;
        Ok(req)
    }
}

/// FundAccount response: the balance after the deposit.
#[derive(Clone, Copy, Debug)]
pub struct FundAccountResponse {
    pub balance: Currency,
}

impl FundAccountResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_currency(self.balance);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<FundAccountResponse, WireError> {
        let mut dec = Decoder::new(frame);
        let resp = FundAccountResponse {
            balance: dec.read_currency()?,
        };
        dec.finish()?;
        Ok(resp)
    }
}

/// LatestRevision request.
#[derive(Clone, Copy, Debug)]
pub struct LatestRevisionRequest {
    pub contract_id: ContractId,
}

impl LatestRevisionRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_hash(&self.contract_id.0);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<LatestRevisionRequest, WireError> {
        let mut dec = Decoder::new(frame);
        let req = LatestRevisionRequest {
            contract_id: ContractId(dec.read_hash()?),
        };
        dec.finish()?;
        Ok(req)
    }
}

/// LatestRevision response: the stored revision and both signatures.
#[derive(Clone, Copy, Debug)]
pub struct LatestRevisionResponse {
    pub revision: Revision,
    pub renter_signature: Signature,
    pub host_signature: Signature,
}

impl LatestRevisionResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        write_revision(&mut enc, &self.revision);
        enc.write_signature(&self.renter_signature);
        enc.write_signature(&self.host_signature);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<LatestRevisionResponse, WireError> {
        let mut dec = Decoder::new(frame);
        let resp = LatestRevisionResponse {
            revision: read_revision(&mut dec)?,
            renter_signature: dec.read_signature()?,
            host_signature: dec.read_signature()?,
        };
        dec.finish()?;
        Ok(resp)
    }
}

/// AppendSector request: the proposed revision covering the appended
/// sector, the renter's signature on it, and the payload.
#[derive(Clone, Debug)]
pub struct AppendSectorRequest {
    pub revision: Revision,
    pub renter_signature: Signature,
    pub sector: Vec<u8>,
}

impl AppendSectorRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        write_revision(&mut enc, &self.revision);
        enc.write_signature(&self.renter_signature);
        enc.write_bytes(&self.sector);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<AppendSectorRequest, WireError> {
        let mut dec = Decoder::new(frame);
        let req = AppendSectorRequest {
            revision: read_revision(&mut dec)?,
            renter_signature: dec.read_signature()?,
            sector: dec.read_bytes(SECTOR_SIZE)?,
        };
        dec.finish()?;
        Ok(req)
    }
}

/// AppendSector response: the host countersignature on the revision.
#[derive(Clone, Copy, Debug)]
pub struct AppendSectorResponse {
    pub host_signature: Signature,
}

impl AppendSectorResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_signature(&self.host_signature);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<AppendSectorResponse, WireError> {
        let mut dec = Decoder::new(frame);
        let resp = AppendSectorResponse {
            host_signature: dec.read_signature()?,
        };
        dec.finish()?;
        Ok(resp)
    }
}

/// StoreSector request: hold the payload in temporary storage for
/// `duration` blocks.
#[derive(Clone, Debug)]
pub struct StoreSectorRequest {
    pub duration: u64,
    pub sector: Vec<u8>,
}

impl StoreSectorRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_u64(self.duration);
        enc.write_bytes(&self.sector);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<StoreSectorRequest, WireError> {
        let mut dec = Decoder::new(frame);
        let req = StoreSectorRequest {
            duration: dec.read_u64()?,
            sector: dec.read_bytes(SECTOR_SIZE)?,
        };
        dec.finish()?;
        Ok(req)
    }
}

/// StoreSector response: the stored root and its lease expiry.
#[derive(Clone, Copy, Debug)]
pub struct StoreSectorResponse {
    pub root: Hash256,
    pub expiration_height: u64,
}

impl StoreSectorResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_hash(&self.root);
        enc.write_u64(self.expiration_height);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<StoreSectorResponse, WireError> {
        let mut dec = Decoder::new(frame);
        let resp = StoreSectorResponse {
            root: dec.read_hash()?,
            expiration_height: dec.read_u64()?,
        };
        dec.finish()?;
        Ok(resp)
    }
}

/// ReadSector request.
#[derive(Clone, Copy, Debug)]
pub struct ReadSectorRequest {
    pub root: Hash256,
    pub offset: u64,
    pub length: u64,
}

impl ReadSectorRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_hash(&self.root);
        enc.write_u64(self.offset);
        enc.write_u64(self.length);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<ReadSectorRequest, WireError> {
        let mut dec = Decoder::new(frame);
        let req = ReadSectorRequest {
            root: dec.read_hash()?,
            offset: dec.read_u64()?,
            length: dec.read_u64()?,
        };
        dec.finish()?;
        Ok(req)
    }
}

/// ReadSector response: the requested byte range.
#[derive(Clone, Debug)]
pub struct ReadSectorResponse {
    pub data: Vec<u8>,
}

impl ReadSectorResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_bytes(&self.data);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<ReadSectorResponse, WireError> {
        let mut dec = Decoder::new(frame);
        let resp = ReadSectorResponse {
            data: dec.read_bytes(SECTOR_SIZE)?,
        };
        dec.finish()?;
        Ok(resp)
    }
}

/// RenewContract request: the clearing revision of the old contract and
/// the initial revision of the new one.
#[derive(Clone, Copy, Debug)]
pub struct RenewContractRequest {
    pub final_revision: Revision,
    pub final_renter_signature: Signature,
    pub new_revision: Revision,
    pub new_renter_signature: Signature,
    pub renter_key: PublicKey,
    pub additional_collateral: Currency,
}

impl RenewContractRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        write_revision(&mut enc, &self.final_revision);
        enc.write_signature(&self.final_renter_signature);
        write_revision(&mut enc, &self.new_revision);
        enc.write_signature(&self.new_renter_signature);
        enc.write_pubkey(&self.renter_key);
        enc.write_currency(self.additional_collateral);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<RenewContractRequest, WireError> {
        let mut dec = Decoder::new(frame);
        let req = RenewContractRequest {
            final_revision: read_revision(&mut dec)?,
            final_renter_signature: dec.read_signature()?,
            new_revision: read_revision(&mut dec)?,
            new_renter_signature: dec.read_signature()?,
            renter_key: dec.read_pubkey()?,
            additional_collateral: dec.read_currency()?,
        };
        dec.finish()?;
        Ok(req)
    }
}

/// RenewContract response: host countersignatures on both revisions.
#[derive(Clone, Copy, Debug)]
pub struct RenewContractResponse {
    pub final_host_signature: Signature,
    pub new_host_signature: Signature,
}

impl RenewContractResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.write_signature(&self.final_host_signature);
        enc.write_signature(&self.new_host_signature);
        enc.finish()
    }

    pub fn decode(frame: &[u8]) -> Result<RenewContractResponse, WireError> {
        let mut dec = Decoder::new(frame);
        let resp = RenewContractResponse {
            final_host_signature: dec.read_signature()?,
            new_host_signature: dec.read_signature()?,
        };
        dec.finish()?;
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_revision() -> Revision {
        Revision {
            contract_id: ContractId(Hash256([1u8; 32])),
            revision_number: 3,
            filesize: SECTOR_SIZE as u64,
            file_merkle_root: Hash256([2u8; 32]),
            window_start: 100,
            window_end: 244,
            valid_renter_payout: Currency(1_000_000),
            valid_host_payout: Currency(5_000),
            missed_renter_payout: Currency(1_000_000),
            missed_host_payout: Currency(4_000),
        }
    }

    #[test]
    fn test_price_table_roundtrip() {
        let pt = PriceTable::generate(&Default::default(), 42);
        let decoded = PriceTable::decode(&pt.encode()).expect("decode");
        assert_eq!(decoded, pt);
    }

    #[test]
    fn test_payment_roundtrip() {
        let account = Payment::Account(AccountPayment {
            account: PublicKey([7u8; 32]),
            amount: Currency(999),
            nonce: 12345,
            expiry_height: 500,
            signature: Signature([8u8; 64]),
        });
        match Payment::decode(&account.encode()).expect("decode") {
            Payment::Account(p) => {
                assert_eq!(p.account, PublicKey([7u8; 32]));
                assert_eq!(p.amount, Currency(999));
                assert_eq!(p.nonce, 12345);
                assert_eq!(p.expiry_height, 500);
            }
            other => panic!("wrong variant: {other:?}"),
        }

        let contract = Payment::Contract(ContractPayment {
            revision: sample_revision(),
            renter_signature: Signature([9u8; 64]),
        });
        match Payment::decode(&contract.encode()).expect("decode") {
            Payment::Contract(p) => assert_eq!(p.revision, sample_revision()),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_payment_rejects_unknown_tag() {
        let mut enc = Encoder::new();
        enc.write_u8(9);
        enc.write_bytes(&[]);
        assert!(Payment::decode(&enc.finish()).is_err());
    }

    #[test]
    fn test_append_request_roundtrip() {
        let req = AppendSectorRequest {
            revision: sample_revision(),
            renter_signature: Signature([5u8; 64]),
            sector: vec![0xA5; SECTOR_SIZE],
        };
        let decoded = AppendSectorRequest::decode(&req.encode()).expect("decode");
        assert_eq!(decoded.revision, req.revision);
        assert_eq!(decoded.sector.len(), SECTOR_SIZE);
    }

    #[test]
    fn test_append_request_rejects_oversized_sector() {
        let req = AppendSectorRequest {
            revision: sample_revision(),
            renter_signature: Signature([5u8; 64]),
            sector: vec![0xA5; SECTOR_SIZE + 1],
        };
        assert!(AppendSectorRequest::decode(&req.encode()).is_err());
    }

    #[test]
    fn test_renew_request_roundtrip() {
        let req = RenewContractRequest {
            final_revision: sample_revision(),
            final_renter_signature: Signature([1u8; 64]),
            new_revision: sample_revision(),
            new_renter_signature: Signature([2u8; 64]),
            renter_key: PublicKey([3u8; 32]),
            additional_collateral: Currency(777),
        };
        let decoded = RenewContractRequest::decode(&req.encode()).expect("decode");
        assert_eq!(decoded.renter_key, PublicKey([3u8; 32]));
        assert_eq!(decoded.additional_collateral, Currency(777));
        assert_eq!(decoded.new_revision, req.new_revision);
    }

    #[test]
    fn test_withdrawal_digest_binds_fields() {
        let account = PublicKey([1u8; 32]);
        let base = AccountPayment::digest(&account, Currency(10), 1, 100);
        assert_ne!(base, AccountPayment::digest(&account, Currency(11), 1, 100));
        assert_ne!(base, AccountPayment::digest(&account, Currency(10), 2, 100));
        assert_ne!(base, AccountPayment::digest(&account, Currency(10), 1, 101));
        assert_ne!(
            base,
            AccountPayment::digest(&PublicKey([2u8; 32]), Currency(10), 1, 100)
        );
    }
}
