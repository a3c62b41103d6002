//! Payment metering.
//!
//! Every priced RPC settles before (or atomically with) its action.
//! Account payments are signed withdrawal authorizations debited from
//! the ledger; contract payments are renter-signed revisions that shift
//! payout to the host and are applied through the contract manager so
//! the usage lands on the contract.

use haven_db::Transaction;
use haven_types::Currency;

use crate::messages::AccountPayment;
use crate::{Result, RhpError};

/// Check a withdrawal authorization against the advertised cost: it
/// must not be expired, must cover the amount, and must carry a valid
/// signature by the account key.
pub fn verify_account_payment(
    payment: &AccountPayment,
    required: Currency,
    height: u64,
) -> Result<()> {
    if payment.expiry_height < height {
        return Err(RhpError::PaymentExpired {
            expiry: payment.expiry_height,
            height,
        });
    }
    if payment.amount < required {
        return Err(RhpError::InvalidPayment(
            "authorized amount below advertised cost",
        ));
    }
    let digest = AccountPayment::digest(
        &payment.account,
        payment.amount,
        payment.nonce,
        payment.expiry_height,
    );
    payment
        .account
        .verify(&digest, &payment.signature)
        .map_err(|_| RhpError::InvalidPayment("withdrawal signature invalid"))?;
    Ok(())
}

/// Debit an account payment inside the caller's transaction and record
/// the revenue stats for the charged portion.
pub fn debit_account(
    tx: &Transaction<'_>,
    accounts: &haven_accounts::AccountManager,
    payment: &AccountPayment,
    charge: Currency,
    usage: &haven_types::Usage,
    timestamp: u64,
) -> Result<Currency> {
    let balance = accounts.debit(tx, &payment.account, charge)?;
    haven_db::queries::metrics::apply_usage(tx, usage, timestamp)?;
    Ok(balance)
}
