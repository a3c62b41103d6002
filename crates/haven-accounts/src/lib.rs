//! # haven-accounts
//!
//! The ephemeral account ledger. Renters prefund accounts from their
//! contracts and drain them through per-RPC micro-payments. Balances are
//! persisted rows; ordering within a single account is the store's write
//! serialization, so a debit can never observe a stale balance.

use std::sync::Arc;

use haven_db::{queries, RetryableError, Store, Transaction};
use haven_types::{AccountId, Currency, HostSettings};
use parking_lot::RwLock;

/// Error types for ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    /// The metadata store failed.
    #[error(transparent)]
    Store(haven_db::Error),

    /// A deposit would push the balance above the host's cap.
    #[error("max account balance exceeded: balance {balance} + deposit {deposit} > max {max}")]
    MaxBalanceExceeded {
        balance: u128,
        deposit: u128,
        max: u128,
    },

    /// The balance cannot cover the debit.
    #[error("insufficient funds: balance {balance} < debit {amount}")]
    InsufficientFunds { balance: u128, amount: u128 },

    /// The account has never been funded.
    #[error("account not found")]
    NotFound,
}

impl From<haven_db::Error> for AccountError {
    fn from(err: haven_db::Error) -> Self {
        match err {
            haven_db::Error::InsufficientFunds { balance, amount } => {
                AccountError::InsufficientFunds { balance, amount }
            }
            haven_db::Error::NotFound("account") => AccountError::NotFound,
            other => AccountError::Store(other),
        }
    }
}

impl RetryableError for AccountError {
    fn is_busy(&self) -> bool {
        matches!(self, AccountError::Store(e) if e.is_busy())
    }
}

/// Convenience result type for ledger operations.
pub type Result<T> = std::result::Result<T, AccountError>;

/// Ledger over the persistent store.
pub struct AccountManager {
    store: Arc<Store>,
    settings: Arc<RwLock<HostSettings>>,
}

impl AccountManager {
    /// Create a ledger over the given store.
    pub fn new(store: Arc<Store>, settings: Arc<RwLock<HostSettings>>) -> Self {
        AccountManager { store, settings }
    }

    /// Current balance; zero for an account that has never been funded.
    pub fn balance(&self, account: &AccountId) -> Result<Currency> {
        let balance = self
            .store
            .read(|conn| queries::accounts::get(conn, account))?
            .map(|a| a.balance)
            .unwrap_or(Currency::ZERO);
        Ok(balance)
    }

    /// Deposit inside the caller's transaction. Fails when the new
    /// balance would exceed the host's maximum; the deposit becomes
    /// durable with the surrounding transaction, before any RPC response
    /// is written.
    pub fn credit(
        &self,
        tx: &Transaction<'_>,
        account: &AccountId,
        amount: Currency,
        expiration_height: u64,
    ) -> Result<Currency> {
        let max = self.settings.read().max_account_balance;
        let balance = queries::accounts::get(tx, account)?
            .map(|a| a.balance)
            .unwrap_or(Currency::ZERO);
        match balance.checked_add(amount) {
            Some(new_balance) if new_balance <= max => {}
            _ => {
                return Err(AccountError::MaxBalanceExceeded {
                    balance: balance.0,
                    deposit: amount.0,
                    max: max.0,
                })
            }
        }
        let balance =
            queries::accounts::credit(tx, account, amount, expiration_height, unix_timestamp())?;
        tracing::debug!(account = %account, amount = amount.0, balance = balance.0,
            "credited account");
        Ok(balance)
    }

    /// Withdraw inside the caller's transaction. Fails with
    /// [`AccountError::InsufficientFunds`] when the balance is short,
    /// leaving the row untouched.
    pub fn debit(
        &self,
        tx: &Transaction<'_>,
        account: &AccountId,
        amount: Currency,
    ) -> Result<Currency> {
        let balance = queries::accounts::debit(tx, account, amount, unix_timestamp())?;
        tracing::debug!(account = %account, amount = amount.0, balance = balance.0,
            "debited account");
        Ok(balance)
    }

    /// Delete zero-balance accounts unused since `before`.
    pub fn prune(&self, before: u64) -> Result<usize> {
        let removed = self
            .store
            .transaction(|tx| queries::accounts::prune(tx, before).map_err(AccountError::from))?;
        if removed > 0 {
            tracing::info!(removed, "pruned stale accounts");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for AccountManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountManager").finish_non_exhaustive()
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_types::PublicKey;

    fn fixture() -> (Arc<Store>, AccountManager) {
        let store = Arc::new(Store::open_memory().expect("open"));
        let settings = Arc::new(RwLock::new(HostSettings {
            max_account_balance: Currency(1000),
            ..Default::default()
        }));
        let manager = AccountManager::new(store.clone(), settings);
        (store, manager)
    }

    #[test]
    fn test_credit_and_balance() {
        let (store, manager) = fixture();
        let account = PublicKey([1u8; 32]);
        let balance = store
            .transaction(|tx| manager.credit(tx, &account, Currency(500), 100))
            .expect("credit");
        assert_eq!(balance, Currency(500));
        assert_eq!(manager.balance(&account).expect("balance"), Currency(500));
    }

    #[test]
    fn test_credit_respects_cap() {
        let (store, manager) = fixture();
        let account = PublicKey([1u8; 32]);
        store
            .transaction(|tx| manager.credit(tx, &account, Currency(900), 100))
            .expect("credit");

        let err = store
            .transaction(|tx| manager.credit(tx, &account, Currency(200), 100))
            .expect_err("cap must hold");
        assert!(matches!(err, AccountError::MaxBalanceExceeded { .. }));
        assert_eq!(manager.balance(&account).expect("balance"), Currency(900));

        // A deposit landing exactly on the cap is fine.
        store
            .transaction(|tx| manager.credit(tx, &account, Currency(100), 100))
            .expect("credit to cap");
        assert_eq!(manager.balance(&account).expect("balance"), Currency(1000));
    }

    #[test]
    fn test_debit_ordering_invariants() {
        let (store, manager) = fixture();
        let account = PublicKey([1u8; 32]);
        store
            .transaction(|tx| manager.credit(tx, &account, Currency(300), 100))
            .expect("credit");

        // Interleaved credits and debits: every intermediate balance
        // stays within [0, max] and the final balance is the running sum.
        let ops: [(bool, u128); 6] = [
            (false, 100),
            (true, 250),
            (false, 200),
            (true, 400),
            (false, 150),
            (true, 100),
        ];
        let mut expected = 300u128;
        for (is_credit, amount) in ops {
            let balance = store
                .transaction(|tx| {
                    if is_credit {
                        manager.credit(tx, &account, Currency(amount), 100)
                    } else {
                        manager.debit(tx, &account, Currency(amount))
                    }
                })
                .expect("op");
            expected = if is_credit {
                expected + amount
            } else {
                expected - amount
            };
            assert_eq!(balance.0, expected);
            assert!(balance.0 <= 1000);
        }
        assert_eq!(manager.balance(&account).expect("balance").0, expected);
    }

    #[test]
    fn test_overdraft_rejected_without_change() {
        let (store, manager) = fixture();
        let account = PublicKey([1u8; 32]);
        store
            .transaction(|tx| manager.credit(tx, &account, Currency(100), 100))
            .expect("credit");

        let err = store
            .transaction(|tx| manager.debit(tx, &account, Currency(101)))
            .expect_err("overdraft");
        assert!(matches!(
            err,
            AccountError::InsufficientFunds {
                balance: 100,
                amount: 101
            }
        ));
        assert_eq!(manager.balance(&account).expect("balance"), Currency(100));
    }

    #[test]
    fn test_debit_unknown_account() {
        let (store, manager) = fixture();
        let err = store
            .transaction(|tx| manager.debit(tx, &PublicKey([9u8; 32]), Currency(1)))
            .expect_err("unknown account");
        assert!(matches!(err, AccountError::NotFound));
    }

    #[test]
    fn test_prune() {
        let (store, manager) = fixture();
        let account = PublicKey([1u8; 32]);
        store
            .transaction(|tx| {
                manager.credit(tx, &account, Currency(50), 100)?;
                manager.debit(tx, &account, Currency(50))
            })
            .expect("drain");

        // The account was just used, so a cutoff in the past spares it.
        assert_eq!(manager.prune(1).expect("prune"), 0);
        // A cutoff in the far future removes the drained account.
        assert_eq!(manager.prune(u64::MAX).expect("prune"), 1);
        assert_eq!(manager.balance(&account).expect("balance"), Currency::ZERO);
    }
}
