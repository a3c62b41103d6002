//! Ephemeral account rows.

use haven_types::{Account, AccountId, Currency};
use rusqlite::{Connection, OptionalExtension};

use crate::queries::column_currency;
use crate::{Error, Result};

/// Fetch an account, or `None` if it has never been funded.
pub fn get(conn: &Connection, id: &AccountId) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            "SELECT balance, expiration_height FROM accounts WHERE account_id=?1",
            [id.as_bytes().as_slice()],
            |row| {
                Ok(Account {
                    id: *id,
                    balance: column_currency(row, 0)?,
                    expiration_height: row.get::<_, i64>(1)? as u64,
                })
            },
        )
        .optional()?;
    Ok(account)
}

/// Add funds to an account, creating it on first use. Returns the new
/// balance. The caller enforces the balance cap before calling.
pub fn credit(
    conn: &Connection,
    id: &AccountId,
    amount: Currency,
    expiration_height: u64,
    timestamp: u64,
) -> Result<Currency> {
    let balance = get(conn, id)?.map(|a| a.balance).unwrap_or(Currency::ZERO);
    let new_balance = balance
        .checked_add(amount)
        .ok_or_else(|| Error::InvalidRow("account balance overflow".into()))?;
    conn.execute(
        "INSERT INTO accounts (account_id, balance, expiration_height, last_used)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(account_id) DO UPDATE SET
             balance=excluded.balance,
             expiration_height=excluded.expiration_height,
             last_used=excluded.last_used",
        rusqlite::params![
            id.as_bytes().as_slice(),
            new_balance.to_be_bytes().as_slice(),
            expiration_height as i64,
            timestamp as i64
        ],
    )?;
    Ok(new_balance)
}

/// Withdraw funds. Fails without touching the row when the balance is
/// short; the error carries the shortfall quantities.
pub fn debit(
    conn: &Connection,
    id: &AccountId,
    amount: Currency,
    timestamp: u64,
) -> Result<Currency> {
    let account = get(conn, id)?.ok_or(Error::NotFound("account"))?;
    let new_balance = account
        .balance
        .checked_sub(amount)
        .ok_or(Error::InsufficientFunds {
            balance: account.balance.0,
            amount: amount.0,
        })?;
    conn.execute(
        "UPDATE accounts SET balance=?1, last_used=?2 WHERE account_id=?3",
        rusqlite::params![
            new_balance.to_be_bytes().as_slice(),
            timestamp as i64,
            id.as_bytes().as_slice()
        ],
    )?;
    Ok(new_balance)
}

/// Delete zero-balance accounts unused since `before`. Returns the number
/// removed.
pub fn prune(conn: &Connection, before: u64) -> Result<usize> {
    let removed = conn.execute(
        "DELETE FROM accounts WHERE balance=?1 AND last_used < ?2",
        rusqlite::params![Currency::ZERO.to_be_bytes().as_slice(), before as i64],
    )?;
    Ok(removed)
}

/// Number of funded accounts and their aggregate balance.
pub fn totals(conn: &Connection) -> Result<(u64, Currency)> {
    let mut stmt = conn.prepare("SELECT balance FROM accounts")?;
    let balances = stmt
        .query_map([], |row| column_currency(row, 0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let count = balances.len() as u64;
    let total = balances.into_iter().sum();
    Ok((count, total))
}
