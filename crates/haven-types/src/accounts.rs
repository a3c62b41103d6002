//! Ephemeral account model for micro-payment metering.

use serde::{Deserialize, Serialize};

use crate::{Currency, PublicKey};

/// An account is addressed by its controlling public key.
pub type AccountId = PublicKey;

/// A prepaid account balance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// The controlling key.
    pub id: AccountId,
    /// Current balance. Never negative; never above the host's
    /// configured maximum.
    pub balance: Currency,
    /// Height at which the most recent deposit lapses.
    pub expiration_height: u64,
}
