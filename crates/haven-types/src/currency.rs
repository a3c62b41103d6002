//! Currency arithmetic for pricing and payouts.
//!
//! Amounts are unsigned 128-bit integers of the network's base unit. All
//! arithmetic used in pricing is checked; a debit can never underflow into
//! a negative balance and a price computation can never silently wrap.
//!
//! On the wire and in the database a currency value is a 16-byte
//! big-endian blob, so stored values sort lexicographically by magnitude.

use serde::{Deserialize, Serialize};

use crate::{Result, TypesError};

/// Base units per coin.
const UNITS_PER_COIN: u128 = 1_000_000_000_000;

/// An unsigned 128-bit currency amount.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Currency(pub u128);

impl Currency {
    /// The zero amount.
    pub const ZERO: Currency = Currency(0);

    /// The largest representable amount.
    pub const MAX: Currency = Currency(u128::MAX);

    /// Construct an amount of whole coins.
    pub fn coins(n: u64) -> Self {
        Currency(n as u128 * UNITS_PER_COIN)
    }

    /// True if the amount is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition.
    pub fn checked_add(self, other: Currency) -> Option<Currency> {
        self.0.checked_add(other.0).map(Currency)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Currency) -> Option<Currency> {
        self.0.checked_sub(other.0).map(Currency)
    }

    /// Checked multiplication by a unitless factor, for per-byte and
    /// per-block price scaling.
    pub fn checked_mul(self, factor: u64) -> Option<Currency> {
        self.0.checked_mul(factor as u128).map(Currency)
    }

    /// Addition that pins at [`Currency::MAX`] on overflow.
    pub fn saturating_add(self, other: Currency) -> Currency {
        Currency(self.0.saturating_add(other.0))
    }

    /// Multiplication by a unitless factor that pins at
    /// [`Currency::MAX`] on overflow.
    pub fn saturating_mul(self, factor: u64) -> Currency {
        Currency(self.0.saturating_mul(factor as u128))
    }

    /// Subtraction that pins at zero on underflow.
    pub fn saturating_sub(self, other: Currency) -> Currency {
        Currency(self.0.saturating_sub(other.0))
    }

    /// Encode as a 16-byte big-endian blob.
    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Decode from a 16-byte big-endian blob.
    pub fn from_be_bytes(bytes: [u8; 16]) -> Self {
        Currency(u128::from_be_bytes(bytes))
    }

    /// Decode from a byte slice. Fails unless the slice is exactly 16 bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 16] = bytes.try_into().map_err(|_| TypesError::InvalidLength {
            expected: 16,
            got: bytes.len(),
        })?;
        Ok(Self::from_be_bytes(arr))
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 >= UNITS_PER_COIN && self.0 % UNITS_PER_COIN == 0 {
            write!(f, "{} HC", self.0 / UNITS_PER_COIN)
        } else {
            write!(f, "{} base", self.0)
        }
    }
}

impl std::fmt::Debug for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Currency({})", self.0)
    }
}

impl std::iter::Sum for Currency {
    fn sum<I: Iterator<Item = Currency>>(iter: I) -> Currency {
        iter.fold(Currency::ZERO, |acc, c| acc.saturating_add(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coins() {
        assert_eq!(Currency::coins(1).0, UNITS_PER_COIN);
        assert_eq!(Currency::coins(0), Currency::ZERO);
    }

    #[test]
    fn test_checked_arithmetic() {
        let a = Currency(100);
        let b = Currency(30);
        assert_eq!(a.checked_add(b), Some(Currency(130)));
        assert_eq!(a.checked_sub(b), Some(Currency(70)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(Currency::MAX.checked_add(Currency(1)), None);
    }

    #[test]
    fn test_checked_mul() {
        assert_eq!(Currency(7).checked_mul(6), Some(Currency(42)));
        assert_eq!(Currency::MAX.checked_mul(2), None);
    }

    #[test]
    fn test_saturating() {
        assert_eq!(Currency(5).saturating_sub(Currency(10)), Currency::ZERO);
        assert_eq!(
            Currency::MAX.saturating_add(Currency(1)),
            Currency::MAX
        );
    }

    #[test]
    fn test_be_roundtrip() {
        let c = Currency(0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10);
        let bytes = c.to_be_bytes();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[15], 0x10);
        assert_eq!(Currency::from_be_bytes(bytes), c);
        assert_eq!(Currency::from_be_slice(&bytes).expect("slice"), c);
        assert!(Currency::from_be_slice(&bytes[..15]).is_err());
    }

    #[test]
    fn test_be_ordering_matches_value_ordering() {
        // Big-endian blobs must sort the same way the values do, so SQL
        // comparisons on stored blobs are meaningful.
        let small = Currency(5).to_be_bytes();
        let large = Currency(1 << 40).to_be_bytes();
        assert!(small.as_slice() < large.as_slice());
    }

    #[test]
    fn test_sum() {
        let total: Currency = [Currency(1), Currency(2), Currency(3)].into_iter().sum();
        assert_eq!(total, Currency(6));
    }
}
