use serde::{Deserialize, Serialize};
use std::fmt;

/// An amount in the smallest indivisible unit of its ledger.
///
/// All internal arithmetic is integer arithmetic; decimal conversion for
/// display purposes is a concern of external consumers.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn from_base_units(units: u64) -> Self {
        Amount(units)
    }

    pub fn as_base_units(self) -> u64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// `self * numerator / denominator`, computed without intermediate
    /// overflow. Returns `None` if `denominator` is zero.
    pub fn proportion(self, numerator: Amount, denominator: Amount) -> Option<Amount> {
        if denominator.is_zero() {
            return None;
        }

        let scaled = u128::from(self.0) * u128::from(numerator.0) / u128::from(denominator.0);

        #[allow(clippy::cast_possible_truncation)]
        Some(Amount(scaled as u64))
    }
}

impl From<u64> for Amount {
    fn from(units: u64) -> Self {
        Amount(units)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
