use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since the unix epoch, as reported by a ledger's clock
/// facility.
///
/// Deadline comparisons only ever happen against the clock of the ledger
/// the deadline lives on, never against the coordinator's wall clock.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    pub fn as_millis(self) -> u64 {
        self.0
    }

    pub fn plus(self, millis: u64) -> Self {
        Timestamp(self.0.saturating_add(millis))
    }

    pub fn minus(self, millis: u64) -> Self {
        Timestamp(self.0.saturating_sub(millis))
    }
}

impl From<u64> for Timestamp {
    fn from(millis: u64) -> Self {
        Timestamp(millis)
    }
}

impl From<Timestamp> for u64 {
    fn from(timestamp: Timestamp) -> u64 {
        timestamp.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
