use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token amount in the chain's smallest indivisible unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or(MoneyError::Overflow)
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self, MoneyError> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or(MoneyError::Underflow)
    }

    /// Basis-point share of an amount. Integer units, so shares round down.
    pub fn share_bps(self, bps: u16) -> Result<Self, MoneyError> {
        if bps > 10_000 {
            return Err(MoneyError::InvalidShare(bps));
        }
        Ok(Self(
            (u128::from(self.0) * u128::from(bps) / 10_000) as u64,
        ))
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount overflow")]
    Overflow,
    #[error("amount underflow")]
    Underflow,
    #[error("share {0} exceeds 10000 bps")]
    InvalidShare(u16),
}
