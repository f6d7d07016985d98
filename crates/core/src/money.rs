use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

use crate::error::LedgerError;

/// Largest magnitude the ledger accepts, in minor units (a trillion riyals).
pub const MAX_ABS_CENTS: i64 = 100_000_000_000_000;

/// Fixed-point currency amount with two fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Money(Decimal::new(cents, 2))
    }

    /// Accepts a decimal only if it fits in two fractional digits and the ledger's range.
    pub fn try_from_decimal(decimal: Decimal) -> Result<Self, LedgerError> {
        let rounded = decimal.round_dp(2);
        if rounded != decimal {
            return Err(LedgerError::PrecisionOverflow(format!(
                "{decimal} has more than two fractional digits"
            )));
        }
        let money = Money(rounded);
        money.try_to_cents()?;
        Ok(money)
    }

    /// Rounds to two digits instead of rejecting; used by extractors reading noisy text.
    pub fn from_decimal_lossy(decimal: Decimal) -> Option<Self> {
        let money = Money(decimal.round_dp(2));
        money.try_to_cents().ok().map(|_| money)
    }

    /// Fails on a sub-cent remainder instead of truncating it.
    pub fn try_to_cents(self) -> Result<i64, LedgerError> {
        let scaled = self
            .0
            .checked_mul(Decimal::ONE_HUNDRED)
            .ok_or_else(|| LedgerError::PrecisionOverflow(format!("{} is out of range", self.0)))?;
        if !scaled.fract().is_zero() {
            return Err(LedgerError::PrecisionOverflow(format!(
                "{} has more than two fractional digits",
                self.0
            )));
        }
        let cents = scaled
            .to_i64()
            .filter(|c| c.checked_abs().is_some_and(|abs| abs <= MAX_ABS_CENTS))
            .ok_or_else(|| LedgerError::PrecisionOverflow(format!("{} is out of range", self.0)))?;
        Ok(cents)
    }

    pub fn zero() -> Self {
        Money(Decimal::ZERO)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self, LedgerError> {
        let sum = self
            .0
            .checked_add(rhs.0)
            .ok_or_else(|| LedgerError::PrecisionOverflow(format!("{} + {}", self.0, rhs.0)))?;
        Money::try_from_decimal(sum)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self {
        Money(-self.0)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl FromStr for Money {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decimal = Decimal::from_str(s.trim())
            .map_err(|e| LedgerError::PrecisionOverflow(format!("'{s}': {e}")))?;
        Money::try_from_decimal(decimal)
    }
}
