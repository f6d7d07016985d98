use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-point score in `[0.00, 1.00]`, always held at two fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Confidence(Decimal);

impl Confidence {
    pub const ZERO: Confidence = Confidence(Decimal::ZERO);
    pub const ONE: Confidence = Confidence(Decimal::ONE);

    pub fn new(value: Decimal) -> Self {
        Confidence(value.clamp(Decimal::ZERO, Decimal::ONE).round_dp(2))
    }

    /// Non-finite input collapses to zero.
    pub fn from_f32(value: f32) -> Self {
        Decimal::from_f32(value).map(Confidence::new).unwrap_or(Confidence::ZERO)
    }

    pub fn from_hundredths(hundredths: i64) -> Self {
        Confidence::new(Decimal::new(hundredths, 2))
    }

    pub fn hundredths(self) -> i64 {
        (self.0 * Decimal::ONE_HUNDRED).to_i64().unwrap_or(0)
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    pub fn as_f32(self) -> f32 {
        self.0.to_f32().unwrap_or(0.0)
    }

    pub fn saturating_add(self, delta: Decimal) -> Self {
        Confidence::new(self.0 + delta)
    }

    /// Returns the lower of `self` and `ceiling`.
    pub fn cap(self, ceiling: Confidence) -> Self {
        self.min(ceiling)
    }

    /// The largest score strictly below `self`; keeps incomplete candidates under a threshold.
    pub fn just_below(self) -> Self {
        Confidence::new(self.0 - Decimal::new(1, 2))
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Confidence::ZERO
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}
