//! Ledger fixed-point amounts and rates.
//!
//! The ledger stores every monetary value as an unsigned integer count of
//! base units with [`LEDGER_DECIMALS`] fractional digits, and every rate in
//! basis points. All arithmetic that must agree with ledger-reported values
//! is done on those integers; [`Decimal`] only appears at the edges where
//! humans read or type values.
//!
//! # Conversion Rules
//!
//! - A decimal with more fractional digits than the ledger supports is
//!   rejected, never rounded. Silently rounding a user-entered value would
//!   submit a different amount than the one displayed.
//! - Negative values are rejected.
//! - Amounts serialize as decimal strings (`"2.6375"`) so that JSON
//!   consumers never lose precision through floating point.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of fractional digits in the ledger's fixed-point encoding.
pub const LEDGER_DECIMALS: u32 = 18;

/// Base units in one whole token (`10^LEDGER_DECIMALS`).
pub const UNITS_PER_WHOLE: u128 = 1_000_000_000_000_000_000;

/// Denominator of a basis-point rate.
pub const BPS_DENOMINATOR: u128 = 10_000;

/// Largest rate the ledger accepts, in basis points (10 000 %).
pub const MAX_RATE_BPS: u32 = 1_000_000;

// =============================================================================
// Error Types
// =============================================================================

/// Errors produced when converting or combining fixed-point values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AmountError {
    /// The value is negative.
    #[error("amount must not be negative: {0}")]
    Negative(Decimal),

    /// The value has more fractional digits than the ledger encodes.
    #[error("amount {value} has {scale} fractional digits, ledger supports {max}")]
    ExcessPrecision {
        /// The rejected value.
        value: Decimal,
        /// Its fractional digit count.
        scale: u32,
        /// The ledger's fractional digit count.
        max: u32,
    },

    /// The value does not fit the ledger (or decimal) representation.
    #[error("amount overflows the fixed-point representation")]
    Overflow,

    /// A textual amount could not be parsed.
    #[error("invalid amount literal: {0}")]
    Parse(String),

    /// A percent rate has a fraction finer than one basis point.
    #[error("rate {0}% is not representable in basis points")]
    RatePrecision(Decimal),

    /// A percent rate is negative or above [`MAX_RATE_BPS`].
    #[error("rate {0}% is out of range")]
    RateOutOfRange(Decimal),
}

// =============================================================================
// Amount
// =============================================================================

/// A non-negative ledger amount, held in base units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(u128);

impl Amount {
    /// The zero amount.
    pub const ZERO: Self = Self(0);

    /// Wraps a raw base-unit count as reported by the ledger.
    #[must_use]
    pub const fn from_base_units(units: u128) -> Self {
        Self(units)
    }

    /// Returns the raw base-unit count.
    #[must_use]
    pub const fn base_units(self) -> u128 {
        self.0
    }

    /// Returns `true` if the amount is zero.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Converts a decimal domain value into ledger base units.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Negative`], [`AmountError::ExcessPrecision`] or
    /// [`AmountError::Overflow`] when the value cannot be encoded exactly.
    pub fn from_decimal(value: Decimal) -> Result<Self, AmountError> {
        if value < Decimal::ZERO {
            return Err(AmountError::Negative(value));
        }
        let normalized = value.normalize();
        let scale = normalized.scale();
        if scale > LEDGER_DECIMALS {
            return Err(AmountError::ExcessPrecision {
                value,
                scale,
                max: LEDGER_DECIMALS,
            });
        }
        let mantissa = u128::try_from(normalized.mantissa()).map_err(|_| AmountError::Overflow)?;
        let factor = 10u128.pow(LEDGER_DECIMALS - scale);
        mantissa
            .checked_mul(factor)
            .map(Self)
            .ok_or(AmountError::Overflow)
    }

    /// Converts the amount into a normalized decimal.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Overflow`] when the amount exceeds the 96-bit
    /// decimal mantissa (about 79 billion whole tokens).
    pub fn to_decimal(self) -> Result<Decimal, AmountError> {
        let units = i128::try_from(self.0).map_err(|_| AmountError::Overflow)?;
        Decimal::try_from_i128_with_scale(units, LEDGER_DECIMALS)
            .map(|d| d.normalize())
            .map_err(|_| AmountError::Overflow)
    }

    /// Checked addition.
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Checked subtraction.
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Saturating subtraction (floors at zero).
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Checked multiplication by an integer factor.
    #[must_use]
    pub const fn checked_mul(self, factor: u128) -> Option<Self> {
        match self.0.checked_mul(factor) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Floor division by an integer divisor. `None` when `divisor` is zero.
    #[must_use]
    pub const fn checked_div(self, divisor: u128) -> Option<Self> {
        match self.0.checked_div(divisor) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / UNITS_PER_WHOLE;
        let frac = self.0 % UNITS_PER_WHOLE;
        if frac == 0 {
            return write!(f, "{whole}");
        }
        let digits = format!("{frac:018}");
        write!(f, "{whole}.{}", digits.trim_end_matches('0'))
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (whole, frac) = s.split_once('.').unwrap_or((s, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(AmountError::Parse(s.to_string()));
        }
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if !all_digits(whole) || !all_digits(frac) {
            return Err(AmountError::Parse(s.to_string()));
        }
        if frac.len() > LEDGER_DECIMALS as usize {
            return Err(AmountError::Parse(format!(
                "{s}: more than {LEDGER_DECIMALS} fractional digits"
            )));
        }

        let whole_units = if whole.is_empty() {
            0
        } else {
            whole
                .parse::<u128>()
                .map_err(|_| AmountError::Overflow)?
                .checked_mul(UNITS_PER_WHOLE)
                .ok_or(AmountError::Overflow)?
        };
        let frac_units = if frac.is_empty() {
            0
        } else {
            let padded = format!("{frac:0<18}");
            padded
                .parse::<u128>()
                .map_err(|e| AmountError::Parse(e.to_string()))?
        };

        whole_units
            .checked_add(frac_units)
            .map(Self)
            .ok_or(AmountError::Overflow)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Rate
// =============================================================================

/// A rate in basis points, as the ledger stores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rate {
    bps: u32,
}

impl Rate {
    /// Builds a rate from basis points.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::RateOutOfRange`] above [`MAX_RATE_BPS`].
    pub fn from_bps(bps: u32) -> Result<Self, AmountError> {
        if bps > MAX_RATE_BPS {
            return Err(AmountError::RateOutOfRange(Decimal::new(
                i64::from(bps),
                2,
            )));
        }
        Ok(Self { bps })
    }

    /// Builds a rate from a percent value (`5.5` for 5.5 %).
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::RatePrecision`] for fractions finer than one
    /// basis point and [`AmountError::RateOutOfRange`] for negative or
    /// oversized rates.
    pub fn from_percent(percent: Decimal) -> Result<Self, AmountError> {
        if percent < Decimal::ZERO {
            return Err(AmountError::RateOutOfRange(percent));
        }
        let bps = percent * Decimal::ONE_HUNDRED;
        if !bps.fract().is_zero() {
            return Err(AmountError::RatePrecision(percent));
        }
        let bps = bps
            .to_u32()
            .ok_or(AmountError::RateOutOfRange(percent))?;
        if bps > MAX_RATE_BPS {
            return Err(AmountError::RateOutOfRange(percent));
        }
        Ok(Self { bps })
    }

    /// Returns the rate in basis points.
    #[must_use]
    pub const fn bps(self) -> u32 {
        self.bps
    }

    /// Returns the rate as a normalized percent decimal.
    #[must_use]
    pub fn as_percent(self) -> Decimal {
        Decimal::new(i64::from(self.bps), 2).normalize()
    }

    /// Applies the rate as a simple markup: `amount * (1 + rate)`, floored to
    /// the base unit exactly as the ledger does.
    ///
    /// # Errors
    ///
    /// Returns [`AmountError::Overflow`] if the product overflows.
    pub fn apply_markup(self, amount: Amount) -> Result<Amount, AmountError> {
        amount
            .checked_mul(BPS_DENOMINATOR + u128::from(self.bps))
            .and_then(|scaled| scaled.checked_div(BPS_DENOMINATOR))
            .ok_or(AmountError::Overflow)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_percent())
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let percent = Decimal::from_str(s.trim()).map_err(serde::de::Error::custom)?;
        Self::from_percent(percent).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_from_decimal_scales_to_base_units() {
        let amount = Amount::from_decimal(dec!(2.5)).unwrap();
        assert_eq!(amount.base_units(), 2_500_000_000_000_000_000);
        assert_eq!(amount.to_decimal().unwrap(), dec!(2.5));
    }

    #[test]
    fn test_from_decimal_rejects_excess_precision() {
        let err = Amount::from_decimal(dec!(0.0000000000000000001)).unwrap_err();
        assert!(matches!(err, AmountError::ExcessPrecision { scale: 19, .. }));
    }

    #[test]
    fn test_from_decimal_accepts_trailing_zeros_beyond_precision() {
        // 1.50000000000000000000 normalizes to 1.5
        let value = Decimal::from_i128_with_scale(150_000_000_000_000_000_000, 20);
        let amount = Amount::from_decimal(value).unwrap();
        assert_eq!(amount, "1.5".parse().unwrap());
    }

    #[test]
    fn test_from_decimal_rejects_negative() {
        assert!(matches!(
            Amount::from_decimal(dec!(-1)),
            Err(AmountError::Negative(_))
        ));
    }

    #[test]
    fn test_display_trims_fraction() {
        assert_eq!(Amount::from_base_units(UNITS_PER_WHOLE).to_string(), "1");
        assert_eq!(
            Amount::from_base_units(219_791_666_666_666_674).to_string(),
            "0.219791666666666674"
        );
        assert_eq!(Amount::ZERO.to_string(), "0");
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(
            "2.6375".parse::<Amount>().unwrap().base_units(),
            2_637_500_000_000_000_000
        );
        assert_eq!(".5".parse::<Amount>().unwrap().to_string(), "0.5");
        assert_eq!("7".parse::<Amount>().unwrap().to_string(), "7");
        assert!("1.2.3".parse::<Amount>().is_err());
        assert!("-1".parse::<Amount>().is_err());
        assert!("".parse::<Amount>().is_err());
        assert!("0.1234567890123456789".parse::<Amount>().is_err());
    }

    #[test]
    fn test_amount_serde_uses_strings() {
        let amount: Amount = "0.21979166".parse().unwrap();
        let json = serde_json::to_string(&amount).unwrap();
        assert_eq!(json, "\"0.21979166\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(back, amount);
    }

    #[test]
    fn test_rate_from_percent() {
        assert_eq!(Rate::from_percent(dec!(5.5)).unwrap().bps(), 550);
        assert_eq!(Rate::from_percent(dec!(0)).unwrap().bps(), 0);
        assert!(matches!(
            Rate::from_percent(dec!(5.555)),
            Err(AmountError::RatePrecision(_))
        ));
        assert!(matches!(
            Rate::from_percent(dec!(-1)),
            Err(AmountError::RateOutOfRange(_))
        ));
        assert!(Rate::from_percent(dec!(10001)).is_err());
    }

    #[test]
    fn test_rate_markup_matches_ledger_floor() {
        let rate = Rate::from_percent(dec!(5.5)).unwrap();
        let principal = Amount::from_decimal(dec!(2.5)).unwrap();
        let total = rate.apply_markup(principal).unwrap();
        assert_eq!(total.to_decimal().unwrap(), dec!(2.6375));

        // One base unit at 5.5% floors back to one base unit.
        let dust = rate.apply_markup(Amount::from_base_units(1)).unwrap();
        assert_eq!(dust.base_units(), 1);
    }

    #[test]
    fn test_rate_serde_as_percent_string() {
        let rate = Rate::from_bps(550).unwrap();
        assert_eq!(serde_json::to_string(&rate).unwrap(), "\"5.5\"");
        let back: Rate = serde_json::from_str("\"12.25\"").unwrap();
        assert_eq!(back.bps(), 1225);
    }
}
