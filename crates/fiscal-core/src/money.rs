//! # Money Module
//!
//! Provides the `Money` and `TaxRate` types for handling monetary values
//! safely.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  round(450.00 / 1.16, 2) in floating point depends on how 1.16 is       │
//! │  represented. Two runs that disagree by one cent produce a document    │
//! │  the authority rejects (Subtotal + Tax != Total).                      │
//! │                                                                         │
//! │  OUR SOLUTION: Integer Cents + Basis Points                             │
//! │    45000 cents, 1600 bps                                                │
//! │    subtotal = round_half_up(45000 × 10000 / 11600) = 38793              │
//! │    tax      = 45000 - 38793 = 6207                                      │
//! │    The sum is exact by construction                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use fiscal_core::money::Money;
//!
//! let total: Money = "450.00".parse().unwrap();
//! assert_eq!(total.cents(), 45000);
//! assert_eq!(total.to_decimal_string(), "450.00");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub, SubAssign};
use std::str::FromStr;
use ts_rs::TS;

use crate::error::ValidationError;

/// Basis points in one whole (100%).
pub const BPS_SCALE: i64 = 10_000;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in cents of the invoice currency.
///
/// ## Design Decisions
/// - **i64 (signed)**: negative values are representable so that validation
///   can report them, but no invoice is ever composed from one
/// - **Single field tuple struct**: Zero-cost abstraction over i64
/// - **Serde as integer cents**: records and JSON columns store cents; the
///   certification payload opts into decimal strings via [`decimal`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from cents (the smallest currency unit).
    ///
    /// ## Example
    /// ```rust
    /// use fiscal_core::money::Money;
    ///
    /// let price = Money::from_cents(11600); // 116.00
    /// assert_eq!(price.cents(), 11600);
    /// ```
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Returns the value in cents.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns the major unit portion (truncated toward zero).
    #[inline]
    pub const fn major(&self) -> i64 {
        self.0 / 100
    }

    /// Returns the minor unit portion (always 0-99).
    #[inline]
    pub const fn cents_part(&self) -> i64 {
        (self.0 % 100).abs()
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Checks if the value is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checks if the value is negative (less than zero).
    #[inline]
    pub const fn is_negative(&self) -> bool {
        self.0 < 0
    }

    /// Returns the absolute value.
    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Adds two amounts, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, other: Money) -> Option<Money> {
        match self.0.checked_add(other.0) {
            Some(cents) => Some(Money(cents)),
            None => None,
        }
    }

    /// Formats the amount the way the certification authority expects:
    /// two decimals, no currency symbol, no thousands separator.
    ///
    /// ## Example
    /// ```rust
    /// use fiscal_core::money::Money;
    ///
    /// assert_eq!(Money::from_cents(38793).to_decimal_string(), "387.93");
    /// assert_eq!(Money::from_cents(-550).to_decimal_string(), "-5.50");
    /// assert_eq!(Money::from_cents(7).to_decimal_string(), "0.07");
    /// ```
    pub fn to_decimal_string(&self) -> String {
        let sign = if self.0 < 0 { "-" } else { "" };
        format!("{}{}.{:02}", sign, self.major().abs(), self.cents_part())
    }

    /// Formats `self / quantity` with six decimals, truncating nothing that
    /// a six-decimal value can hold and rounding half up beyond that.
    ///
    /// Used for the unit value of per-item lines where the subtotal does not
    /// divide evenly by the quantity.
    ///
    /// ## Example
    /// ```rust
    /// use fiscal_core::money::Money;
    ///
    /// assert_eq!(Money::from_cents(1000).unit_value_string(3), "3.333333");
    /// assert_eq!(Money::from_cents(1000).unit_value_string(1), "10.000000");
    /// ```
    pub fn unit_value_string(&self, quantity: i64) -> String {
        let quantity = quantity.max(1) as i128;
        // cents → millionths of a unit: × 10_000
        let scaled = self.0 as i128 * 10_000;
        let micros = if scaled >= 0 {
            (2 * scaled + quantity) / (2 * quantity)
        } else {
            -((2 * -scaled + quantity) / (2 * quantity))
        };
        let sign = if micros < 0 { "-" } else { "" };
        let micros = micros.abs();
        format!("{}{}.{:06}", sign, micros / 1_000_000, micros % 1_000_000)
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Display implementation shows money in a human-readable format.
///
/// ## Note
/// For logs and CLI output. Payload documents use [`Money::to_decimal_string`].
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        write!(f, "{}${}.{:02}", sign, self.major().abs(), self.cents_part())
    }
}

/// Parses a decimal amount such as `"116"`, `"116.5"` or `"116.00"`.
///
/// More than two fractional digits is rejected rather than rounded: an
/// amount that does not fit in cents did not come from this system.
impl FromStr for Money {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidFormat {
            field: "amount".to_string(),
            reason: format!("'{}': {}", s, reason),
        };

        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed),
        };

        let (major, minor) = match digits.split_once('.') {
            Some((major, minor)) => (major, minor),
            None => (digits, ""),
        };

        if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("expected digits before the decimal point"));
        }
        if minor.len() > 2 || !minor.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("at most two decimal digits are allowed"));
        }

        let major: i64 = major.parse().map_err(|_| invalid("amount too large"))?;
        let minor: i64 = match minor.len() {
            0 => 0,
            1 => minor.parse::<i64>().map_err(|_| invalid("bad cents"))? * 10,
            _ => minor.parse().map_err(|_| invalid("bad cents"))?,
        };

        let cents = major
            .checked_mul(100)
            .and_then(|c| c.checked_add(minor))
            .ok_or_else(|| invalid("amount too large"))?;

        Ok(Money(if negative { -cents } else { cents }))
    }
}

/// Default money is zero.
impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

impl Mul<i64> for Money {
    type Output = Self;

    #[inline]
    fn mul(self, qty: i64) -> Self {
        Money(self.0 * qty)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::zero(), Add::add)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

// =============================================================================
// Decimal Serde Adapter
// =============================================================================

/// Serializes [`Money`] as a `"0.00"` string.
///
/// ```rust
/// use fiscal_core::money::Money;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Line {
///     #[serde(with = "fiscal_core::money::decimal")]
///     importe: Money,
/// }
///
/// let json = serde_json::to_string(&Line { importe: Money::from_cents(6207) }).unwrap();
/// assert_eq!(json, r#"{"importe":"62.07"}"#);
/// ```
pub mod decimal {
    use super::Money;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Money, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_decimal_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Money, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

// =============================================================================
// Tax Rate
// =============================================================================

/// Tax rate represented in basis points (bps).
///
/// ## Why Basis Points?
/// 1 basis point = 0.01% = 1/10000
/// 1600 bps = 16% (VAT), rendered on the document as `"0.160000"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct TaxRate(u32);

impl TaxRate {
    /// Creates a tax rate from basis points.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Creates a tax rate from a fraction (`0.16` = 16%).
    ///
    /// Rejects negative, non-finite and >= 100% rates.
    pub fn from_fraction(fraction: f64) -> Result<Self, ValidationError> {
        if !fraction.is_finite() || !(0.0..1.0).contains(&fraction) {
            return Err(ValidationError::InvalidFormat {
                field: "tax.rate".to_string(),
                reason: format!("{} is not a fraction in [0, 1)", fraction),
            });
        }
        Ok(TaxRate((fraction * BPS_SCALE as f64).round() as u32))
    }

    /// Returns the rate in basis points.
    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Renders the rate as the six-decimal fraction used in `TasaOCuota`.
    ///
    /// ```rust
    /// use fiscal_core::money::TaxRate;
    ///
    /// assert_eq!(TaxRate::from_bps(1600).to_fraction_string(), "0.160000");
    /// assert_eq!(TaxRate::from_bps(800).to_fraction_string(), "0.080000");
    /// ```
    pub fn to_fraction_string(&self) -> String {
        // bps → millionths: × 100
        let micros = self.0 as u64 * 100;
        format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000)
    }
}

impl Default for TaxRate {
    fn default() -> Self {
        TaxRate::from_bps(crate::DEFAULT_TAX_RATE_BPS)
    }
}

impl fmt::Display for TaxRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}%", self.0 / 100, self.0 % 100)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_string() {
        assert_eq!(Money::from_cents(45000).to_decimal_string(), "450.00");
        assert_eq!(Money::from_cents(0).to_decimal_string(), "0.00");
        assert_eq!(Money::from_cents(-1).to_decimal_string(), "-0.01");
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Money::from_cents(1099)), "$10.99");
        assert_eq!(format!("{}", Money::from_cents(-550)), "-$5.50");
    }

    #[test]
    fn test_parse_amounts() {
        assert_eq!("116".parse::<Money>().unwrap().cents(), 11600);
        assert_eq!("116.5".parse::<Money>().unwrap().cents(), 11650);
        assert_eq!("116.05".parse::<Money>().unwrap().cents(), 11605);
        assert_eq!("-5.50".parse::<Money>().unwrap().cents(), -550);
        assert_eq!(" 0.07 ".parse::<Money>().unwrap().cents(), 7);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Money>().is_err());
        assert!(".50".parse::<Money>().is_err());
        assert!("1.005".parse::<Money>().is_err());
        assert!("12a.00".parse::<Money>().is_err());
        assert!("1.-5".parse::<Money>().is_err());
        assert!("99999999999999999999".parse::<Money>().is_err());
    }

    #[test]
    fn test_unit_value_string() {
        assert_eq!(Money::from_cents(999).unit_value_string(1), "9.990000");
        assert_eq!(Money::from_cents(200).unit_value_string(3), "0.666667");
        assert_eq!(Money::from_cents(0).unit_value_string(4), "0.000000");
    }

    #[test]
    fn test_sum() {
        let amounts = [Money::from_cents(10000), Money::from_cents(15000), Money::from_cents(20000)];
        let total: Money = amounts.iter().sum();
        assert_eq!(total.cents(), 45000);
    }

    #[test]
    fn test_decimal_serde_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "decimal")]
            amount: Money,
        }

        let json = serde_json::to_string(&Wrapper { amount: Money::from_cents(38793) }).unwrap();
        assert_eq!(json, r#"{"amount":"387.93"}"#);

        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.amount.cents(), 38793);

        assert!(serde_json::from_str::<Wrapper>(r#"{"amount":"1.234"}"#).is_err());
    }

    #[test]
    fn test_tax_rate_from_fraction() {
        assert_eq!(TaxRate::from_fraction(0.16).unwrap().bps(), 1600);
        assert_eq!(TaxRate::from_fraction(0.0).unwrap().bps(), 0);
        assert!(TaxRate::from_fraction(-0.1).is_err());
        assert!(TaxRate::from_fraction(1.0).is_err());
        assert!(TaxRate::from_fraction(f64::NAN).is_err());
    }

    #[test]
    fn test_tax_rate_default_and_display() {
        assert_eq!(TaxRate::default().bps(), 1600);
        assert_eq!(TaxRate::from_bps(1600).to_string(), "16.00%");
        assert_eq!(TaxRate::from_bps(825).to_string(), "8.25%");
    }
}
